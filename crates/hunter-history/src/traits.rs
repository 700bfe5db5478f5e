use std::collections::BTreeSet;

use hunter_core::{Candidates, ExecutionHistory, ExecutionRecord, TaskId};

pub trait HistoryStore: Send + Sync {
    /// Latest execution per `(task, address)` for the given tasks, restricted
    /// to rows whose address is one of `candidates`. Tasks never executed from
    /// a candidate are absent from the result.
    fn last_executions(
        &self,
        task_ids: &BTreeSet<TaskId>,
        candidates: Candidates,
    ) -> anyhow::Result<ExecutionHistory>;

    /// Appends one execution. Called by the execution side, never by the
    /// admission pipeline.
    fn record_execution(&self, record: &ExecutionRecord) -> anyhow::Result<()>;

    /// All executions of one task, newest first.
    fn executions_of(&self, task_id: TaskId) -> anyhow::Result<Vec<ExecutionRecord>>;
}
