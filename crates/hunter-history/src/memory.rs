use std::collections::BTreeSet;
use std::sync::Mutex;

use hunter_core::{Candidates, ExecutionHistory, ExecutionRecord, TaskId};

use crate::traits::HistoryStore;

/// In-memory history for tests. Not durable.
#[derive(Default)]
pub struct InMemoryHistory {
    rows: Mutex<Vec<ExecutionRecord>>,
    queries: Mutex<usize>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ExecutionRecord>) -> Self {
        Self {
            rows: Mutex::new(records.into_iter().collect()),
            queries: Mutex::new(0),
        }
    }

    /// Number of `last_executions` calls served so far.
    pub fn query_count(&self) -> usize {
        *self.queries.lock().unwrap()
    }
}

impl HistoryStore for InMemoryHistory {
    fn last_executions(
        &self,
        task_ids: &BTreeSet<TaskId>,
        candidates: Candidates,
    ) -> anyhow::Result<ExecutionHistory> {
        *self.queries.lock().unwrap() += 1;
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|r| task_ids.contains(&r.task_id) && candidates.contains(&r.public_ip))
            .cloned()
            .collect())
    }

    fn record_execution(&self, record: &ExecutionRecord) -> anyhow::Result<()> {
        self.rows.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn executions_of(&self, task_id: TaskId) -> anyhow::Result<Vec<ExecutionRecord>> {
        let rows = self.rows.lock().unwrap();
        let mut out: Vec<_> = rows.iter().filter(|r| r.task_id == task_id).cloned().collect();
        out.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        Ok(out)
    }
}
