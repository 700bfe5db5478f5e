use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// One past execution of a task from a given public address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    pub public_ip: IpAddr,
    /// Coordinator time of execution, unix seconds.
    pub executed_at: i64,
}

/// Most recent execution time per `(task, public address)`.
///
/// Keyed by address as well as task so that history recorded from one address
/// family can never gate a task of the other family.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionHistory {
    latest: HashMap<(TaskId, IpAddr), i64>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the maximum timestamp seen for the key.
    pub fn insert(&mut self, task_id: TaskId, public_ip: IpAddr, executed_at: i64) {
        self.latest
            .entry((task_id, public_ip))
            .and_modify(|t| *t = (*t).max(executed_at))
            .or_insert(executed_at);
    }

    pub fn last_execution(&self, task_id: TaskId, public_ip: IpAddr) -> Option<i64> {
        self.latest.get(&(task_id, public_ip)).copied()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

impl FromIterator<ExecutionRecord> for ExecutionHistory {
    fn from_iter<I: IntoIterator<Item = ExecutionRecord>>(iter: I) -> Self {
        let mut history = Self::new();
        for r in iter {
            history.insert(r.task_id, r.public_ip, r.executed_at);
        }
        history
    }
}
