//! Per-cycle state of the task-list admission pipeline.
//!
//! `CycleContext` owns everything one fetch cycle learns. Each external call
//! the driver makes completes through exactly one transition method, which
//! records the result and returns the next [`Stage`].

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::history::ExecutionHistory;
use crate::identity::{AddressState, CoordinatorIdentity, PublicIdentity};
use crate::ids::TaskId;
use crate::model::{HuntingTask, IpVersion, PublicIpNotification, Record};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetching,
    ResolvingCoordinator,
    ResolvingV4,
    ResolvingV6,
    Querying,
    Deciding,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    fn resolving(version: IpVersion) -> Self {
        match version {
            IpVersion::V4 => Stage::ResolvingV4,
            IpVersion::V6 => Stage::ResolvingV6,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("transition expects stage {expected}, cycle is in {actual}")]
pub struct UnexpectedStage {
    pub expected: Stage,
    pub actual: Stage,
}

/// Tasks received in one fetch, plus the set of their ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskBatch {
    tasks: Vec<HuntingTask>,
    ids: BTreeSet<TaskId>,
}

impl TaskBatch {
    pub fn push(&mut self, task: HuntingTask) {
        self.ids.insert(task.id);
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn ids(&self) -> &BTreeSet<TaskId> {
        &self.ids
    }

    pub fn tasks(&self) -> &[HuntingTask] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<HuntingTask> {
        self.tasks
    }
}

/// What a decoded reply contained besides tasks, for the driver to act on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplyExtras {
    pub server_time: Option<i64>,
    pub notifications: Vec<PublicIpNotification>,
    pub unknown_kinds: Vec<u8>,
}

#[derive(Debug)]
pub struct CycleContext {
    stage: Stage,
    batch: TaskBatch,
    identity: PublicIdentity,
    coordinator: CoordinatorIdentity,
    history: ExecutionHistory,
}

impl Default for CycleContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleContext {
    pub fn new() -> Self {
        Self {
            stage: Stage::Fetching,
            batch: TaskBatch::default(),
            identity: PublicIdentity::default(),
            coordinator: CoordinatorIdentity::default(),
            history: ExecutionHistory::default(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn batch(&self) -> &TaskBatch {
        &self.batch
    }

    pub fn identity(&self) -> &PublicIdentity {
        &self.identity
    }

    pub fn coordinator(&self) -> &CoordinatorIdentity {
        &self.coordinator
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    fn expect(&self, expected: Stage) -> Result<(), UnexpectedStage> {
        if self.stage == expected {
            Ok(())
        } else {
            Err(UnexpectedStage {
                expected,
                actual: self.stage,
            })
        }
    }

    fn enter(&mut self, next: Stage) -> Stage {
        debug!("cycle stage {} -> {}", self.stage, next);
        self.stage = next;
        next
    }

    /// Absorbs a decoded reply. Tasks go into the batch, public IP
    /// notifications seed the identity. An empty batch ends the cycle.
    pub fn on_fetched(
        &mut self,
        records: Vec<Record>,
    ) -> Result<(Stage, ReplyExtras), UnexpectedStage> {
        self.expect(Stage::Fetching)?;

        let mut extras = ReplyExtras::default();
        for record in records {
            match record {
                Record::Task(task) => self.batch.push(task),
                Record::CurrentServerTime(t) => extras.server_time = Some(t),
                Record::PublicIpNotification(n) => {
                    self.identity.seed(n.public_ip);
                    extras.notifications.push(n);
                }
                Record::Unknown { kind } => extras.unknown_kinds.push(kind),
            }
        }

        let next = if self.batch.is_empty() {
            Stage::Done
        } else {
            Stage::ResolvingCoordinator
        };
        Ok((self.enter(next), extras))
    }

    pub fn on_fetch_failed(&mut self) -> Result<Stage, UnexpectedStage> {
        self.expect(Stage::Fetching)?;
        Ok(self.enter(Stage::Failed))
    }

    pub fn on_coordinator_resolved(
        &mut self,
        coordinator: CoordinatorIdentity,
    ) -> Result<Stage, UnexpectedStage> {
        self.expect(Stage::ResolvingCoordinator)?;
        self.coordinator = coordinator;
        let next = self.settle_from(IpVersion::V4);
        Ok(self.enter(next))
    }

    /// The coordinator address to ask for our public address, when the cycle
    /// is waiting on a lookup.
    pub fn pending_lookup(&self) -> Option<(IpVersion, IpAddr)> {
        let version = match self.stage {
            Stage::ResolvingV4 => IpVersion::V4,
            Stage::ResolvingV6 => IpVersion::V6,
            _ => return None,
        };
        self.coordinator.address(version).map(|addr| (version, addr))
    }

    /// Records the lookup result for `version`; `None` marks it unsupported.
    pub fn on_public_ip(
        &mut self,
        version: IpVersion,
        addr: Option<IpAddr>,
    ) -> Result<Stage, UnexpectedStage> {
        self.expect(Stage::resolving(version))?;
        let state = match addr {
            Some(addr) if IpVersion::of(&addr) == version => AddressState::Known(addr),
            _ => AddressState::Unsupported,
        };
        self.identity.set(version, state);
        let next = match version {
            IpVersion::V4 => self.settle_from(IpVersion::V6),
            IpVersion::V6 => Stage::Querying,
        };
        Ok(self.enter(next))
    }

    /// Walks the per-version decision table starting at `first`, settling
    /// every version that needs no lookup. Returns the stage that waits on the
    /// first lookup still needed, or `Querying` once both are settled.
    fn settle_from(&mut self, first: IpVersion) -> Stage {
        for version in IpVersion::ALL.into_iter().skip_while(|v| *v != first) {
            if self.coordinator.address(version).is_none() {
                self.identity.set(version, AddressState::Unsupported);
            } else if !self.identity.get(version).is_settled() {
                return Stage::resolving(version);
            }
        }
        Stage::Querying
    }

    pub fn on_history(&mut self, history: ExecutionHistory) -> Result<Stage, UnexpectedStage> {
        self.expect(Stage::Querying)?;
        self.history = history;
        Ok(self.enter(Stage::Deciding))
    }

    pub fn on_query_failed(&mut self) -> Result<Stage, UnexpectedStage> {
        self.expect(Stage::Querying)?;
        Ok(self.enter(Stage::Failed))
    }

    /// Hands the batch to the decision loop and ends the cycle.
    pub fn take_batch(&mut self) -> Result<TaskBatch, UnexpectedStage> {
        self.expect(Stage::Deciding)?;
        self.enter(Stage::Done);
        Ok(std::mem::take(&mut self.batch))
    }

    /// Public address state and last execution from that exact address.
    pub fn admission_inputs(&self, task: &HuntingTask) -> (AddressState, Option<i64>) {
        let address = self.identity.get(task.ip_version());
        let last = address
            .addr()
            .and_then(|addr| self.history.last_execution(task.id, addr));
        (address, last)
    }
}
