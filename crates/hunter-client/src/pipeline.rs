//! Drives one hunting cycle: fetch, resolve identity, query history, decide.

use std::sync::Arc;

use hunter_core::{
    admission_policy, CoordinatorIdentity, CycleContext, Decision, IpVersion, PublicIdentity,
    ServerClock, Stage, TaskId, UnexpectedStage,
};
use hunter_history::HistoryStore;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::fetcher::TaskSource;
use crate::notify::Notifier;
use crate::resolver::AddressResolver;
use crate::sink::ExecutionSink;

/// Everything a cycle talks to. Cheap to clone; shared across cycles.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn TaskSource>,
    pub resolver: Arc<dyn AddressResolver>,
    pub history: Arc<dyn HistoryStore>,
    pub sink: Arc<dyn ExecutionSink>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<ServerClock>,
}

/// Per-cycle settings, read from configuration once per cycle.
#[derive(Clone, Debug)]
pub struct CycleSettings {
    pub coordinator_host: String,
    pub cooldown_secs: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TaskDecision {
    pub task_id: TaskId,
    pub ip_version: IpVersion,
    pub decision: Decision,
}

/// What one cycle did.
#[derive(Clone, Debug, Serialize)]
pub struct CycleSummary {
    pub stage: Stage,
    pub fetched: usize,
    pub identity: PublicIdentity,
    pub coordinator: CoordinatorIdentity,
    /// Public IP lookups issued, in order.
    pub lookups: Vec<IpVersion>,
    /// Decisions in processing order.
    pub decisions: Vec<TaskDecision>,
    /// Tasks the policy could not decide on.
    pub defects: Vec<TaskId>,
    pub failure: Option<String>,
}

impl CycleSummary {
    fn new() -> Self {
        Self {
            stage: Stage::Fetching,
            fetched: 0,
            identity: PublicIdentity::default(),
            coordinator: CoordinatorIdentity::default(),
            lookups: vec![],
            decisions: vec![],
            defects: vec![],
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.stage == Stage::Done
    }

    pub fn admitted(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.decisions
            .iter()
            .filter(|d| d.decision.is_admit())
            .map(|d| d.task_id)
    }

    pub fn admitted_count(&self) -> usize {
        self.admitted().count()
    }
}

pub struct HuntingCycle {
    c: Collaborators,
    settings: CycleSettings,
    ctx: CycleContext,
    summary: CycleSummary,
}

impl HuntingCycle {
    pub fn new(collaborators: &Collaborators, settings: CycleSettings) -> Self {
        Self {
            c: collaborators.clone(),
            settings,
            ctx: CycleContext::new(),
            summary: CycleSummary::new(),
        }
    }

    /// Runs the cycle to completion. Never fails: every problem is reported to
    /// the notifier and reflected in the summary.
    pub async fn run<R: Rng>(mut self, rng: &mut R) -> CycleSummary {
        self.c
            .notifier
            .information("Pulling hunting tasks from coordinator");

        while !self.ctx.stage().is_terminal() {
            let step = match self.ctx.stage() {
                Stage::Fetching => self.fetch().await,
                Stage::ResolvingCoordinator => self.resolve_coordinator().await,
                Stage::ResolvingV4 => self.resolve_public_ip(IpVersion::V4).await,
                Stage::ResolvingV6 => self.resolve_public_ip(IpVersion::V6).await,
                Stage::Querying => self.query_history().await,
                Stage::Deciding => self.decide(rng),
                Stage::Done | Stage::Failed => break,
            };
            if let Err(e) = step {
                return self.abort(e);
            }
        }

        self.finish()
    }

    fn abort(mut self, e: UnexpectedStage) -> CycleSummary {
        self.c
            .notifier
            .technical_failure(&format!("hunting cycle aborted: {e}"), true);
        self.summary.failure = Some(e.to_string());
        let mut summary = self.finish();
        summary.stage = Stage::Failed;
        summary
    }

    /// Copies what the cycle learned into the summary.
    fn finish(mut self) -> CycleSummary {
        self.summary.stage = self.ctx.stage();
        self.summary.identity = *self.ctx.identity();
        self.summary.coordinator = *self.ctx.coordinator();
        self.summary
    }

    async fn fetch(&mut self) -> Result<Stage, UnexpectedStage> {
        let records = match self.c.source.fetch().await {
            Ok(records) => records,
            Err(e) => {
                let message = format!("could not retrieve hunting task list: {e}");
                // An unreachable coordinator is routine; anything else is not.
                self.c.notifier.technical_failure(&message, !e.is_transport());
                self.summary.failure = Some(message);
                return self.ctx.on_fetch_failed();
            }
        };

        let (stage, extras) = self.ctx.on_fetched(records)?;

        match extras.server_time {
            Some(t) => self.c.clock.calibrate(t),
            None => warn!(
                "reply carried no server time; using offset {}s",
                self.c.clock.offset()
            ),
        }
        for n in extras.notifications {
            self.c.sink.add_public_ip(n);
        }
        for kind in extras.unknown_kinds {
            self.c.notifier.technical_failure(
                &format!("received unknown record type {kind} from coordinator"),
                true,
            );
        }

        self.summary.fetched = self.ctx.batch().len();
        self.c.notifier.information(&format!(
            "Received {} tasks from coordinator",
            self.summary.fetched
        ));
        Ok(stage)
    }

    async fn resolve_coordinator(&mut self) -> Result<Stage, UnexpectedStage> {
        let host = &self.settings.coordinator_host;
        let identity = match self.c.resolver.coordinator_addresses(host).await {
            Ok(identity) => identity,
            Err(e) => {
                self.c.notifier.technical_failure(
                    &format!("could not determine coordinator addresses: {e}"),
                    false,
                );
                CoordinatorIdentity::default()
            }
        };
        self.ctx.on_coordinator_resolved(identity)
    }

    async fn resolve_public_ip(&mut self, version: IpVersion) -> Result<Stage, UnexpectedStage> {
        let addr = match self.ctx.pending_lookup() {
            Some((_, via)) => {
                self.summary.lookups.push(version);
                match self.c.resolver.public_ip(via, version).await {
                    Ok(Some(notification)) if notification.ip_version() == version => {
                        let addr = notification.public_ip;
                        self.c.sink.add_public_ip(notification);
                        Some(addr)
                    }
                    Ok(Some(notification)) => {
                        self.c.notifier.technical_failure(
                            &format!(
                                "public {version} lookup answered with {} address {}",
                                notification.ip_version(),
                                notification.public_ip
                            ),
                            false,
                        );
                        None
                    }
                    Ok(None) => None,
                    Err(e) => {
                        self.c.notifier.technical_failure(
                            &format!("could not determine public {version} address: {e}"),
                            false,
                        );
                        None
                    }
                }
            }
            None => None,
        };
        debug!("public {version} address: {addr:?}");
        self.ctx.on_public_ip(version, addr)
    }

    async fn query_history(&mut self) -> Result<Stage, UnexpectedStage> {
        let ids = self.ctx.batch().ids().clone();
        let candidates = self.ctx.identity().candidates();
        let store = Arc::clone(&self.c.history);

        let result = tokio::task::spawn_blocking(move || store.last_executions(&ids, candidates))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);

        match result {
            Ok(history) => self.ctx.on_history(history),
            Err(e) => {
                let message = format!("could not read execution history: {e:#}");
                self.c.notifier.technical_failure(&message, true);
                self.summary.failure = Some(message);
                self.ctx.on_query_failed()
            }
        }
    }

    /// Draws tasks uniformly at random from the remaining batch and decides
    /// each exactly once.
    fn decide<R: Rng>(&mut self, rng: &mut R) -> Result<Stage, UnexpectedStage> {
        let mut remaining = self.ctx.take_batch()?.into_tasks();
        let cooldown = self.settings.cooldown_secs;

        while !remaining.is_empty() {
            let task = remaining.swap_remove(rng.gen_range(0..remaining.len()));
            let (address, last) = self.ctx.admission_inputs(&task);

            match admission_policy(address, last, self.c.clock.now(), cooldown) {
                Ok(decision) => {
                    self.summary.decisions.push(TaskDecision {
                        task_id: task.id,
                        ip_version: task.ip_version(),
                        decision,
                    });
                    match decision {
                        Decision::Admit => self.c.sink.add_task(task),
                        Decision::Skip(reason) => {
                            debug!("task {} skipped: {reason:?}", task.id);
                            self.c
                                .notifier
                                .information(&format!("Skipping execution of task {}", task.id));
                        }
                    }
                }
                Err(defect) => {
                    self.c.notifier.technical_failure(
                        &format!("no admission decision for task {}: {defect}", task.id),
                        true,
                    );
                    self.summary.defects.push(task.id);
                }
            }
        }

        self.c.notifier.information(&format!(
            "Hunting task list processed. {} tasks have been accepted.",
            self.summary.admitted_count()
        ));
        Ok(self.ctx.stage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchError;
    use crate::resolver::ResolveError;
    use async_trait::async_trait;
    use hunter_core::{AddressState, HuntingTask, PublicIpNotification, Record, HASH_LEN};
    use hunter_history::InMemoryHistory;
    use std::net::IpAddr;

    struct OneTask;

    #[async_trait]
    impl TaskSource for OneTask {
        async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
            Ok(vec![Record::Task(HuntingTask {
                id: TaskId(1),
                target: "203.0.113.1".parse().unwrap(),
                port: 443,
                hostname: "example.org".into(),
                known_cert_hashes: vec![],
            })])
        }
    }

    struct V4Only;

    #[async_trait]
    impl AddressResolver for V4Only {
        async fn coordinator_addresses(&self, _host: &str) -> Result<CoordinatorIdentity, ResolveError> {
            Ok(CoordinatorIdentity::from_addrs(["192.0.2.1".parse().unwrap()]))
        }

        async fn public_ip(
            &self,
            _via: IpAddr,
            _version: IpVersion,
        ) -> Result<Option<PublicIpNotification>, ResolveError> {
            Ok(Some(PublicIpNotification {
                public_ip: "198.51.100.4".parse().unwrap(),
                hmac: [0; HASH_LEN],
            }))
        }
    }

    struct Quiet;

    impl ExecutionSink for Quiet {
        fn add_task(&self, _task: HuntingTask) {}
        fn add_public_ip(&self, _notification: PublicIpNotification) {}
    }

    impl Notifier for Quiet {
        fn information(&self, _message: &str) {}
        fn technical_failure(&self, _message: &str, _show_to_user: bool) {}
    }

    fn cycle() -> HuntingCycle {
        let collaborators = Collaborators {
            source: Arc::new(OneTask),
            resolver: Arc::new(V4Only),
            history: Arc::new(InMemoryHistory::new()),
            sink: Arc::new(Quiet),
            notifier: Arc::new(Quiet),
            clock: Arc::new(ServerClock::new()),
        };
        HuntingCycle::new(
            &collaborators,
            CycleSettings {
                coordinator_host: "coordinator.test".into(),
                cooldown_secs: 60,
            },
        )
    }

    #[tokio::test]
    async fn aborted_cycle_keeps_resolved_identity() {
        let mut cycle = cycle();
        cycle.fetch().await.unwrap();
        cycle.resolve_coordinator().await.unwrap();
        assert_eq!(cycle.resolve_public_ip(IpVersion::V4).await.unwrap(), Stage::Querying);

        let err = cycle.resolve_public_ip(IpVersion::V4).await.unwrap_err();
        let summary = cycle.abort(err);

        assert_eq!(summary.stage, Stage::Failed);
        assert!(summary.failure.is_some());
        assert_eq!(
            summary.identity.v4,
            AddressState::Known("198.51.100.4".parse().unwrap())
        );
        assert_eq!(summary.identity.v6, AddressState::Unsupported);
        assert_eq!(summary.coordinator.address(IpVersion::V4), Some("192.0.2.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn finished_cycle_reports_done() {
        let mut rng = rand::thread_rng();
        let summary = cycle().run(&mut rng).await;
        assert!(summary.is_success());
        assert_eq!(summary.admitted_count(), 1);
        assert!(!summary.coordinator.is_empty());
    }
}
