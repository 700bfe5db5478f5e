use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hunter_client::{
    CachingResolver, ChannelSink, Collaborators, Config, CycleSettings, CycleSummary, Handoff,
    HttpAddressResolver, HttpTaskSource, HuntingCycle, TracingNotifier,
};
use hunter_core::{now_unix, Decision, ExecutionRecord, ServerClock, SkipReason, TaskId};
use hunter_history::HistoryStore;
use hunter_history_sqlite::SqliteHistory;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hunter", version, about = "Pulls hunting tasks from a coordinator and admits them for execution")]
struct Cli {
    /// Config file. Defaults to ~/.hunter/hunter.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the default config (if missing) and create the history database
    Init,

    /// Run a single hunting cycle and print what was decided
    Hunt {
        #[arg(long)]
        json: bool,
    },

    /// Run hunting cycles at the configured interval until interrupted
    Run,

    /// Inspect or append to the execution history
    #[command(subcommand)]
    History(HistoryCommand),
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    /// Record an execution of a task from a public address
    Record {
        #[arg(long)]
        task: u32,
        #[arg(long)]
        ip: IpAddr,
        /// Coordinator time of execution, unix seconds. Defaults to the local
        /// clock, which may be skewed against the coordinator.
        #[arg(long)]
        at: Option<i64>,
    },

    /// List executions of a task, newest first
    Show {
        #[arg(long)]
        task: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(p) => p,
        None => Config::config_path(Path::new(&*shellexpand::tilde("~"))),
    };

    match cli.cmd {
        Command::Init => {
            let cfg = Config::load_or_init(&config_path)?;
            SqliteHistory::open(&cfg.db_path())?;
            println!("Config: {}", config_path.display());
            println!("History: {}", cfg.db_path().display());
        }
        Command::Hunt { json } => {
            let cfg = Config::load_or_init(&config_path)?;
            let history: Arc<dyn HistoryStore> = Arc::new(SqliteHistory::open(&cfg.db_path())?);
            let (sink, rx) = ChannelSink::new();
            let collaborators = build(&cfg, history, Arc::new(sink), Arc::new(ServerClock::new()))?;
            let drained = tokio::spawn(drain(rx));

            let mut rng = StdRng::from_entropy();
            let summary = HuntingCycle::new(&collaborators, settings(&cfg)).run(&mut rng).await;
            // Closing the sink lets the drain finish logging.
            drop(collaborators);
            let _ = drained.await;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            if !summary.is_success() {
                anyhow::bail!(
                    "hunting cycle failed: {}",
                    summary.failure.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Command::Run => run(&config_path).await?,
        Command::History(cmd) => {
            let cfg = Config::load_or_init(&config_path)?;
            let store = SqliteHistory::open(&cfg.db_path())?;
            match cmd {
                HistoryCommand::Record { task, ip, at } => {
                    let record = ExecutionRecord {
                        task_id: TaskId(task),
                        public_ip: ip,
                        executed_at: at.unwrap_or_else(now_unix),
                    };
                    store.record_execution(&record)?;
                    println!("Recorded task {} from {} at {}", task, ip, record.executed_at);
                }
                HistoryCommand::Show { task } => {
                    let rows = store.executions_of(TaskId(task))?;
                    println!("Executions of task {}: {}", task, rows.len());
                    for r in rows {
                        println!("- {} from {}", r.executed_at, r.public_ip);
                    }
                }
            }
        }
    }

    Ok(())
}

/// The endless hunting loop. Config is re-read before every cycle so a
/// disabled hunter or a changed coordinator takes effect without a restart.
async fn run(config_path: &Path) -> Result<()> {
    let mut cfg = Config::load_or_init(config_path)?;
    let history: Arc<dyn HistoryStore> = Arc::new(SqliteHistory::open(&cfg.db_path())?);
    let clock = Arc::new(ServerClock::new());
    let (sink, rx) = ChannelSink::new();
    let sink = Arc::new(sink);
    let mut collaborators = build(&cfg, Arc::clone(&history), sink.clone(), Arc::clone(&clock))?;
    tokio::spawn(drain(rx));

    let mut rng = StdRng::from_entropy();
    info!("hunter starting; coordinator={}", cfg.base_url());

    loop {
        match Config::load_from(config_path) {
            Ok(fresh) if needs_rebuild(&cfg, &fresh) => {
                match build(&fresh, Arc::clone(&history), sink.clone(), Arc::clone(&clock)) {
                    Ok(rebuilt) => {
                        info!("coordinator settings changed; now using {}", fresh.base_url());
                        collaborators = rebuilt;
                        cfg = fresh;
                    }
                    Err(e) => warn!("keeping previous coordinator settings: {e:#}"),
                }
            }
            Ok(fresh) => cfg = fresh,
            Err(e) => warn!("keeping previous config: {e:#}"),
        }
        if !cfg.hunter.enabled {
            info!("hunting disabled in config; stopping");
            return Ok(());
        }

        let summary = HuntingCycle::new(&collaborators, settings(&cfg)).run(&mut rng).await;
        info!(
            "cycle {}: fetched={} admitted={}",
            summary.stage,
            summary.fetched,
            summary.admitted_count()
        );

        tokio::select! {
            _ = sleep(cfg.hunting_interval()) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping");
                return Ok(());
            }
        }
    }
}

fn build(
    cfg: &Config,
    history: Arc<dyn HistoryStore>,
    sink: Arc<ChannelSink>,
    clock: Arc<ServerClock>,
) -> Result<Collaborators> {
    let c = &cfg.coordinator;
    let source = HttpTaskSource::new(cfg.task_list_url(), cfg.request_timeout())
        .context("build coordinator client")?;
    let resolver = CachingResolver::new(
        HttpAddressResolver::new(&c.scheme, &c.host, c.port, cfg.request_timeout()),
        Duration::from_secs(cfg.hunter.server_ip_cache_validity_secs),
        Duration::from_secs(cfg.hunter.public_ip_cache_validity_secs),
    );
    Ok(Collaborators {
        source: Arc::new(source),
        resolver: Arc::new(resolver),
        history,
        sink,
        notifier: Arc::new(TracingNotifier),
        clock,
    })
}

/// Whether a reloaded config needs fresh HTTP clients and address caches.
fn needs_rebuild(current: &Config, fresh: &Config) -> bool {
    let (a, b) = (&current.hunter, &fresh.hunter);
    current.coordinator != fresh.coordinator
        || a.public_ip_cache_validity_secs != b.public_ip_cache_validity_secs
        || a.server_ip_cache_validity_secs != b.server_ip_cache_validity_secs
}

fn settings(cfg: &Config) -> CycleSettings {
    CycleSettings {
        coordinator_host: cfg.coordinator.host.clone(),
        cooldown_secs: cfg.cooldown_secs(),
    }
}

/// Stands in for the execution subsystem: logs every handoff.
async fn drain(mut rx: UnboundedReceiver<Handoff>) {
    while let Some(handoff) = rx.recv().await {
        match handoff {
            Handoff::Task(t) => info!(
                "admitted task {} -> {}:{} ({}), {} known certs",
                t.id,
                t.target,
                t.port,
                t.hostname,
                t.known_cert_hashes.len()
            ),
            Handoff::PublicIp(n) => info!("public address {} (hmac {})", n.public_ip, n.hmac_hex()),
        }
    }
}

fn print_summary(summary: &CycleSummary) {
    println!("Stage: {}", summary.stage);
    println!(
        "Tasks: {} fetched, {} admitted",
        summary.fetched,
        summary.admitted_count()
    );
    println!(
        "Public addresses: IPv4 {:?}, IPv6 {:?}",
        summary.identity.v4, summary.identity.v6
    );
    for d in &summary.decisions {
        let what = match d.decision {
            Decision::Admit => "admit".to_string(),
            Decision::Skip(SkipReason::Unsupported) => format!("skip (no public {})", d.ip_version),
            Decision::Skip(SkipReason::CoolingDown { eligible_at }) => {
                format!("skip (eligible again at {eligible_at})")
            }
        };
        println!("- task {}: {}", d.task_id, what);
    }
    for id in &summary.defects {
        println!("- task {id}: undecided");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cache_validity_change_rebuilds_collaborators() {
        let current = Config::default();
        assert!(!needs_rebuild(&current, &current.clone()));

        let mut fresh = current.clone();
        fresh.hunter.public_ip_cache_validity_secs = 5;
        assert!(needs_rebuild(&current, &fresh));

        let mut fresh = current.clone();
        fresh.hunter.server_ip_cache_validity_secs = 5;
        assert!(needs_rebuild(&current, &fresh));

        let mut fresh = current.clone();
        fresh.coordinator.port = 8443;
        assert!(needs_rebuild(&current, &fresh));
    }

    #[test]
    fn interval_change_keeps_collaborators() {
        let current = Config::default();
        let mut fresh = current.clone();
        fresh.hunter.hunting_interval_secs = 60;
        fresh.hunter.task_reexecution_interval_secs = 60;
        fresh.hunter.enabled = false;
        assert!(!needs_rebuild(&current, &fresh));
    }

    #[test]
    fn record_time_help_warns_about_local_clock() {
        let cli = Cli::command();
        let record = cli
            .find_subcommand("history")
            .and_then(|h| h.find_subcommand("record"))
            .unwrap();
        let at = record.get_arguments().find(|a| a.get_id() == "at").unwrap();
        let help = at.get_help().unwrap().to_string();
        assert!(help.contains("Coordinator time"), "{help}");
        assert!(help.contains("local clock"), "{help}");
    }

    #[test]
    fn parses_history_record() {
        let cli = Cli::try_parse_from([
            "hunter",
            "--config",
            "/tmp/h.toml",
            "history",
            "record",
            "--task",
            "7",
            "--ip",
            "2001:db8::7",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/h.toml")));
        match cli.cmd {
            Command::History(HistoryCommand::Record { task, ip, at }) => {
                assert_eq!(task, 7);
                assert_eq!(ip, "2001:db8::7".parse::<IpAddr>().unwrap());
                assert_eq!(at, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
