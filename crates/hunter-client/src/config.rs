use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub coordinator: CoordinatorConfig,
    pub hunter: HunterConfig,
    pub history: HistoryConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// "https" in production; plain "http" is only meant for local test rigs.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HunterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub hunting_interval_secs: u64,
    /// Minimum time between two executions of a task from the same address.
    pub task_reexecution_interval_secs: u64,
    #[serde(default = "default_public_ip_cache_validity_secs")]
    pub public_ip_cache_validity_secs: u64,
    #[serde(default = "default_server_ip_cache_validity_secs")]
    pub server_ip_cache_validity_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub db_path: String,
}

fn default_port() -> u16 {
    443
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_public_ip_cache_validity_secs() -> u64 {
    60
}

fn default_server_ip_cache_validity_secs() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig {
                host: "crossbear.net.in.tum.de".to_string(),
                port: default_port(),
                scheme: default_scheme(),
                request_timeout_secs: default_request_timeout_secs(),
            },
            hunter: HunterConfig {
                enabled: true,
                hunting_interval_secs: 900,
                task_reexecution_interval_secs: 21_600,
                public_ip_cache_validity_secs: default_public_ip_cache_validity_secs(),
                server_ip_cache_validity_secs: default_server_ip_cache_validity_secs(),
            },
            history: HistoryConfig {
                db_path: "~/.hunter/history.db".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    /// Loads `path`, writing the defaults there first if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Self::default();
            cfg.save_to(path)?;
            Ok(cfg)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn config_path(home: &Path) -> PathBuf {
        home.join(".hunter").join("hunter.toml")
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.history.db_path).to_string())
    }

    pub fn base_url(&self) -> String {
        let c = &self.coordinator;
        format!("{}://{}:{}", c.scheme, c.host, c.port)
    }

    pub fn task_list_url(&self) -> String {
        format!("{}/getHuntingTaskList.jsp", self.base_url())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.coordinator.request_timeout_secs)
    }

    pub fn hunting_interval(&self) -> Duration {
        Duration::from_secs(self.hunter.hunting_interval_secs)
    }

    pub fn cooldown_secs(&self) -> i64 {
        i64::try_from(self.hunter.task_reexecution_interval_secs).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_round_trip_through_disk() {
        let dir = tempdir().unwrap();
        let path = Config::config_path(dir.path());
        let cfg = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(Config::load_from(&path).unwrap(), cfg);
        assert_eq!(cfg.cooldown_secs(), 21_600);
        assert_eq!(cfg.hunting_interval(), Duration::from_secs(900));
    }

    #[test]
    fn optional_keys_take_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [coordinator]
            host = "coordinator.test"

            [hunter]
            hunting_interval_secs = 60
            task_reexecution_interval_secs = 120

            [history]
            db_path = "/tmp/h.db"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.task_list_url(), "https://coordinator.test:443/getHuntingTaskList.jsp");
        assert!(cfg.hunter.enabled);
        assert_eq!(cfg.hunter.server_ip_cache_validity_secs, 3600);
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/h.db"));
    }
}
