//! Optional YAML tuning file (`--init-config`).
//!
//! ```yaml
//! omnibus_root: /opt/chef
//! secure_directory: /etc/chef/secure
//! log_pipe: /opt/chef/logs
//! supervisor_pid_file: /tmp/supervisor.pid
//! readiness:
//!   strategy: control_pipes
//!   timeout_secs: 30
//! shutdown:
//!   graceful_signal: SIGHUP
//!   graceful_timeout_secs: 10
//!   escalation:
//!     - { signal: SIGTERM, timeout_secs: 3 }
//!     - { signal: SIGKILL, timeout_secs: 3 }
//! ```
//!
//! Every field is optional.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use init_common::Layout;
use init_common::layout::DEFAULT_ROOT;
use pid1::Signal;
use serde::Deserialize;

use crate::error::{InitError, InitResult};
use crate::supervisor::{EscalationStep, ReadinessStrategy, ShutdownPolicy};

const DEFAULT_SETTLE_SECS: u64 = 5;
const DEFAULT_CONTROL_PIPES_TIMEOUT_SECS: u64 = 30;

/// A signal written as `SIGTERM` or `TERM`, any case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct SignalName(pub Signal);

impl TryFrom<String> for SignalName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let upper = value.trim().to_ascii_uppercase();
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        Signal::from_str(&name)
            .map(SignalName)
            .map_err(|_| format!("unknown signal `{value}`"))
    }
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InitConfig {
    pub omnibus_root: PathBuf,
    pub secure_directory: Option<PathBuf>,
    pub log_pipe: Option<PathBuf>,
    pub supervisor_pid_file: Option<PathBuf>,
    pub readiness: ReadinessConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            omnibus_root: PathBuf::from(DEFAULT_ROOT),
            secure_directory: None,
            log_pipe: None,
            supervisor_pid_file: None,
            readiness: ReadinessConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ReadinessConfig {
    SettleDelay {
        #[serde(default = "default_settle_secs")]
        seconds: u64,
    },
    ControlPipes {
        #[serde(default = "default_control_pipes_timeout")]
        timeout_secs: u64,
    },
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self::SettleDelay {
            seconds: DEFAULT_SETTLE_SECS,
        }
    }
}

fn default_settle_secs() -> u64 {
    DEFAULT_SETTLE_SECS
}

fn default_control_pipes_timeout() -> u64 {
    DEFAULT_CONTROL_PIPES_TIMEOUT_SECS
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    pub graceful_signal: SignalName,
    pub graceful_timeout_secs: u64,
    pub escalation: Vec<EscalationConfig>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        let policy = ShutdownPolicy::default();
        Self {
            graceful_signal: SignalName(policy.graceful_signal),
            graceful_timeout_secs: policy.graceful_timeout.as_secs(),
            escalation: policy
                .escalation
                .iter()
                .map(|step| EscalationConfig {
                    signal: SignalName(step.signal),
                    timeout_secs: step.timeout.as_secs(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationConfig {
    pub signal: SignalName,
    pub timeout_secs: u64,
}

/// Load and validate a config file.
///
/// Relative paths are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> InitResult<InitConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| InitError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: InitConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| InitError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

impl InitConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.omnibus_root);
        for p in [
            &mut self.secure_directory,
            &mut self.log_pipe,
            &mut self.supervisor_pid_file,
        ]
        .into_iter()
        .flatten()
        {
            resolve(p);
        }
    }

    fn validate(&self) -> InitResult<()> {
        match self.shutdown.escalation.last() {
            Some(step) if step.signal.0 == Signal::SIGKILL => Ok(()),
            Some(step) => Err(InitError::Config(format!(
                "shutdown escalation must end with SIGKILL, not {}",
                step.signal.0
            ))),
            None => Err(InitError::Config(
                "shutdown escalation must not be empty".to_string(),
            )),
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.omnibus_root)
    }

    pub fn readiness_strategy(&self) -> ReadinessStrategy {
        match self.readiness {
            ReadinessConfig::SettleDelay { seconds } => {
                ReadinessStrategy::SettleDelay(Duration::from_secs(seconds))
            }
            ReadinessConfig::ControlPipes { timeout_secs } => ReadinessStrategy::ControlPipes {
                timeout: Duration::from_secs(timeout_secs),
            },
        }
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            graceful_signal: self.shutdown.graceful_signal.0,
            graceful_timeout: Duration::from_secs(self.shutdown.graceful_timeout_secs),
            escalation: self
                .shutdown
                .escalation
                .iter()
                .map(|step| EscalationStep {
                    signal: step.signal.0,
                    timeout: Duration::from_secs(step.timeout_secs),
                })
                .collect(),
            ..ShutdownPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn load_str(yaml: &str) -> (tempfile::TempDir, InitResult<InitConfig>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init.yaml");
        tokio::fs::write(&path, yaml).await.unwrap();
        let result = load(&path).await;
        (dir, result)
    }

    #[tokio::test]
    async fn load_full_config() {
        let (_dir, config) = load_str(
            r#"
omnibus_root: /srv/omnibus
secure_directory: /run/secrets/chef
log_pipe: /run/chef-logs
supervisor_pid_file: /run/runsvdir.pid
readiness:
  strategy: control_pipes
  timeout_secs: 12
shutdown:
  graceful_signal: TERM
  graceful_timeout_secs: 4
  escalation:
    - { signal: SIGINT, timeout_secs: 2 }
    - { signal: kill, timeout_secs: 1 }
"#,
        )
        .await;
        let config = config.unwrap();
        assert_eq!(config.omnibus_root, PathBuf::from("/srv/omnibus"));
        assert_eq!(config.log_pipe, Some(PathBuf::from("/run/chef-logs")));
        assert_eq!(
            config.readiness_strategy(),
            ReadinessStrategy::ControlPipes {
                timeout: Duration::from_secs(12)
            }
        );

        let policy = config.shutdown_policy();
        assert_eq!(policy.graceful_signal, Signal::SIGTERM);
        assert_eq!(policy.graceful_timeout, Duration::from_secs(4));
        assert_eq!(
            policy.escalation,
            vec![
                EscalationStep {
                    signal: Signal::SIGINT,
                    timeout: Duration::from_secs(2)
                },
                EscalationStep {
                    signal: Signal::SIGKILL,
                    timeout: Duration::from_secs(1)
                },
            ]
        );
    }

    #[tokio::test]
    async fn empty_file_uses_defaults() {
        let (_dir, config) = load_str("{}\n").await;
        let config = config.unwrap();
        assert_eq!(config, InitConfig::default());
        assert_eq!(
            config.readiness_strategy(),
            ReadinessStrategy::SettleDelay(Duration::from_secs(5))
        );
        assert_eq!(config.shutdown_policy(), ShutdownPolicy::default());
    }

    #[tokio::test]
    async fn relative_paths_resolve_against_config_dir() {
        let (dir, config) = load_str("omnibus_root: omnibus\nlog_pipe: run/logs\n").await;
        let config = config.unwrap();
        assert_eq!(config.omnibus_root, dir.path().join("omnibus"));
        assert_eq!(config.log_pipe, Some(dir.path().join("run/logs")));
    }

    #[tokio::test]
    async fn settle_delay_defaults_its_seconds() {
        let (_dir, config) = load_str("readiness:\n  strategy: settle_delay\n").await;
        assert_eq!(
            config.unwrap().readiness_strategy(),
            ReadinessStrategy::SettleDelay(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn unknown_signal_is_rejected() {
        let (_dir, config) = load_str("shutdown:\n  graceful_signal: SIGFOO\n").await;
        let err = config.unwrap_err();
        assert!(err.to_string().contains("SIGFOO"), "{err}");
    }

    #[tokio::test]
    async fn escalation_must_end_in_kill() {
        let (_dir, config) = load_str(
            "shutdown:\n  escalation:\n    - { signal: SIGTERM, timeout_secs: 3 }\n",
        )
        .await;
        assert!(matches!(config, Err(InitError::Config(_))));

        let (_dir, config) = load_str("shutdown:\n  escalation: []\n").await;
        assert!(matches!(config, Err(InitError::Config(_))));
    }

    #[tokio::test]
    async fn unknown_field_is_rejected() {
        let (_dir, config) = load_str("omnibus_rot: /opt/chef\n").await;
        assert!(matches!(config, Err(InitError::Config(_))));
    }

    #[tokio::test]
    async fn missing_file_is_config_error() {
        let err = load(Path::new("/nonexistent/init.yaml")).await.unwrap_err();
        assert!(err.is_usage());
    }
}
