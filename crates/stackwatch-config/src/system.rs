//! System configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "stackwatch.kdl";

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Directory holding one project directory per stack.
    pub projects_root: PathBuf,
    /// Root of the pending (`jobs/`) and archive (`logs/`) stores.
    pub data_dir: PathBuf,
    /// Command line run in the project directory for every build.
    pub build_command: String,
    /// Shell used to run `build_command`.
    pub shell: PathBuf,
    /// Period of the reaper sweep.
    pub reaper_interval: Duration,
    /// HTTP listen address.
    pub listen: SocketAddr,
    /// Shared secret for webhook signatures. Unsigned webhooks are accepted when unset.
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub log_format: LogFormat,
    pub tail: TailConfig,
}

/// Limits for log tailing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailConfig {
    /// Most history returned on first attach, in bytes.
    pub initial_bytes: u64,
    /// Most history returned on first attach, in lines.
    pub initial_lines: usize,
    /// Poll period of push (SSE) and `--follow` tails.
    pub poll_interval: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            initial_bytes: 64 * 1024,
            initial_lines: 1000,
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::InvalidValue {
                field: "log-format".to_string(),
                message: format!("expected \"text\" or \"json\", got {:?}", other),
            }),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            projects_root: std::env::var("PROJECTS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/srv/stacks")),
            data_dir: std::env::var("STACKWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/stackwatch")),
            build_command: std::env::var("STACKWATCH_BUILD_COMMAND")
                .unwrap_or_else(|_| "git pull && ./build.sh".to_string()),
            shell: PathBuf::from("/bin/sh"),
            reaper_interval: Duration::from_secs(30),
            listen: std::env::var("STACKWATCH_LISTEN")
                .ok()
                .and_then(|addr| addr.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000))),
            webhook_secret: std::env::var("STACKWATCH_WEBHOOK_SECRET").ok(),
            log_format: LogFormat::default(),
            tail: TailConfig::default(),
        }
    }
}

impl SystemConfig {
    /// Pending store: one record per stack awaiting or executing a build.
    pub fn pending_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    /// Archive store: terminal records and every run's log.
    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_system_config(&content)
}

/// Load `path` if given; otherwise [`DEFAULT_CONFIG_PATH`] when it exists,
/// else environment/built-in defaults.
pub fn resolve_system_config(path: Option<&Path>) -> ConfigResult<SystemConfig> {
    match path {
        Some(path) => load_system_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.is_file() {
                load_system_config(default)
            } else {
                Ok(SystemConfig::default())
            }
        }
    }
}

/// Parse system configuration from KDL text. Keys that are absent keep
/// their environment/built-in defaults; unknown nodes are ignored.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "projects-root" => config.projects_root = PathBuf::from(required_string(node)?),
            "data-dir" => config.data_dir = PathBuf::from(required_string(node)?),
            "build-command" => config.build_command = required_string(node)?,
            "shell" => config.shell = PathBuf::from(required_string(node)?),
            "reaper-interval-secs" => {
                config.reaper_interval = Duration::from_secs(positive_integer(node)?);
            }
            "listen" => {
                let addr = required_string(node)?;
                config.listen = addr.parse().map_err(|e| ConfigError::InvalidValue {
                    field: "listen".to_string(),
                    message: format!("{}: {}", addr, e),
                })?;
            }
            "webhook-secret" => config.webhook_secret = Some(required_string(node)?),
            "log-format" => config.log_format = required_string(node)?.parse()?,
            "tail" => parse_tail(node, &mut config.tail)?,
            _ => {} // Ignore unknown nodes
        }
    }

    if config.build_command.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "build-command".to_string(),
            message: "must not be empty".to_string(),
        });
    }

    Ok(config)
}

fn parse_tail(node: &KdlNode, tail: &mut TailConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        match child.name().value() {
            "initial-bytes" => tail.initial_bytes = positive_integer(child)?,
            "initial-lines" => {
                tail.initial_lines = usize::try_from(positive_integer(child)?).map_err(|_| {
                    ConfigError::InvalidValue {
                        field: "tail.initial-lines".to_string(),
                        message: "too large".to_string(),
                    }
                })?;
            }
            "poll-interval-ms" => {
                tail.poll_interval = Duration::from_millis(positive_integer(child)?);
            }
            _ => {}
        }
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn get_first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn required_string(node: &KdlNode) -> ConfigResult<String> {
    let field = node.name().value();
    match get_first_arg(node) {
        None => Err(ConfigError::MissingField(format!("{} value", field))),
        Some(value) => value
            .as_string()
            .map(|s| s.to_string())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: field.to_string(),
                message: "expected a string".to_string(),
            }),
    }
}

fn positive_integer(node: &KdlNode) -> ConfigResult<u64> {
    let field = node.name().value();
    let value = get_first_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("{} value", field)))?;
    value
        .as_integer()
        .and_then(|n| u64::try_from(n).ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected a positive integer".to_string(),
        })
}
