//! Node configuration from environment variables
//!
//! Every knob has a default suitable for a single-node development run;
//! production deployments override through `TIMEGRAIN_*` variables.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Shard fan-out pool bounds.
#[derive(Debug, Clone, Copy)]
pub struct ParallelismBounds {
    pub initial: usize,
    pub lower: usize,
    pub upper: usize,
}

impl ParallelismBounds {
    /// The pool size actually used: the initial value clamped into the
    /// configured bounds.
    pub fn effective(&self) -> usize {
        self.initial.clamp(self.lower.max(1), self.upper.max(1))
    }
}

impl Default for ParallelismBounds {
    fn default() -> Self {
        Self {
            initial: 8,
            lower: 1,
            upper: 32,
        }
    }
}

/// Configuration of one timegrain node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable identifier of this node in the cluster view
    pub node_id: String,
    /// HTTP endpoint bind address
    pub http_addr: SocketAddr,
    /// Filesystem root for schemas, metadata, shards and the commit log
    pub base_path: PathBuf,
    /// Default bin width for metrics without explicit metric info
    pub default_shard_interval_ms: u64,
    /// Ask timeout of the write coordinator
    pub write_timeout: Duration,
    /// Statement deadline of the read coordinator
    pub read_timeout: Duration,
    /// Ask timeout of metadata-heavy commands (deletes, drops)
    pub metadata_timeout: Duration,
    /// Whether accepted writes are framed into the commit log
    pub commit_log_enabled: bool,
    /// Shard fan-out pool bounds
    pub read_parallelism: ParallelismBounds,
    /// Additional cluster members known at start
    pub seed_nodes: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "timegrain-1".to_string(),
            http_addr: "127.0.0.1:7817".parse().expect("static addr"),
            base_path: PathBuf::from("./timegrain-data"),
            default_shard_interval_ms: 3_600_000,
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            metadata_timeout: Duration::from_secs(5),
            commit_log_enabled: true,
            read_parallelism: ParallelismBounds::default(),
            seed_nodes: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Build the configuration from `TIMEGRAIN_*` environment variables,
    /// falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(node_id) = read_env("TIMEGRAIN_NODE_ID") {
            if node_id.is_empty() {
                return Err(Error::Config("TIMEGRAIN_NODE_ID cannot be empty".into()));
            }
            config.node_id = node_id;
        }
        if let Some(addr) = read_env("TIMEGRAIN_HTTP_ADDR") {
            config.http_addr = addr
                .parse()
                .map_err(|e| Error::Config(format!("invalid TIMEGRAIN_HTTP_ADDR: {e}")))?;
        }
        if let Some(path) = read_env("TIMEGRAIN_BASE_PATH") {
            config.base_path = PathBuf::from(path);
        }
        if let Some(interval) = read_env("TIMEGRAIN_SHARD_INTERVAL_MS") {
            config.default_shard_interval_ms = parse_positive("TIMEGRAIN_SHARD_INTERVAL_MS", &interval)?;
        }
        if let Some(raw) = read_env("TIMEGRAIN_WRITE_TIMEOUT_MS") {
            config.write_timeout =
                Duration::from_millis(parse_positive("TIMEGRAIN_WRITE_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = read_env("TIMEGRAIN_READ_TIMEOUT_MS") {
            config.read_timeout =
                Duration::from_millis(parse_positive("TIMEGRAIN_READ_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = read_env("TIMEGRAIN_METADATA_TIMEOUT_MS") {
            config.metadata_timeout =
                Duration::from_millis(parse_positive("TIMEGRAIN_METADATA_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = read_env("TIMEGRAIN_COMMIT_LOG_ENABLED") {
            config.commit_log_enabled = parse_bool("TIMEGRAIN_COMMIT_LOG_ENABLED", &raw)?;
        }
        if let Some(raw) = read_env("TIMEGRAIN_READ_PARALLELISM") {
            config.read_parallelism.initial =
                parse_positive("TIMEGRAIN_READ_PARALLELISM", &raw)? as usize;
        }
        if let Some(raw) = read_env("TIMEGRAIN_READ_PARALLELISM_LOWER") {
            config.read_parallelism.lower =
                parse_positive("TIMEGRAIN_READ_PARALLELISM_LOWER", &raw)? as usize;
        }
        if let Some(raw) = read_env("TIMEGRAIN_READ_PARALLELISM_UPPER") {
            config.read_parallelism.upper =
                parse_positive("TIMEGRAIN_READ_PARALLELISM_UPPER", &raw)? as usize;
        }
        if let Some(raw) = read_env("TIMEGRAIN_SEED_NODES") {
            config.seed_nodes = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(config)
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|s| s.trim().to_string())
}

fn parse_positive(name: &str, raw: &str) -> Result<u64> {
    let value: u64 = raw
        .parse()
        .map_err(|e| Error::Config(format!("{name} must be a positive integer: {e}")))?;
    if value == 0 {
        return Err(Error::Config(format!("{name} must be positive")));
    }
    Ok(value)
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = NodeConfig::default();
        assert!(config.commit_log_enabled);
        assert_eq!(config.read_parallelism.effective(), 8);
    }

    #[test]
    fn parallelism_clamps_into_bounds() {
        let bounds = ParallelismBounds {
            initial: 100,
            lower: 2,
            upper: 16,
        };
        assert_eq!(bounds.effective(), 16);
        let low = ParallelismBounds {
            initial: 0,
            lower: 2,
            upper: 16,
        };
        assert_eq!(low.effective(), 2);
    }

    #[test]
    fn bool_parsing_accepts_common_forms() {
        assert!(parse_bool("K", "true").unwrap());
        assert!(!parse_bool("K", "0").unwrap());
        assert!(parse_bool("K", "maybe").is_err());
    }

    #[test]
    fn positive_parsing_rejects_zero() {
        assert_eq!(parse_positive("K", "42").unwrap(), 42);
        assert!(parse_positive("K", "0").is_err());
        assert!(parse_positive("K", "abc").is_err());
    }
}
