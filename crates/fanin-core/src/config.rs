//! fanin.toml configuration parser.
//!
//! Every field has a default, so an absent or empty file yields a
//! configuration suitable for running inside a cluster pod.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration or startup inputs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("namespace file {0} is empty")]
    Namespace(PathBuf),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FaninConfig {
    pub server: ServerConfig,
    pub sources: SourcesConfig,
    pub scrape: ScrapeConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7878".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// URL of the cluster state service's metrics.
    pub state_url: String,
    /// Service whose endpoints list the nodes to scrape.
    pub node_exporter_service: String,
    pub node_exporter_port: u16,
    pub node_exporter_path: String,
    /// Path requested through each node's API proxy.
    pub cadvisor_path: String,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            state_url: "http://kube-state-metrics:8080/metrics".to_string(),
            node_exporter_service: "node-exporter".to_string(),
            node_exporter_port: 9100,
            node_exporter_path: "/metrics".to_string(),
            cadvisor_path: "/metrics/cadvisor".to_string(),
        }
    }
}

/// What an aggregation does when a single producer fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first failure aborts the request; no partial document.
    #[default]
    Abort,
    /// Failed producers contribute an empty block and a `0` up gauge.
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    /// Upper bound on one fetch, including the full body, e.g. "10s".
    pub timeout: String,
    /// Maximum producers fetched concurrently within one stage.
    pub fan_out: usize,
    pub failure_policy: FailurePolicy,
    /// Treat non-2xx producer responses as failures.
    pub require_success: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            timeout: "10s".to_string(),
            fan_out: 1,
            failure_policy: FailurePolicy::Abort,
            require_success: true,
        }
    }
}

impl ScrapeConfig {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.timeout).ok_or_else(|| {
            ConfigError::Invalid(format!("scrape.timeout {:?} is not a duration", self.timeout))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub namespace_file: PathBuf,
    pub token_file: PathBuf,
    pub ca_file: PathBuf,
    /// `host:port` of the API server. Defaults to the in-cluster
    /// service environment when unset.
    pub api_server: Option<String>,
}

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

impl Default for ClusterConfig {
    fn default() -> Self {
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        Self {
            namespace_file: dir.join("namespace"),
            token_file: dir.join("token"),
            ca_file: dir.join("ca.crt"),
            api_server: None,
        }
    }
}

impl FaninConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: FaninConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.state_url.is_empty() {
            return Err(ConfigError::Invalid("sources.state_url is empty".to_string()));
        }
        if self.sources.node_exporter_service.is_empty() {
            return Err(ConfigError::Invalid(
                "sources.node_exporter_service is empty".to_string(),
            ));
        }
        for (key, path) in [
            ("sources.node_exporter_path", &self.sources.node_exporter_path),
            ("sources.cadvisor_path", &self.sources.cadvisor_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!("{key} must start with '/'")));
            }
        }
        if self.scrape.fan_out == 0 {
            return Err(ConfigError::Invalid("scrape.fan_out must be at least 1".to_string()));
        }
        self.scrape.timeout()?;
        Ok(())
    }
}

/// Read the namespace this process runs in.
///
/// The file holds a single line; surrounding whitespace is dropped.
pub fn load_namespace(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let namespace = content.trim();
    if namespace.is_empty() {
        return Err(ConfigError::Namespace(path.to_path_buf()));
    }
    Ok(namespace.to_string())
}

/// Parse a duration string like "5s", "500ms", "1m".
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let config: FaninConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7878");
        assert_eq!(config.sources.state_url, "http://kube-state-metrics:8080/metrics");
        assert_eq!(config.sources.node_exporter_service, "node-exporter");
        assert_eq!(config.sources.node_exporter_port, 9100);
        assert_eq!(config.sources.cadvisor_path, "/metrics/cadvisor");
        assert_eq!(config.scrape.fan_out, 1);
        assert_eq!(config.scrape.failure_policy, FailurePolicy::Abort);
        assert!(config.scrape.require_success);
        assert_eq!(config.scrape.timeout().unwrap(), Duration::from_secs(10));
        assert!(config.cluster.api_server.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_overrides() {
        let toml_str = r#"
[sources]
node_exporter_port = 9200

[scrape]
timeout = "500ms"
fan_out = 4
failure_policy = "partial"
"#;
        let config: FaninConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sources.node_exporter_port, 9200);
        assert_eq!(config.sources.node_exporter_path, "/metrics");
        assert_eq!(config.scrape.timeout().unwrap(), Duration::from_millis(500));
        assert_eq!(config.scrape.fan_out, 4);
        assert_eq!(config.scrape.failure_policy, FailurePolicy::Partial);
    }

    #[test]
    fn validate_rejects_zero_fan_out() {
        let mut config = FaninConfig::default();
        config.scrape.fan_out = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_bad_timeout() {
        let mut config = FaninConfig::default();
        config.scrape.timeout = "soon".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_relative_path() {
        let mut config = FaninConfig::default();
        config.sources.cadvisor_path = "metrics/cadvisor".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scrape\nfan_out = ").unwrap();
        let err = FaninConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn from_file_missing() {
        let err = FaninConfig::from_file(Path::new("/nonexistent/fanin.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn namespace_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "monitoring").unwrap();
        assert_eq!(load_namespace(file.path()).unwrap(), "monitoring");
    }

    #[test]
    fn empty_namespace_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            load_namespace(file.path()),
            Err(ConfigError::Namespace(_))
        ));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("fast"), None);
    }

    #[test]
    fn overflowing_minutes_are_invalid() {
        let max = u64::MAX.to_string();
        assert_eq!(parse_duration(&format!("{max}m")), None);

        let mut config = FaninConfig::default();
        config.scrape.timeout = format!("{max}m");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
