//! Configuration types for Conclave fleets

use crate::control::SocketDir;
use crate::error::{ConclaveError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lowest port a node may listen on (non-privileged range)
pub const MIN_NODE_PORT: u16 = 1024;

/// Top-level configuration for a supervised fleet
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConclaveConfig {
    /// Nodes to supervise
    pub nodes: Vec<NodeConfig>,

    /// Process supervision settings
    pub supervisor: SupervisorConfig,

    /// Which automatic recovery mechanism to run
    pub recovery: RecoveryMode,
}

/// Configuration for a single node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Unique node name
    pub name: String,

    /// Port the node's service endpoint listens on
    pub port: u16,

    /// Opaque settings forwarded verbatim to the node process
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,

    /// Log level for the node process
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file for the node process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl NodeConfig {
    /// Create a node configuration with default logging and an empty payload
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            payload: serde_json::Value::Null,
            log_level: default_log_level(),
            log_file: None,
        }
    }

    /// Attach an opaque payload
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Validate name and port.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty name, a name that cannot be used in a
    /// socket path or a comma-joined list, or a port outside the non-privileged range.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConclaveError::Configuration(
                "Node name is required".to_string(),
            ));
        }
        if self
            .name
            .chars()
            .any(|c| c == '/' || c == ',' || c == '\0' || c.is_whitespace())
        {
            return Err(ConclaveError::Configuration(format!(
                "Invalid node name: {:?}",
                self.name
            )));
        }
        if self.port < MIN_NODE_PORT {
            return Err(ConclaveError::Configuration(format!(
                "Port must be between {} and 65535, got {}",
                MIN_NODE_PORT, self.port
            )));
        }
        Ok(())
    }
}

/// Process supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Node entry point executable
    pub node_command: PathBuf,

    /// Arguments placed before the generated `--config` arguments
    pub node_args: Vec<String>,

    /// Directory holding per-node control sockets
    pub socket_dir: PathBuf,

    /// Pause between spawns during `start_all`
    #[serde(with = "humantime_serde")]
    pub spawn_stagger: Duration,

    /// How long `start_all` waits for every node to become ready
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,

    /// Graceful shutdown window before escalating to SIGTERM
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Window after SIGTERM before escalating to SIGKILL
    #[serde(with = "humantime_serde")]
    pub terminate_grace: Duration,

    /// Per-call timeout for control-socket commands
    #[serde(with = "humantime_serde")]
    pub socket_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            node_command: PathBuf::from("conclave-node"),
            node_args: Vec::new(),
            socket_dir: SocketDir::default_root(),
            spawn_stagger: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            terminate_grace: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(5),
        }
    }
}

/// Health monitoring and auto-recovery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Time between health ticks
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    /// Consecutive failures before a recovery attempt
    pub failure_threshold: u32,

    /// Pause between stopping and restarting a node during recovery
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,

    /// Maximum automatic restarts per node within one hour
    pub max_restarts: usize,

    /// Timeout for a single health probe
    #[serde(with = "humantime_serde")]
    pub socket_timeout: Duration,

    /// How long to wait for a restarted node's control socket to answer
    #[serde(with = "humantime_serde")]
    pub recovery_window: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            failure_threshold: 3,
            restart_delay: Duration::from_secs(2),
            max_restarts: 5,
            socket_timeout: Duration::from_secs(2),
            recovery_window: Duration::from_secs(5),
        }
    }
}

/// Automatic recovery mechanism. Exactly one runs per supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RecoveryMode {
    /// No automatic recovery
    None,

    /// Poll exit codes and restart crashed nodes up to a fixed cap
    CrashWatch {
        /// Poll interval
        #[serde(with = "humantime_serde", default = "default_crash_watch_interval")]
        interval: Duration,
        /// Restarts allowed before a node is left failed
        #[serde(default = "default_crash_watch_max_restarts")]
        max_restarts: u32,
    },

    /// Probe control sockets and recover within a restart budget
    HealthMonitor(HealthConfig),
}

fn default_crash_watch_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_crash_watch_max_restarts() -> u32 {
    3
}

impl Default for RecoveryMode {
    fn default() -> Self {
        RecoveryMode::CrashWatch {
            interval: default_crash_watch_interval(),
            max_restarts: default_crash_watch_max_restarts(),
        }
    }
}

/// Builder for ConclaveConfig
pub struct ConfigBuilder {
    config: ConclaveConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            config: ConclaveConfig::default(),
        }
    }

    /// Add a node
    pub fn node(mut self, node: NodeConfig) -> Self {
        self.config.nodes.push(node);
        self
    }

    /// Set supervisor configuration
    pub fn supervisor(mut self, config: SupervisorConfig) -> Self {
        self.config.supervisor = config;
        self
    }

    /// Set recovery mode
    pub fn recovery(mut self, mode: RecoveryMode) -> Self {
        self.config.recovery = mode;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<ConclaveConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConclaveConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `conclave.toml` in the working directory
    /// 3. The file named by `CONCLAVE_CONFIG_PATH`
    /// 4. `CONCLAVE_` environment overrides (`__` separates nested keys)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(Self::defaults()?))
            .merge(Toml::file("conclave.toml"));

        if let Ok(path) = std::env::var("CONCLAVE_CONFIG_PATH") {
            figment = Self::merge_file(figment, Path::new(&path));
        }

        let config: ConclaveConfig = figment
            .merge(Env::prefixed("CONCLAVE_").ignore(&["CONFIG_PATH"]).split("__"))
            .extract()
            .map_err(|e| {
                ConclaveError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// The format is chosen by extension: `.yaml`/`.yml`, `.json`, anything else is TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{Figment, providers::Serialized};

        let path = path.as_ref();
        if !path.exists() {
            return Err(ConclaveError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let figment = Figment::from(Serialized::defaults(Self::defaults()?));
        let config: ConclaveConfig = Self::merge_file(figment, path)
            .extract()
            .map_err(|e| {
                ConclaveError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults merged under every source.
    ///
    /// `recovery` is left out: its variants share field names, so a default
    /// crash-watch table would leak into a file that selects another mode.
    fn defaults() -> Result<serde_json::Value> {
        let mut defaults = serde_json::to_value(ConclaveConfig::default())?;
        if let Some(table) = defaults.as_object_mut() {
            table.remove("recovery");
        }
        Ok(defaults)
    }

    fn merge_file(figment: figment::Figment, path: &Path) -> figment::Figment {
        use figment::providers::{Format, Json, Toml, Yaml};

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
            Some("json") => figment.merge(Json::file(path)),
            _ => figment.merge(Toml::file(path)),
        }
    }

    /// Validate every node and name uniqueness.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !seen.insert(node.name.as_str()) {
                return Err(ConclaveError::Configuration(format!(
                    "Duplicate node name: {}",
                    node.name
                )));
            }
        }

        if let RecoveryMode::HealthMonitor(health) = &self.recovery {
            if health.failure_threshold == 0 {
                return Err(ConclaveError::Configuration(
                    "failure_threshold must be at least 1".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_node_validation() {
        assert!(NodeConfig::new("alpha", 8001).validate().is_ok());
        assert!(NodeConfig::new("", 8001).validate().is_err());
        assert!(NodeConfig::new("a/b", 8001).validate().is_err());
        assert!(NodeConfig::new("a,b", 8001).validate().is_err());
        assert!(NodeConfig::new("alpha", 80).validate().is_err());
        assert!(NodeConfig::new("alpha", 1024).validate().is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = ConfigBuilder::new()
            .node(NodeConfig::new("alpha", 8001))
            .node(NodeConfig::new("alpha", 8002))
            .build();

        assert!(matches!(result, Err(ConclaveError::Configuration(_))));
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[supervisor]
node_command = "/usr/local/bin/worker"
stop_timeout = "3s"

[recovery]
mode = "health_monitor"
failure_threshold = 2
max_restarts = 4

[[nodes]]
name = "alpha"
port = 8001

[[nodes]]
name = "beta"
port = 8002
payload = {{ role = "critic" }}
"#
        )
        .unwrap();

        let config = ConclaveConfig::from_file(file.path()).unwrap();

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[1].payload["role"], "critic");
        assert_eq!(config.nodes[0].log_level, "info");
        assert_eq!(config.supervisor.stop_timeout, Duration::from_secs(3));
        assert_eq!(
            config.supervisor.node_command,
            PathBuf::from("/usr/local/bin/worker")
        );
        match config.recovery {
            RecoveryMode::HealthMonitor(health) => {
                assert_eq!(health.failure_threshold, 2);
                assert_eq!(health.max_restarts, 4);
                assert_eq!(health.check_interval, Duration::from_secs(5));
            }
            other => panic!("unexpected recovery mode: {:?}", other),
        }
    }

    #[test]
    fn test_health_monitor_fields_default_independently() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[recovery]
mode = "health_monitor"
failure_threshold = 2

[[nodes]]
name = "alpha"
port = 8001
"#
        )
        .unwrap();

        let config = ConclaveConfig::from_file(file.path()).unwrap();

        let expected = HealthConfig {
            failure_threshold: 2,
            ..HealthConfig::default()
        };
        assert_eq!(config.recovery, RecoveryMode::HealthMonitor(expected));
    }

    #[test]
    fn test_crash_watch_fields_default() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[recovery]\nmode = \"crash_watch\"\nmax_restarts = 7\n\n[[nodes]]\nname = \"alpha\"\nport = 8001\n"
        )
        .unwrap();

        let config = ConclaveConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config.recovery,
            RecoveryMode::CrashWatch {
                interval: Duration::from_secs(5),
                max_restarts: 7,
            }
        );
    }

    #[test]
    fn test_recovery_defaults_when_omitted() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[[nodes]]\nname = \"alpha\"\nport = 8001\n").unwrap();

        let config = ConclaveConfig::from_file(file.path()).unwrap();
        assert_eq!(config.recovery, RecoveryMode::default());
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "nodes:\n  - name: alpha\n    port: 9001\nrecovery:\n  mode: none\n"
        )
        .unwrap();

        let config = ConclaveConfig::from_file(file.path()).unwrap();

        assert_eq!(config.nodes[0].name, "alpha");
        assert_eq!(config.recovery, RecoveryMode::None);
    }

    #[test]
    fn test_missing_file() {
        let result = ConclaveConfig::from_file("/nonexistent/conclave.toml");
        assert!(matches!(result, Err(ConclaveError::Configuration(_))));
    }

    #[test]
    fn test_default_recovery_is_crash_watch() {
        match RecoveryMode::default() {
            RecoveryMode::CrashWatch { max_restarts, .. } => assert_eq!(max_restarts, 3),
            other => panic!("unexpected recovery mode: {:?}", other),
        }
    }
}
