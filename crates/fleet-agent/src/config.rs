//! Configuration for the gpufleet agent
//!
//! Loaded from a YAML file with environment overrides layered on top
//! (prefix `GPUFLEET_`, nested keys separated by `__`).

use fleet_core::{ClusterConfig, Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Complete configuration for the controller process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Shared cluster settings
    pub cluster: ClusterConfig,

    /// Agent process settings
    pub agent: AgentProcessConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Reconcile loop cadences
    pub intervals: IntervalsConfig,

    /// HTTP server endpoints
    pub servers: ServersConfig,

    /// Admission rewriter feature toggles
    pub sharing: SharingTogglesConfig,

    /// Cost pipeline settings
    pub cost: CostConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProcessConfig {
    /// Agent name, used in logs
    pub name: String,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
}

impl Default for AgentProcessConfig {
    fn default() -> Self {
        Self {
            name: "fleetd".to_string(),
            shutdown_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log format: text or json
    pub format: String,

    /// Include the source target in log lines
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalsConfig {
    /// Autoscaling reconcile cadence; jitter is added on top
    pub autoscaling_seconds: u64,

    /// Maximum jitter added to the autoscaling cadence
    pub autoscaling_jitter_seconds: u64,

    /// Spot reclamation polling cadence
    pub interruption_seconds: u64,

    /// Cost accrual cadence
    pub cost_seconds: u64,

    /// Budget reconcile cadence
    pub budget_seconds: u64,

    /// Attribution reconcile cadence
    pub attribution_seconds: u64,

    /// Node sharing-config reconcile cadence
    pub node_config_seconds: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            autoscaling_seconds: 30,
            autoscaling_jitter_seconds: 3,
            interruption_seconds: 5,
            cost_seconds: 60,
            budget_seconds: 60,
            attribution_seconds: 60,
            node_config_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServersConfig {
    /// Prometheus scrape endpoint
    pub metrics_enabled: bool,
    pub metrics_bind_addr: SocketAddr,

    /// Admission webhook endpoint
    pub admission_enabled: bool,
    pub admission_bind_addr: SocketAddr,
}

impl Default for ServersConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_bind_addr: "127.0.0.1:9090".parse().unwrap(),
            admission_enabled: true,
            admission_bind_addr: "127.0.0.1:8443".parse().unwrap(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingTogglesConfig {
    pub enable_mig: bool,
    pub enable_mps: bool,
    pub enable_timeslicing: bool,
}

impl Default for SharingTogglesConfig {
    fn default() -> Self {
        Self {
            enable_mig: true,
            enable_mps: true,
            enable_timeslicing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Persist cost rows to the in-process time-series store
    pub store_enabled: bool,

    /// Days of cost rows the store retains
    pub store_retention_days: u32,

    /// Build the predictive scaler and offer it to policies that enable
    /// predictive scaling
    pub predictive_enabled: bool,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            store_enabled: true,
            store_retention_days: 90,
            predictive_enabled: true,
        }
    }
}

impl AgentConfig {
    /// Load from a YAML file with `GPUFLEET_`-prefixed environment
    /// overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("GPUFLEET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let parsed: AgentConfig = settings.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Render the default configuration as YAML
    pub fn default_yaml() -> Result<String> {
        Ok(serde_yaml::to_string(&AgentConfig::default())?)
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;

        if self.intervals.interruption_seconds == 0 {
            return Err(Error::config("interruption polling interval must be > 0"));
        }
        if self.intervals.autoscaling_seconds == 0 {
            return Err(Error::config("autoscaling interval must be > 0"));
        }
        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => return Err(Error::config(format!("unknown log format: {}", other))),
        }
        Ok(())
    }
}
