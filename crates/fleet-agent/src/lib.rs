//! # fleet-agent
//!
//! The gpufleet controller process: one binary hosting every reconcile
//! loop over shared capabilities. The agent wires the cluster runtime,
//! metrics read model, cloud provider, cost store, and alert channels
//! into the autoscaling engine, spot orchestrator, cost controllers,
//! node-config reconciler, and the admission webhook, then runs them on
//! their cadences until shutdown.

pub mod agent;
pub mod config;
pub mod logging;

pub use agent::{Agent, AgentBuilder};
pub use config::AgentConfig;

pub use fleet_core::{Error, Result};
