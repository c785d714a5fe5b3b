//! # fleet-autoscaler
//!
//! The scaling control loop for gpufleet.
//!
//! This crate provides:
//! - `DecisionEngine`: the per-policy reconcile that fuses utilization,
//!   the pending queue, cooldowns, and predictive signals into one scale
//!   decision, then acts through the cloud capability
//! - `drain`: the cordon-evict-poll protocol used before node removal
//! - `SpotOrchestrator`: reclamation polling, priority-aware eviction
//!   waves, and interruption statistics feeding capacity recommendations
//! - `PredictiveScaler`: weekday/hour utilization patterns and pre-warm
//!   recommendations
//! - `ScalingHistory`: the bounded ring of recent scaling events

pub mod drain;
pub mod engine;
pub mod history;
pub mod interruption;
pub mod predictive;

pub use engine::{DecisionEngine, ScaleDecision};
pub use history::ScalingHistory;
pub use interruption::{SpotOrchestrator, SpotRecommendation, SpotStats};
pub use predictive::{PredictiveScaler, ScalingPrediction};
