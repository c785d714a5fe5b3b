//! # fleet-sharing
//!
//! GPU sharing strategies and the admission-time workload rewriter.
//!
//! This crate provides:
//! - `mig`: hardware partition profiles and smallest-fit selection
//! - `mps`: process-multiplexing configuration and mutation
//! - `timeslicing`: temporal-sharing configuration and mutation
//! - `WorkloadRewriter`: admission-time classification and in-place
//!   resource-request rewriting, idempotent and fail-open
//! - `AdmissionServer`: the synchronous webhook endpoint, including the
//!   budget admission guard
//! - `NodeConfigReconciler`: applies declared per-node sharing
//!   configuration through labels and annotations
//! - `waste`: utilization waste scoring and recommendations

pub mod mig;
pub mod mps;
pub mod node_config;
pub mod rewriter;
pub mod timeslicing;
pub mod waste;
pub mod webhook;

pub use mig::MigProfile;
pub use node_config::NodeConfigReconciler;
pub use rewriter::{RewriteOutcome, RewriterConfig, WorkloadRewriter};
pub use webhook::AdmissionServer;
