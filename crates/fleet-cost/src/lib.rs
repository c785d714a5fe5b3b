//! # fleet-cost
//!
//! Cost accounting and budget enforcement for gpufleet.
//!
//! This crate provides:
//! - `CostTracker`: second-resolution accrual of per-workload GPU spend,
//!   exported as live gauges and persisted to the time-series store
//! - `PricingClient`: GPU-hour prices per (GPU type, capacity class,
//!   region, zone) with a one-hour cache and estimate fallbacks
//! - `BudgetController`: per-budget reconciliation with threshold alerts
//!   and alert/throttle/block enforcement
//! - `Alerter`: webhook / Slack / PagerDuty / email dispatch behind one
//!   capability
//! - `AttributionController`: per-scope cost rollups and itemized savings

pub mod alerter;
pub mod attribution;
pub mod budget;
pub mod pricing;
pub mod tracker;

pub use alerter::{AlertDispatch, AlertMessage, Alerter};
pub use attribution::AttributionController;
pub use budget::BudgetController;
pub use pricing::{GpuPricing, PricingClient, PricingRequest};
pub use tracker::CostTracker;
