//! Top-level flow correlation.

pub mod correlation_engine;

pub use correlation_engine::{FlowCorrelationEngine, RunSummary};
