//! Event input: flow event types, flow keys, and the capture-file source.

pub mod capture_source;
pub mod event_source;
pub mod flow_key;
pub mod tcp_tracker;
pub mod types;

pub use capture_source::CaptureSource;
pub use event_source::EventSource;
pub use flow_key::{FlowKey, FlowKeyResolver, FlowKind};
