//! Flow correlation and TCP session lifecycle.
//!
//! This module holds the per-event context and connection states shared by
//! its submodules:
//! - `flow_registry`: lookup-or-create from flow key to persisted record.
//! - `session_lifecycle`: per-connection state machine driving finalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::network::flow_key::FlowKey;

pub mod flow_registry;
pub mod session_lifecycle;

pub use flow_registry::{FlowRegistry, Resolution};
pub use session_lifecycle::SessionLifecycleController;

/// State of one TCP connection as seen by the lifecycle controller.
///
/// Variants:
/// - `Established`: handshake seen, record bound to the connection token.
/// - `Active`: at least one data event handled.
/// - `Closed`: normal close; terminal.
/// - `Reset`: aborted by RST; terminal.
/// - `Exiting`: finalized at end of input without a close; terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Established,
    Active,
    Closed,
    Reset,
    Exiting,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Closed | ConnectionState::Reset | ConnectionState::Exiting
        )
    }
}

/// Everything known about the event being handled, built once by the driver
/// and passed down by reference.
#[derive(Debug, Clone, Copy)]
pub struct EventContext {
    /// Position of the event in the input, starting at 1.
    pub sequence: u64,
    pub key: FlowKey,
    pub timestamp: DateTime<Utc>,
}
