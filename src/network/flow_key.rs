//! Flow identity.
//!
//! A [`FlowKey`] is derived from an event exactly as the reassembly engine
//! presented it. Direction is significant: `a -> b` and `b -> a` are distinct
//! keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{FlowEvent, Tuple3, Tuple4};

/// Kind of persistent record a key maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowKind {
    Ip,
    Udp,
    Tcp,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::Ip => "ip",
            FlowKind::Udp => "udp",
            FlowKind::Tcp => "tcp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowKey {
    Ip(Tuple3),
    Udp(Tuple4),
    Tcp(Tuple4),
}

impl FlowKey {
    pub fn kind(&self) -> FlowKind {
        match self {
            FlowKey::Ip(_) => FlowKind::Ip,
            FlowKey::Udp(_) => FlowKind::Udp,
            FlowKey::Tcp(_) => FlowKind::Tcp,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKey::Ip(t) => write!(f, "ip {}", t),
            FlowKey::Udp(t) => write!(f, "udp {}", t),
            FlowKey::Tcp(t) => write!(f, "tcp {}", t),
        }
    }
}

/// Derives flow keys from events. Pure and infallible.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowKeyResolver;

impl FlowKeyResolver {
    pub fn resolve(event: &FlowEvent) -> FlowKey {
        match event {
            FlowEvent::Ip(d) => FlowKey::Ip(Tuple3 {
                source: d.source,
                destination: d.destination,
                protocol: d.protocol,
            }),
            FlowEvent::Udp(d) => FlowKey::Udp(d.addr),
            FlowEvent::Tcp(e) => FlowKey::Tcp(e.addr),
        }
    }
}
