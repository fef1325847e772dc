use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::network::flow_key::FlowKey;

/// Store-assigned identifier of a flow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub i64);

/// Store-assigned identifier of a payload stream. Also names its sink file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub i64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload streams owned by a flow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channels {
    /// IP-only and UDP flows.
    Simplex(StreamId),
    /// TCP: client -> server (`outbound`) and server -> client (`inbound`).
    Duplex {
        outbound: StreamId,
        inbound: StreamId,
    },
}

impl Channels {
    pub fn streams(&self) -> Vec<StreamId> {
        match *self {
            Channels::Simplex(s) => vec![s],
            Channels::Duplex { outbound, inbound } => vec![outbound, inbound],
        }
    }
}

/// Reference to a persisted flow record, as returned by lookups and creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowHandle {
    pub id: FlowId,
    pub key: FlowKey,
    pub channels: Channels,
}

/// How a TCP connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalStatus {
    NormalClose,
    Reset,
}

impl FinalStatus {
    pub fn code(&self) -> i64 {
        match self {
            FinalStatus::NormalClose => 0,
            FinalStatus::Reset => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(FinalStatus::NormalClose),
            1 => Some(FinalStatus::Reset),
            _ => None,
        }
    }
}

/// One recorded payload append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// 1-based position in the stream.
    pub number: u64,
    /// Offset of the first byte in the stream file.
    pub offset: u64,
    pub length: u64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: StreamId,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub first_time: DateTime<Utc>,
    pub last_time: DateTime<Utc>,
    pub data_path: Option<String>,
    pub data: Option<Vec<u8>>,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: FlowId,
    pub source_port: u16,
    pub destination_port: u16,
    pub last_time: DateTime<Utc>,
    pub final_status: Option<FinalStatus>,
    pub outbound: StreamRecord,
    pub inbound: StreamRecord,
}

/// Microseconds since the Unix epoch; the store's on-disk time format.
pub(crate) fn to_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}
