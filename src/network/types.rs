//! Events delivered by the reassembly engine and the address tuples they carry.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Source address, destination address and IP protocol of a connectionless flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple3 {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
}

impl fmt::Display for Tuple3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} proto {}",
            self.source, self.destination, self.protocol
        )
    }
}

/// Address/port pair of a TCP or UDP flow, oriented as the reassembly engine presents it.
/// For TCP the source side is the client that opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple4 {
    pub source: Ipv4Addr,
    pub source_port: u16,
    pub destination: Ipv4Addr,
    pub destination_port: u16,
}

impl Tuple4 {
    pub fn reversed(&self) -> Tuple4 {
        Tuple4 {
            source: self.destination,
            source_port: self.destination_port,
            destination: self.source,
            destination_port: self.source_port,
        }
    }
}

impl fmt::Display for Tuple4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.source, self.source_port, self.destination, self.destination_port
        )
    }
}

/// Opaque per-connection handle minted by the reassembly engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionToken(pub u64);

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An IPv4 datagram whose protocol is neither TCP nor UDP.
///
/// `packet` holds the whole datagram, header included; the payload starts at
/// `payload_offset` and spans `payload_len` bytes.
#[derive(Debug, Clone)]
pub struct IpDatagram {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub packet: Vec<u8>,
    pub payload_offset: usize,
    pub payload_len: usize,
    pub timestamp: DateTime<Utc>,
}

impl IpDatagram {
    pub fn payload(&self) -> &[u8] {
        let end = self
            .payload_offset
            .saturating_add(self.payload_len)
            .min(self.packet.len());
        let start = self.payload_offset.min(end);
        &self.packet[start..end]
    }
}

/// A UDP datagram with its payload.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub addr: Tuple4,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// What happened to a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpEventKind {
    Established,
    Data,
    Closed,
    Reset,
    Exiting,
}

impl TcpEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TcpEventKind::Established => "established",
            TcpEventKind::Data => "data",
            TcpEventKind::Closed => "closed",
            TcpEventKind::Reset => "reset",
            TcpEventKind::Exiting => "exiting",
        }
    }
}

/// Bytes newly made available on one half of a connection.
#[derive(Debug, Clone, Default)]
pub struct HalfStream {
    pub count_new: usize,
    pub data: Vec<u8>,
}

impl HalfStream {
    pub fn with_data(data: &[u8]) -> Self {
        Self {
            count_new: data.len(),
            data: data.to_vec(),
        }
    }

    /// The trailing `count_new` bytes of the buffer.
    pub fn new_bytes(&self) -> &[u8] {
        let start = self.data.len().saturating_sub(self.count_new);
        &self.data[start..]
    }
}

/// A lifecycle or data notification for one TCP connection.
///
/// `server` holds bytes received by the server (sent by the client), `client`
/// holds bytes received by the client.
#[derive(Debug, Clone)]
pub struct TcpEvent {
    pub token: ConnectionToken,
    pub kind: TcpEventKind,
    pub addr: Tuple4,
    pub server: HalfStream,
    pub client: HalfStream,
    pub timestamp: DateTime<Utc>,
}

impl TcpEvent {
    pub fn lifecycle(
        token: ConnectionToken,
        kind: TcpEventKind,
        addr: Tuple4,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            token,
            kind,
            addr,
            server: HalfStream::default(),
            client: HalfStream::default(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FlowEvent {
    Ip(IpDatagram),
    Tcp(TcpEvent),
    Udp(UdpDatagram),
}

impl FlowEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            FlowEvent::Ip(d) => d.timestamp,
            FlowEvent::Tcp(e) => e.timestamp,
            FlowEvent::Udp(d) => d.timestamp,
        }
    }
}
