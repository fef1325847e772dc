//! Capture-file event source.
//!
//! Reads legacy pcap or pcapng with `pcap_parser`, decodes IPv4 frames with
//! `etherparse` and turns them into [`FlowEvent`]s:
//! - non-TCP/UDP datagrams become IP events,
//! - UDP datagrams become UDP events,
//! - TCP segments go through [`TcpTracker`].
//!
//! Fragmented datagrams, IPv6 and unknown link types are skipped.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use etherparse::{Ethernet2HeaderSlice, Ipv4HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use log::{debug, info, trace};
use pcap_parser::pcapng::Block;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{PcapBlockOwned, PcapError};

use crate::error_handling::types::CaptureError;

use super::event_source::EventSource;
use super::tcp_tracker::{TcpSegment, TcpTracker};
use super::types::{FlowEvent, IpDatagram, Tuple4, UdpDatagram, IPPROTO_TCP, IPPROTO_UDP};

const BUFFER_SIZE: usize = 65536;

const LINKTYPE_ETHERNET: i32 = 1;
const LINKTYPE_RAW_BSD: i32 = 12;
const LINKTYPE_RAW: i32 = 101;
const LINKTYPE_LINUX_SLL: i32 = 113;
const LINKTYPE_IPV4: i32 = 228;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;

/// Link type and timestamp resolution of one capture interface.
#[derive(Debug, Clone, Copy)]
struct Interface {
    linktype: i32,
    /// Timestamp units per second.
    units_per_sec: u64,
}

impl Interface {
    fn from_tsresol(linktype: i32, tsresol: u8) -> Self {
        let exp = u32::from(tsresol & 0x7f);
        let units_per_sec = if tsresol & 0x80 == 0 {
            10u64.checked_pow(exp)
        } else {
            2u64.checked_pow(exp)
        }
        .unwrap_or(1_000_000);
        Self {
            linktype,
            units_per_sec,
        }
    }

    fn timestamp(&self, units: u64) -> Option<DateTime<Utc>> {
        let secs = units / self.units_per_sec;
        let frac = units % self.units_per_sec;
        let nanos = (u128::from(frac) * 1_000_000_000 / u128::from(self.units_per_sec)) as u32;
        DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
    }
}

fn interface(interfaces: &[Interface], index: usize) -> Result<Interface, CaptureError> {
    interfaces.get(index).copied().ok_or_else(|| {
        CaptureError::Malformed(format!("packet references unknown interface {}", index))
    })
}

/// A captured frame copied out of the reader's buffer.
struct Frame {
    linktype: i32,
    timestamp: DateTime<Utc>,
    data: Vec<u8>,
}

/// What a frame decoded to.
#[derive(Debug)]
enum Decoded {
    Ip(IpDatagram),
    Udp(UdpDatagram),
    Tcp(TcpSegment),
}

/// Returns the IPv4 packet carried by a frame of the given link type.
fn ipv4_packet(linktype: i32, data: &[u8]) -> Option<&[u8]> {
    match linktype {
        LINKTYPE_ETHERNET => {
            let eth = Ethernet2HeaderSlice::from_slice(data).ok()?;
            let mut ether_type = eth.ether_type().0;
            let mut rest = &data[eth.slice().len()..];
            if ether_type == ETHERTYPE_VLAN {
                if rest.len() < 4 {
                    return None;
                }
                ether_type = u16::from_be_bytes([rest[2], rest[3]]);
                rest = &rest[4..];
            }
            (ether_type == ETHERTYPE_IPV4).then_some(rest)
        }
        LINKTYPE_LINUX_SLL => {
            if data.len() < 16 || u16::from_be_bytes([data[14], data[15]]) != ETHERTYPE_IPV4 {
                return None;
            }
            Some(&data[16..])
        }
        LINKTYPE_RAW | LINKTYPE_RAW_BSD | LINKTYPE_IPV4 => Some(data),
        _ => None,
    }
}

fn decode(linktype: i32, data: &[u8], timestamp: DateTime<Utc>) -> Option<Decoded> {
    let packet = ipv4_packet(linktype, data)?;
    let ip = Ipv4HeaderSlice::from_slice(packet).ok()?;
    if ip.more_fragments() || ip.fragments_offset().value() != 0 {
        trace!(
            "skipping fragment {} -> {}",
            ip.source_addr(),
            ip.destination_addr()
        );
        return None;
    }
    let header_len = ip.slice().len();
    let total_len = usize::from(ip.total_len()).clamp(header_len, packet.len());
    let packet = &packet[..total_len];
    let body = &packet[header_len..];
    let protocol = ip.protocol().0;

    match protocol {
        IPPROTO_UDP => {
            let udp = UdpHeaderSlice::from_slice(body).ok()?;
            let end = usize::from(udp.length()).clamp(8, body.len());
            Some(Decoded::Udp(UdpDatagram {
                addr: Tuple4 {
                    source: ip.source_addr(),
                    source_port: udp.source_port(),
                    destination: ip.destination_addr(),
                    destination_port: udp.destination_port(),
                },
                payload: body[8..end].to_vec(),
                timestamp,
            }))
        }
        IPPROTO_TCP => {
            let tcp = TcpHeaderSlice::from_slice(body).ok()?;
            Some(Decoded::Tcp(TcpSegment {
                addr: Tuple4 {
                    source: ip.source_addr(),
                    source_port: tcp.source_port(),
                    destination: ip.destination_addr(),
                    destination_port: tcp.destination_port(),
                },
                seq: tcp.sequence_number(),
                syn: tcp.syn(),
                ack: tcp.ack(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                payload: body[tcp.slice().len()..].to_vec(),
                timestamp,
            }))
        }
        _ => Some(Decoded::Ip(IpDatagram {
            source: ip.source_addr(),
            destination: ip.destination_addr(),
            protocol,
            packet: packet.to_vec(),
            payload_offset: header_len,
            payload_len: body.len(),
            timestamp,
        })),
    }
}

/// Replays a capture file as flow events.
pub struct CaptureSource {
    name: PathBuf,
    reader: Box<dyn PcapReaderIterator>,
    interfaces: Vec<Interface>,
    tracker: TcpTracker,
    pending: VecDeque<FlowEvent>,
    last_timestamp: DateTime<Utc>,
    frames: u64,
    skipped: u64,
    exhausted: bool,
}

impl CaptureSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| CaptureError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_reader(path, file)
    }

    /// Reads a capture from any byte source. `name` is only used in messages.
    pub fn from_reader<P, R>(name: P, reader: R) -> Result<Self, CaptureError>
    where
        P: AsRef<Path>,
        R: Read + 'static,
    {
        let name = name.as_ref().to_path_buf();
        let reader = pcap_parser::create_reader(BUFFER_SIZE, reader).map_err(|e| {
            CaptureError::Open {
                path: name.clone(),
                reason: e.to_string(),
            }
        })?;
        info!("Reading capture {}", name.display());
        Ok(Self {
            name,
            reader,
            interfaces: Vec::new(),
            tracker: TcpTracker::new(),
            pending: VecDeque::new(),
            last_timestamp: DateTime::<Utc>::UNIX_EPOCH,
            frames: 0,
            skipped: 0,
            exhausted: false,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let frame = match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            let tsresol = if header.is_nanosecond_precision() { 9 } else { 6 };
                            self.interfaces =
                                vec![Interface::from_tsresol(header.network.0, tsresol)];
                            None
                        }
                        PcapBlockOwned::Legacy(packet) => {
                            let iface = interface(&self.interfaces, 0)?;
                            let units = u64::from(packet.ts_sec) * iface.units_per_sec
                                + u64::from(packet.ts_usec);
                            Some((iface, Some(units), packet.data.to_vec()))
                        }
                        PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                            self.interfaces.clear();
                            None
                        }
                        PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                            self.interfaces
                                .push(Interface::from_tsresol(idb.linktype.0, idb.if_tsresol));
                            None
                        }
                        PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                            let iface = interface(&self.interfaces, epb.if_id as usize)?;
                            let units = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                            Some((iface, Some(units), epb.data.to_vec()))
                        }
                        PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                            // No timestamp; reuse the previous one.
                            let iface = interface(&self.interfaces, 0)?;
                            Some((iface, None, spb.data.to_vec()))
                        }
                        _ => None,
                    };
                    self.reader.consume(offset);
                    if let Some((iface, units, data)) = frame {
                        self.frames += 1;
                        let timestamp = match units {
                            Some(units) => iface.timestamp(units).ok_or_else(|| {
                                CaptureError::Malformed(format!(
                                    "frame {} has an out-of-range timestamp",
                                    self.frames
                                ))
                            })?,
                            None => self.last_timestamp,
                        };
                        return Ok(Some(Frame {
                            linktype: iface.linktype,
                            timestamp,
                            data,
                        }));
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    self.reader.refill().map_err(|e| {
                        CaptureError::Malformed(format!("{}: {}", self.name.display(), e))
                    })?;
                }
                Err(e) => {
                    return Err(CaptureError::Malformed(format!(
                        "{}: {}",
                        self.name.display(),
                        e
                    )))
                }
            }
        }
    }

    fn enqueue(&mut self, frame: Frame) {
        if frame.timestamp > self.last_timestamp {
            self.last_timestamp = frame.timestamp;
        }
        match decode(frame.linktype, &frame.data, frame.timestamp) {
            Some(Decoded::Ip(d)) => self.pending.push_back(FlowEvent::Ip(d)),
            Some(Decoded::Udp(d)) => self.pending.push_back(FlowEvent::Udp(d)),
            Some(Decoded::Tcp(seg)) => {
                for event in self.tracker.process(&seg) {
                    self.pending.push_back(FlowEvent::Tcp(event));
                }
            }
            None => {
                self.skipped += 1;
                trace!("frame {} skipped", self.frames);
            }
        }
    }
}

impl EventSource for CaptureSource {
    fn next_event(&mut self) -> Result<Option<FlowEvent>, CaptureError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.exhausted {
                return Ok(None);
            }
            match self.next_frame()? {
                Some(frame) => self.enqueue(frame),
                None => {
                    self.exhausted = true;
                    let exiting = self.tracker.finish(self.last_timestamp);
                    debug!(
                        "{}: end of capture after {} frames ({} skipped), {} open connections",
                        self.name.display(),
                        self.frames,
                        self.skipped,
                        exiting.len()
                    );
                    self.pending
                        .extend(exiting.into_iter().map(FlowEvent::Tcp));
                }
            }
        }
    }
}
