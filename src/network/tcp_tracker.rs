//! Minimal TCP connection tracking for capture replay.
//!
//! Turns decoded TCP segments into connection events. Only connections whose
//! three-way handshake was captured are followed. Payload is delivered in
//! capture order: retransmitted bytes are trimmed, gaps are not waited for.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, trace};

use super::types::{ConnectionToken, HalfStream, TcpEvent, TcpEventKind, Tuple4};

/// One decoded TCP segment, oriented as it travelled on the wire.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub addr: Tuple4,
    pub seq: u32,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SynSent,
    SynReceived,
    Established,
}

/// Sequence state of the bytes one endpoint sends.
#[derive(Debug, Clone, Copy, Default)]
struct Sender {
    next_seq: Option<u32>,
    fin: bool,
}

impl Sender {
    /// Returns the part of `payload` starting at `seq` not yet delivered.
    fn accept<'a>(&mut self, seq: u32, payload: &'a [u8]) -> &'a [u8] {
        let skip = match self.next_seq {
            Some(next) => {
                let ahead = seq.wrapping_sub(next) as i32;
                if ahead >= 0 {
                    0
                } else {
                    ahead.unsigned_abs() as usize
                }
            }
            None => 0,
        };
        if skip >= payload.len() {
            return &[];
        }
        let fresh = &payload[skip..];
        self.next_seq = Some(
            seq.wrapping_add(skip as u32)
                .wrapping_add(fresh.len() as u32),
        );
        fresh
    }
}

#[derive(Debug)]
struct Connection {
    token: Option<ConnectionToken>,
    /// Client -> server orientation.
    addr: Tuple4,
    phase: Phase,
    client: Sender,
    server: Sender,
}

#[derive(Debug, Default)]
pub struct TcpTracker {
    connections: HashMap<Tuple4, Connection>,
    next_token: u64,
}

impl TcpTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one segment; returns the events it produced, in order.
    pub fn process(&mut self, seg: &TcpSegment) -> Vec<TcpEvent> {
        let (key, from_client) = if self.connections.contains_key(&seg.addr) {
            (seg.addr, true)
        } else if self.connections.contains_key(&seg.addr.reversed()) {
            (seg.addr.reversed(), false)
        } else {
            if seg.syn && !seg.ack && !seg.rst {
                trace!("[tcp {}] SYN seen", seg.addr);
                self.connections.insert(
                    seg.addr,
                    Connection {
                        token: None,
                        addr: seg.addr,
                        phase: Phase::SynSent,
                        client: Sender {
                            next_seq: Some(seg.seq.wrapping_add(1)),
                            fin: false,
                        },
                        server: Sender::default(),
                    },
                );
            }
            return Vec::new();
        };

        let mut events = Vec::new();
        let mut remove = false;
        let Some(conn) = self.connections.get_mut(&key) else {
            return events;
        };

        if seg.rst {
            if let (Phase::Established, Some(token)) = (conn.phase, conn.token) {
                events.push(TcpEvent::lifecycle(
                    token,
                    TcpEventKind::Reset,
                    conn.addr,
                    seg.timestamp,
                ));
            }
            self.connections.remove(&key);
            return events;
        }

        match conn.phase {
            Phase::SynSent => {
                if !from_client && seg.syn && seg.ack {
                    conn.server.next_seq = Some(seg.seq.wrapping_add(1));
                    conn.phase = Phase::SynReceived;
                }
                return events;
            }
            Phase::SynReceived => {
                if from_client && seg.ack && !seg.syn {
                    self.next_token += 1;
                    let token = ConnectionToken(self.next_token);
                    conn.token = Some(token);
                    conn.phase = Phase::Established;
                    debug!("[tcp {}] handshake complete, token {}", conn.addr, token);
                    events.push(TcpEvent::lifecycle(
                        token,
                        TcpEventKind::Established,
                        conn.addr,
                        seg.timestamp,
                    ));
                } else {
                    return events;
                }
            }
            Phase::Established => {}
        }

        let Some(token) = conn.token else {
            return events;
        };
        let sender = if from_client {
            &mut conn.client
        } else {
            &mut conn.server
        };
        let fresh = sender.accept(seg.seq, &seg.payload);
        if !fresh.is_empty() {
            let mut event = TcpEvent::lifecycle(token, TcpEventKind::Data, conn.addr, seg.timestamp);
            // The receiving half carries the bytes.
            if from_client {
                event.server = HalfStream::with_data(fresh);
            } else {
                event.client = HalfStream::with_data(fresh);
            }
            events.push(event);
        }
        if seg.fin && !sender.fin {
            sender.fin = true;
            sender.next_seq = sender.next_seq.map(|n| n.wrapping_add(1));
        }
        if conn.client.fin && conn.server.fin {
            events.push(TcpEvent::lifecycle(
                token,
                TcpEventKind::Closed,
                conn.addr,
                seg.timestamp,
            ));
            remove = true;
        }
        if remove {
            self.connections.remove(&key);
        }
        events
    }

    /// End of capture: an `Exiting` event per established connection, in
    /// token order. Clears all state.
    pub fn finish(&mut self, timestamp: DateTime<Utc>) -> Vec<TcpEvent> {
        let mut open: Vec<(ConnectionToken, Tuple4)> = self
            .connections
            .values()
            .filter_map(|c| c.token.map(|t| (t, c.addr)))
            .collect();
        open.sort_by_key(|(token, _)| *token);
        self.connections.clear();
        open.into_iter()
            .map(|(token, addr)| {
                TcpEvent::lifecycle(token, TcpEventKind::Exiting, addr, timestamp)
            })
            .collect()
    }

    pub fn tracked(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn client_addr() -> Tuple4 {
        Tuple4 {
            source: Ipv4Addr::new(10, 0, 0, 1),
            source_port: 40000,
            destination: Ipv4Addr::new(10, 0, 0, 2),
            destination_port: 80,
        }
    }

    fn seg(from_client: bool, seq: u32, flags: &str, payload: &[u8]) -> TcpSegment {
        let addr = if from_client {
            client_addr()
        } else {
            client_addr().reversed()
        };
        TcpSegment {
            addr,
            seq,
            syn: flags.contains('S'),
            ack: flags.contains('A'),
            fin: flags.contains('F'),
            rst: flags.contains('R'),
            payload: payload.to_vec(),
            timestamp: DateTime::from_timestamp(1_700_000_000 + seq as i64 % 1000, 0).unwrap(),
        }
    }

    fn handshake(t: &mut TcpTracker) -> Vec<TcpEvent> {
        let mut out = Vec::new();
        out.extend(t.process(&seg(true, 100, "S", b"")));
        out.extend(t.process(&seg(false, 500, "SA", b"")));
        out.extend(t.process(&seg(true, 101, "A", b"")));
        out
    }

    fn kinds(events: &[TcpEvent]) -> Vec<TcpEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn handshake_yields_established_with_client_orientation() {
        let mut t = TcpTracker::new();
        let events = handshake(&mut t);
        assert_eq!(kinds(&events), vec![TcpEventKind::Established]);
        assert_eq!(events[0].addr, client_addr());
        assert_eq!(events[0].token, ConnectionToken(1));
    }

    #[test]
    fn payload_is_attributed_to_the_receiving_half() {
        let mut t = TcpTracker::new();
        handshake(&mut t);
        let up = t.process(&seg(true, 101, "PA", b"hello"));
        assert_eq!(up[0].server.new_bytes(), b"hello");
        assert_eq!(up[0].client.count_new, 0);
        let down = t.process(&seg(false, 501, "PA", b"world!"));
        assert_eq!(down[0].client.new_bytes(), b"world!");
        assert_eq!(down[0].server.count_new, 0);
    }

    #[test]
    fn retransmissions_are_trimmed() {
        let mut t = TcpTracker::new();
        handshake(&mut t);
        t.process(&seg(true, 101, "PA", b"abcd"));
        assert!(t.process(&seg(true, 101, "PA", b"abcd")).is_empty());
        let overlap = t.process(&seg(true, 103, "PA", b"cdef"));
        assert_eq!(overlap[0].server.new_bytes(), b"ef");
    }

    #[test]
    fn fin_from_both_sides_closes() {
        let mut t = TcpTracker::new();
        handshake(&mut t);
        assert!(t.process(&seg(true, 101, "FA", b"")).is_empty());
        let events = t.process(&seg(false, 501, "FA", b""));
        assert_eq!(kinds(&events), vec![TcpEventKind::Closed]);
        assert_eq!(t.tracked(), 0);
    }

    #[test]
    fn data_with_fin_emits_data_then_closed() {
        let mut t = TcpTracker::new();
        handshake(&mut t);
        t.process(&seg(false, 501, "FA", b""));
        let events = t.process(&seg(true, 101, "FPA", b"bye"));
        assert_eq!(kinds(&events), vec![TcpEventKind::Data, TcpEventKind::Closed]);
    }

    #[test]
    fn rst_resets_established_connection() {
        let mut t = TcpTracker::new();
        handshake(&mut t);
        let events = t.process(&seg(false, 501, "R", b""));
        assert_eq!(kinds(&events), vec![TcpEventKind::Reset]);
    }

    #[test]
    fn rst_during_handshake_is_silent() {
        let mut t = TcpTracker::new();
        t.process(&seg(true, 100, "S", b""));
        assert!(t.process(&seg(false, 0, "RA", b"")).is_empty());
        assert_eq!(t.tracked(), 0);
    }

    #[test]
    fn midstream_traffic_is_ignored() {
        let mut t = TcpTracker::new();
        assert!(t.process(&seg(true, 9000, "PA", b"data")).is_empty());
        assert_eq!(t.tracked(), 0);
    }

    #[test]
    fn finish_reports_established_connections_in_token_order() {
        let mut t = TcpTracker::new();
        handshake(&mut t);
        let mut second = seg(true, 100, "S", b"");
        second.addr.source_port = 40001;
        t.process(&second);
        let mut synack = seg(false, 700, "SA", b"");
        synack.addr = second.addr.reversed();
        t.process(&synack);
        let mut ack = seg(true, 101, "A", b"");
        ack.addr = second.addr;
        t.process(&ack);
        // Never completes its handshake.
        let mut third = seg(true, 100, "S", b"");
        third.addr.source_port = 40002;
        t.process(&third);

        let events = t.finish(DateTime::from_timestamp(1_700_000_100, 0).unwrap());
        assert_eq!(kinds(&events), vec![TcpEventKind::Exiting, TcpEventKind::Exiting]);
        assert_eq!(events[0].token, ConnectionToken(1));
        assert_eq!(events[1].token, ConnectionToken(2));
        assert_eq!(t.tracked(), 0);
    }
}
