//! Per-connection TCP state machine.
//!
//! ```text
//! established ──> ESTABLISHED ──data──> ACTIVE ──data──> ACTIVE
//!                      │                   │
//!                      └──────┬────────────┘
//!                             ├─ closed  ──> CLOSED   final_status, last_time, data paths
//!                             ├─ reset   ──> RESET    final_status, last_time, data paths
//!                             └─ exiting ──> EXITING  data paths only
//! ```
//!
//! The connection token handed out by the reassembly engine is bound to the
//! record id at establishment and looked up, never re-derived, afterwards.
//! A new token on a live 4-tuple shares that record; the record is finalized
//! when the last token bound to it terminates.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::data_capture::recorder::StreamRecorder;
use crate::error_handling::types::{EngineError, StorageError};
use crate::network::types::{ConnectionToken, TcpEvent, TcpEventKind};
use crate::storage::storage_trait::FlowStore;
use crate::storage::types::{Channels, FinalStatus, FlowHandle, FlowId, StreamId};

use super::flow_registry::FlowRegistry;
use super::{ConnectionState, EventContext};

#[derive(Debug, Clone, Copy)]
struct TrackedConnection {
    id: FlowId,
    state: ConnectionState,
}

pub struct SessionLifecycleController {
    registry: Arc<FlowRegistry>,
    recorder: Arc<StreamRecorder>,
    store: Arc<dyn FlowStore>,
    connections: HashMap<ConnectionToken, TrackedConnection>,
}

fn duplex(handle: &FlowHandle) -> Result<(StreamId, StreamId), EngineError> {
    match handle.channels {
        Channels::Duplex { outbound, inbound } => Ok((outbound, inbound)),
        Channels::Simplex(_) => Err(EngineError::PersistenceFailure {
            operation: "find_or_create",
            source: StorageError::NotFound {
                what: format!("directional streams of record {}", handle.id),
            },
        }),
    }
}

impl SessionLifecycleController {
    pub fn new(
        registry: Arc<FlowRegistry>,
        recorder: Arc<StreamRecorder>,
        store: Arc<dyn FlowStore>,
    ) -> Self {
        Self {
            registry,
            recorder,
            store,
            connections: HashMap::new(),
        }
    }

    /// Applies one TCP event and returns the connection's new state.
    pub fn handle(
        &mut self,
        ctx: &EventContext,
        event: &TcpEvent,
    ) -> Result<ConnectionState, EngineError> {
        match event.kind {
            TcpEventKind::Established => self.established(ctx, event.token),
            TcpEventKind::Data => self.data(ctx, event),
            TcpEventKind::Closed => {
                self.terminate(ctx.timestamp, event.token, ConnectionState::Closed)
            }
            TcpEventKind::Reset => self.terminate(ctx.timestamp, event.token, ConnectionState::Reset),
            TcpEventKind::Exiting => {
                self.terminate(ctx.timestamp, event.token, ConnectionState::Exiting)
            }
        }
    }

    fn established(
        &mut self,
        ctx: &EventContext,
        token: ConnectionToken,
    ) -> Result<ConnectionState, EngineError> {
        if let Some(tracked) = self.connections.get(&token) {
            return Err(EngineError::InvalidTransition {
                token,
                from: tracked.state,
                event: TcpEventKind::Established.as_str(),
            });
        }
        let resolution = self.registry.find_or_create(ctx)?;
        let handle = resolution.handle;
        let (outbound, inbound) = duplex(&handle)?;
        self.recorder.precreate(outbound);
        self.recorder.precreate(inbound);
        if !resolution.created {
            if let Some((other, _)) = self.connections.iter().find(|(_, t)| t.id == handle.id) {
                debug!(
                    "[{}] connection {} shares record {} with connection {}",
                    ctx.key, token, handle.id, other
                );
            }
            self.store
                .set_connection_last_time(handle.id, ctx.timestamp)
                .map_err(EngineError::persistence("set_connection_last_time"))?;
        }
        self.connections.insert(
            token,
            TrackedConnection {
                id: handle.id,
                state: ConnectionState::Established,
            },
        );
        info!(
            "[{}] connection {} established, record {}",
            ctx.key, token, handle.id
        );
        Ok(ConnectionState::Established)
    }

    fn data(&mut self, ctx: &EventContext, event: &TcpEvent) -> Result<ConnectionState, EngineError> {
        let tracked = self.tracked(event.token)?;
        let handle = self.registry.find_by_id(tracked.id)?;
        let (outbound, inbound) = duplex(&handle)?;

        // Bytes received by the server were sent by the client: outbound.
        let direction = if event.server.count_new > 0 {
            Some((outbound, event.server.new_bytes()))
        } else if event.client.count_new > 0 {
            Some((inbound, event.client.new_bytes()))
        } else {
            None
        };

        if let Some((stream, bytes)) = direction {
            self.recorder.record(stream, bytes, ctx.timestamp)?;
            self.store
                .set_stream_last_time(stream, ctx.timestamp)
                .map_err(EngineError::persistence("set_stream_last_time"))?;
            debug!(
                "[{}] {} bytes on stream {}",
                handle.key,
                bytes.len(),
                stream
            );
        }
        self.store
            .set_connection_last_time(handle.id, ctx.timestamp)
            .map_err(EngineError::persistence("set_connection_last_time"))?;

        if let Some(t) = self.connections.get_mut(&event.token) {
            t.state = ConnectionState::Active;
        }
        Ok(ConnectionState::Active)
    }

    fn terminate(
        &mut self,
        timestamp: DateTime<Utc>,
        token: ConnectionToken,
        next: ConnectionState,
    ) -> Result<ConnectionState, EngineError> {
        let tracked = self.tracked(token)?;
        self.connections.remove(&token);

        // Another token on the same 4-tuple still holds the record; it finalizes.
        if self.connections.values().any(|t| t.id == tracked.id) {
            if next != ConnectionState::Exiting {
                self.store
                    .set_connection_last_time(tracked.id, timestamp)
                    .map_err(EngineError::persistence("set_connection_last_time"))?;
            }
            info!(
                "[record {}] connection {} {:?}, record still held by another connection",
                tracked.id, token, next
            );
            return Ok(next);
        }

        let handle = self.registry.find_by_id(tracked.id)?;
        let (outbound, inbound) = duplex(&handle)?;

        let status = match next {
            ConnectionState::Closed => Some(FinalStatus::NormalClose),
            ConnectionState::Reset => Some(FinalStatus::Reset),
            _ => None,
        };
        if let Some(status) = status {
            self.store
                .set_final_status(handle.id, status)
                .map_err(EngineError::persistence("set_final_status"))?;
            self.store
                .set_connection_last_time(handle.id, timestamp)
                .map_err(EngineError::persistence("set_connection_last_time"))?;
        }
        self.recorder.finalize(outbound)?;
        self.recorder.finalize(inbound)?;

        info!(
            "[{}] connection {} {:?} after {:?}, record {} finalized",
            handle.key, token, next, tracked.state, handle.id
        );
        Ok(next)
    }

    fn tracked(&self, token: ConnectionToken) -> Result<TrackedConnection, EngineError> {
        self.connections
            .get(&token)
            .copied()
            .ok_or(EngineError::UnknownConnection(token))
    }

    /// Drives every still-bound connection through `EXITING`, in token order.
    /// Returns how many were finalized.
    pub fn exit_all(&mut self, timestamp: DateTime<Utc>) -> Result<usize, EngineError> {
        let tokens = self.open_tokens();
        for token in &tokens {
            self.terminate(timestamp, *token, ConnectionState::Exiting)?;
        }
        Ok(tokens.len())
    }

    /// Tokens of connections not yet in a terminal state, sorted.
    pub fn open_tokens(&self) -> Vec<ConnectionToken> {
        let mut tokens: Vec<ConnectionToken> = self.connections.keys().copied().collect();
        tokens.sort();
        tokens
    }

    pub fn state_of(&self, token: ConnectionToken) -> Option<ConnectionState> {
        self.connections.get(&token).map(|t| t.state)
    }

    /// Record bound to `token`, if the connection is still open.
    pub fn record_of(&self, token: ConnectionToken) -> Option<FlowId> {
        self.connections.get(&token).map(|t| t.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    use crate::data_capture::payload_sink::FilePayloadSink;
    use crate::network::flow_key::FlowKey;
    use crate::network::types::{HalfStream, Tuple4};
    use crate::storage::database_storage::SqliteStore;

    struct Fixture {
        _dir: TempDir,
        dir_path: std::path::PathBuf,
        store: Arc<SqliteStore>,
        controller: SessionLifecycleController,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new().unwrap();
        let dir_path = dir.path().to_path_buf();
        let store = Arc::new(SqliteStore::new_file(dir.path().join("flows.sqlite3")).unwrap());
        let registry = Arc::new(FlowRegistry::new(store.clone()));
        let recorder = Arc::new(StreamRecorder::new(
            Arc::new(FilePayloadSink::new(dir.path())),
            store.clone(),
        ));
        let controller = SessionLifecycleController::new(registry, recorder, store.clone());
        Fixture {
            _dir: dir,
            dir_path,
            store,
            controller,
        }
    }

    fn addr() -> Tuple4 {
        Tuple4 {
            source: Ipv4Addr::new(172, 16, 0, 5),
            source_port: 51000,
            destination: Ipv4Addr::new(172, 16, 0, 1),
            destination_port: 22,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn event(token: u64, kind: TcpEventKind, secs: i64) -> TcpEvent {
        TcpEvent::lifecycle(ConnectionToken(token), kind, addr(), at(secs))
    }

    fn apply(
        c: &mut SessionLifecycleController,
        e: &TcpEvent,
        seq: u64,
    ) -> Result<ConnectionState, EngineError> {
        let ctx = EventContext {
            sequence: seq,
            key: FlowKey::Tcp(e.addr),
            timestamp: e.timestamp,
        };
        c.handle(&ctx, e)
    }

    #[test]
    fn established_precreates_both_streams_and_binds_token() {
        let mut f = fixture();
        let state = apply(&mut f.controller, &event(1, TcpEventKind::Established, 0), 1).unwrap();
        assert_eq!(state, ConnectionState::Established);
        let id = f.controller.record_of(ConnectionToken(1)).unwrap();
        let conn = f.store.load_connection(id).unwrap().unwrap();
        assert!(f.dir_path.join(format!("stream_{}", conn.outbound.id)).exists());
        assert!(f.dir_path.join(format!("stream_{}", conn.inbound.id)).exists());
    }

    #[test]
    fn data_goes_to_the_reporting_direction() {
        let mut f = fixture();
        apply(&mut f.controller, &event(1, TcpEventKind::Established, 0), 1).unwrap();
        let id = f.controller.record_of(ConnectionToken(1)).unwrap();

        let mut to_server = event(1, TcpEventKind::Data, 2);
        to_server.server = HalfStream::with_data(b"GET / HTTP/1.0\r\n");
        apply(&mut f.controller, &to_server, 2).unwrap();

        let mut to_client = event(1, TcpEventKind::Data, 3);
        to_client.client = HalfStream::with_data(b"200");
        let state = apply(&mut f.controller, &to_client, 3).unwrap();
        assert_eq!(state, ConnectionState::Active);

        let conn = f.store.load_connection(id).unwrap().unwrap();
        assert_eq!(conn.outbound.segments.len(), 1);
        assert_eq!(conn.outbound.segments[0].length, 16);
        assert_eq!(conn.outbound.last_time, at(2));
        assert_eq!(conn.inbound.segments.len(), 1);
        assert_eq!(conn.inbound.last_time, at(3));
        assert_eq!(conn.last_time, at(3));
        let out_path = f.dir_path.join(format!("stream_{}", conn.outbound.id));
        assert_eq!(fs::read(out_path).unwrap(), b"GET / HTTP/1.0\r\n");
    }

    #[test]
    fn data_without_new_bytes_only_touches_connection() {
        let mut f = fixture();
        apply(&mut f.controller, &event(1, TcpEventKind::Established, 0), 1).unwrap();
        let id = f.controller.record_of(ConnectionToken(1)).unwrap();
        apply(&mut f.controller, &event(1, TcpEventKind::Data, 4), 2).unwrap();
        let conn = f.store.load_connection(id).unwrap().unwrap();
        assert!(conn.outbound.segments.is_empty());
        assert!(conn.inbound.segments.is_empty());
        assert_eq!(conn.last_time, at(4));
        assert_eq!(conn.outbound.last_time, at(0));
    }

    #[test]
    fn reset_sets_status_and_unbinds() {
        let mut f = fixture();
        apply(&mut f.controller, &event(3, TcpEventKind::Established, 0), 1).unwrap();
        let id = f.controller.record_of(ConnectionToken(3)).unwrap();
        let state = apply(&mut f.controller, &event(3, TcpEventKind::Reset, 9), 2).unwrap();
        assert_eq!(state, ConnectionState::Reset);
        assert_eq!(f.controller.state_of(ConnectionToken(3)), None);
        let conn = f.store.load_connection(id).unwrap().unwrap();
        assert_eq!(conn.final_status, Some(FinalStatus::Reset));
        assert_eq!(conn.last_time, at(9));
        assert!(conn.outbound.data_path.is_some());
        assert!(conn.inbound.data_path.is_some());
    }

    #[test]
    fn events_after_terminal_state_are_unknown() {
        let mut f = fixture();
        apply(&mut f.controller, &event(1, TcpEventKind::Established, 0), 1).unwrap();
        apply(&mut f.controller, &event(1, TcpEventKind::Closed, 1), 2).unwrap();
        let err = apply(&mut f.controller, &event(1, TcpEventKind::Reset, 2), 3).unwrap_err();
        assert!(matches!(err, EngineError::UnknownConnection(ConnectionToken(1))));
    }

    #[test]
    fn duplicate_establishment_is_rejected() {
        let mut f = fixture();
        apply(&mut f.controller, &event(1, TcpEventKind::Established, 0), 1).unwrap();
        let err = apply(&mut f.controller, &event(1, TcpEventKind::Established, 1), 2).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: ConnectionState::Established,
                ..
            }
        ));
    }

    #[test]
    fn earlier_token_on_shared_record_unbinds_without_finalizing() {
        let mut f = fixture();
        apply(&mut f.controller, &event(1, TcpEventKind::Established, 0), 1).unwrap();
        apply(&mut f.controller, &event(2, TcpEventKind::Established, 1), 2).unwrap();
        let id = f.controller.record_of(ConnectionToken(2)).unwrap();
        assert_eq!(f.controller.record_of(ConnectionToken(1)), Some(id));

        apply(&mut f.controller, &event(1, TcpEventKind::Reset, 3), 3).unwrap();
        assert_eq!(f.controller.state_of(ConnectionToken(1)), None);
        let conn = f.store.load_connection(id).unwrap().unwrap();
        assert_eq!(conn.final_status, None);
        assert!(conn.outbound.data_path.is_none());
        assert_eq!(conn.last_time, at(3));

        apply(&mut f.controller, &event(2, TcpEventKind::Closed, 4), 4).unwrap();
        let conn = f.store.load_connection(id).unwrap().unwrap();
        assert_eq!(conn.final_status, Some(FinalStatus::NormalClose));
        assert!(conn.outbound.data_path.is_some());
    }

    #[test]
    fn exit_all_finalizes_open_connections_only() {
        let mut f = fixture();
        apply(&mut f.controller, &event(1, TcpEventKind::Established, 0), 1).unwrap();
        let mut other = event(2, TcpEventKind::Established, 1);
        other.addr.source_port = 51001;
        apply(&mut f.controller, &other, 3).unwrap();
        assert_eq!(f.controller.open_tokens(), vec![ConnectionToken(1), ConnectionToken(2)]);

        assert_eq!(f.controller.exit_all(at(5)).unwrap(), 2);
        assert!(f.controller.open_tokens().is_empty());
    }
}
