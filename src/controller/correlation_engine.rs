use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info};

use crate::data_capture::payload_sink::PayloadSink;
use crate::data_capture::recorder::StreamRecorder;
use crate::error_handling::types::{EngineError, StorageError};
use crate::network::event_source::EventSource;
use crate::network::flow_key::FlowKeyResolver;
use crate::network::types::{FlowEvent, IPPROTO_TCP, IPPROTO_UDP};
use crate::session_management::{EventContext, FlowRegistry, SessionLifecycleController};
use crate::storage::storage_trait::FlowStore;
use crate::storage::types::Channels;

/// Totals reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub events: u64,
    /// IP events carrying TCP or UDP, which arrive through their own events.
    pub ignored_events: u64,
    pub flows_created: u64,
    pub bytes_written: u64,
    pub segments: u64,
    /// Payload writes dropped because the sink failed.
    pub write_failures: u64,
    /// Connections finalized by the engine because the input never closed them.
    pub connections_exited: u64,
    /// Connectionless streams finalized by the end-of-input sweep.
    pub streams_finalized: u64,
    /// The event source failed before end of input.
    pub truncated: bool,
}

/// Top-level driver: resolves each event's key, hands TCP events to the
/// lifecycle controller and records connectionless flows directly.
pub struct FlowCorrelationEngine {
    store: Arc<dyn FlowStore>,
    registry: Arc<FlowRegistry>,
    recorder: Arc<StreamRecorder>,
    lifecycle: SessionLifecycleController,
    events: u64,
    ignored: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl FlowCorrelationEngine {
    pub fn new(store: Arc<dyn FlowStore>, sink: Arc<dyn PayloadSink>, embed_payload: bool) -> Self {
        let registry = Arc::new(FlowRegistry::new(store.clone()));
        let recorder = Arc::new(
            StreamRecorder::new(sink, store.clone()).with_embedded_payload(embed_payload),
        );
        let lifecycle =
            SessionLifecycleController::new(registry.clone(), recorder.clone(), store.clone());
        Self {
            store,
            registry,
            recorder,
            lifecycle,
            events: 0,
            ignored: 0,
            last_timestamp: None,
        }
    }

    pub fn lifecycle(&self) -> &SessionLifecycleController {
        &self.lifecycle
    }

    /// Handles one event to completion.
    pub fn dispatch(&mut self, event: &FlowEvent) -> Result<(), EngineError> {
        self.events += 1;
        let ctx = EventContext {
            sequence: self.events,
            key: FlowKeyResolver::resolve(event),
            timestamp: event.timestamp(),
        };
        if self.last_timestamp.map_or(true, |t| ctx.timestamp > t) {
            self.last_timestamp = Some(ctx.timestamp);
        }

        match event {
            FlowEvent::Ip(d) if d.protocol == IPPROTO_TCP || d.protocol == IPPROTO_UDP => {
                self.ignored += 1;
                debug!("[{}] ignored, carried by transport events", ctx.key);
                Ok(())
            }
            FlowEvent::Ip(d) => self.connectionless(&ctx, d.payload()),
            FlowEvent::Udp(d) => self.connectionless(&ctx, &d.payload),
            FlowEvent::Tcp(e) => self.lifecycle.handle(&ctx, e).map(|_| ()),
        }
    }

    fn connectionless(&mut self, ctx: &EventContext, payload: &[u8]) -> Result<(), EngineError> {
        let resolution = self.registry.find_or_create(ctx)?;
        let Channels::Simplex(stream) = resolution.handle.channels else {
            return Err(EngineError::PersistenceFailure {
                operation: "find_or_create",
                source: StorageError::NotFound {
                    what: format!("stream of record {}", resolution.handle.id),
                },
            });
        };
        self.recorder.record(stream, payload, ctx.timestamp)?;
        self.store
            .set_stream_last_time(stream, ctx.timestamp)
            .map_err(EngineError::persistence("set_stream_last_time"))?;
        Ok(())
    }

    /// Consumes `source` to its end, then finalizes everything still open.
    ///
    /// A source error ends input early: it is logged and finalization still
    /// runs. Only persistence and protocol errors are returned.
    pub fn run<S: EventSource + ?Sized>(&mut self, source: &mut S) -> Result<RunSummary, EngineError> {
        let mut truncated = false;
        loop {
            match source.next_event() {
                Ok(Some(event)) => self.dispatch(&event)?,
                Ok(None) => break,
                Err(e) => {
                    error!("Capture input ended early: {}", e);
                    truncated = true;
                    break;
                }
            }
        }
        let mut summary = self.finish()?;
        summary.truncated = truncated;
        Ok(summary)
    }

    /// End-of-input handling: exits every connection still bound to a token,
    /// then sweeps connectionless streams that lack a data path.
    pub fn finish(&mut self) -> Result<RunSummary, EngineError> {
        let now = self.last_timestamp.unwrap_or_else(Utc::now);
        let exited = self.lifecycle.exit_all(now)?;
        if exited > 0 {
            info!("Finalized {} connections left open at end of input", exited);
        }
        let swept = self.sweep()?;

        let stats = self.recorder.stats();
        let summary = RunSummary {
            events: self.events,
            ignored_events: self.ignored,
            flows_created: self.registry.created_count(),
            bytes_written: stats.bytes_written,
            segments: stats.segments,
            write_failures: stats.write_failures,
            connections_exited: exited as u64,
            streams_finalized: swept as u64,
            truncated: false,
        };
        info!(
            "Run complete: events={}, flows={}, bytes={}, segments={}, write_failures={}, exited={}, swept={}",
            summary.events,
            summary.flows_created,
            summary.bytes_written,
            summary.segments,
            summary.write_failures,
            summary.connections_exited,
            summary.streams_finalized
        );
        Ok(summary)
    }

    /// Sets the data path of every connectionless stream still lacking one.
    pub fn sweep(&self) -> Result<usize, EngineError> {
        let pending = self
            .store
            .pending_connectionless_streams()
            .map_err(EngineError::persistence("pending_connectionless_streams"))?;
        for stream in &pending {
            self.recorder.finalize(*stream)?;
        }
        debug!("Swept {} connectionless streams", pending.len());
        Ok(pending.len())
    }
}
