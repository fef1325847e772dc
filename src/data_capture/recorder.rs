//! Per-stream payload recording.
//!
//! `StreamRecorder` ties a [`PayloadSink`] to a [`FlowStore`]: each recorded
//! chunk is appended to the stream's backing object and, only if that write
//! succeeded, logged as a segment in the store.
//!
//! Failure handling
//! - Sink failures (open or write) are logged at WARN and the chunk is dropped;
//!   the caller keeps processing the event.
//! - Store failures are returned as [`EngineError::PersistenceFailure`].

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::error_handling::types::{EngineError, SinkError};
use crate::storage::storage_trait::FlowStore;
use crate::storage::types::StreamId;

use super::payload_sink::PayloadSink;

/// Running totals of what the recorder wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub bytes_written: u64,
    pub segments: u64,
    pub write_failures: u64,
}

pub struct StreamRecorder {
    sink: Arc<dyn PayloadSink>,
    store: Arc<dyn FlowStore>,
    /// Copy finalized payloads into the store as well.
    embed_payload: bool,
    bytes_written: AtomicU64,
    segments: AtomicU64,
    write_failures: AtomicU64,
}

impl StreamRecorder {
    pub fn new(sink: Arc<dyn PayloadSink>, store: Arc<dyn FlowStore>) -> Self {
        Self {
            sink,
            store,
            embed_payload: false,
            bytes_written: AtomicU64::new(0),
            segments: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    pub fn with_embedded_payload(mut self, embed: bool) -> Self {
        self.embed_payload = embed;
        self
    }

    /// Appends `bytes` to `stream` and logs the segment.
    ///
    /// Returns `Ok(None)` if the sink failed and nothing was recorded.
    pub fn record(
        &self,
        stream: StreamId,
        bytes: &[u8],
        time: DateTime<Utc>,
    ) -> Result<Option<usize>, EngineError> {
        let written = match self.write(stream, bytes) {
            Ok(n) => n,
            Err(e) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!("[stream {}] payload dropped: {}", stream, e);
                return Ok(None);
            }
        };
        self.store
            .append_segment(stream, written as u64, time)
            .map_err(EngineError::persistence("append_segment"))?;
        self.bytes_written
            .fetch_add(written as u64, Ordering::Relaxed);
        self.segments.fetch_add(1, Ordering::Relaxed);
        debug!("[stream {}] recorded {} bytes", stream, written);
        Ok(Some(written))
    }

    fn write(&self, stream: StreamId, bytes: &[u8]) -> Result<usize, SinkError> {
        let mut channel = self.sink.open(stream)?;
        let written = channel.append(bytes)?;
        channel.close()?;
        Ok(written)
    }

    /// Opens and closes the stream's backing object so it exists even if no
    /// bytes ever arrive. Failure is logged, never returned.
    pub fn precreate(&self, stream: StreamId) {
        if let Err(e) = self.sink.open(stream).and_then(|c| c.close()) {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!("[stream {}] could not create payload object: {}", stream, e);
        }
    }

    /// Sets the stream's data path to the sink location and returns it.
    pub fn finalize(&self, stream: StreamId) -> Result<PathBuf, EngineError> {
        let path = self.sink.location(stream);
        let data = if self.embed_payload {
            match fs::read(&path) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(
                        "[stream {}] cannot embed payload from {}: {}",
                        stream,
                        path.display(),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };
        self.store
            .set_data_path(stream, &path, data.as_deref())
            .map_err(EngineError::persistence("set_data_path"))?;
        debug!("[stream {}] finalized at {}", stream, path.display());
        Ok(path)
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            segments: self.segments.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}
