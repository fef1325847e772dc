//! Append-only payload storage, one backing object per stream id.
//!
//! A channel is opened, written and closed within a single event; nothing is
//! held open across events.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::trace;

use crate::error_handling::types::SinkError;
use crate::storage::types::StreamId;

pub const DEFAULT_FILE_PREFIX: &str = "stream_";

/// An open, append-mode handle on one stream's backing object.
pub struct SinkChannel {
    stream: StreamId,
    path: PathBuf,
    writer: Box<dyn Write + Send>,
}

impl SinkChannel {
    pub fn new(stream: StreamId, path: PathBuf, writer: Box<dyn Write + Send>) -> Self {
        Self {
            stream,
            path,
            writer,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends all of `bytes`. Returns the number of bytes written.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        self.writer
            .write_all(bytes)
            .map_err(|source| SinkError::Write {
                path: self.path.clone(),
                source,
            })?;
        trace!("[stream {}] appended {} bytes", self.stream, bytes.len());
        Ok(bytes.len())
    }

    pub fn close(mut self) -> Result<(), SinkError> {
        self.writer.flush().map_err(|source| SinkError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

pub trait PayloadSink: Send + Sync {
    /// Opens the stream's backing object in append mode, creating it empty if
    /// missing. Never truncates.
    fn open(&self, stream: StreamId) -> Result<SinkChannel, SinkError>;

    /// Where the stream's bytes live. Stable for the lifetime of the sink.
    fn location(&self, stream: StreamId) -> PathBuf;
}

/// Stores each stream as `<dir>/<prefix><id>`.
#[derive(Debug, Clone)]
pub struct FilePayloadSink {
    dir: PathBuf,
    prefix: String,
}

impl FilePayloadSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self::with_prefix(dir, DEFAULT_FILE_PREFIX)
    }

    pub fn with_prefix<P: AsRef<Path>>(dir: P, prefix: &str) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl PayloadSink for FilePayloadSink {
    fn open(&self, stream: StreamId) -> Result<SinkChannel, SinkError> {
        let path = self.location(stream);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(SinkChannel::new(stream, path, Box::new(file)))
    }

    fn location(&self, stream: StreamId) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, stream.0))
    }
}
