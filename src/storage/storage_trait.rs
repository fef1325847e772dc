//! Flow Store Trait
//!
//! This module defines the `FlowStore` trait, the structured-metadata side of
//! the engine. Payload bytes never pass through it; they go to a
//! [`PayloadSink`](crate::data_capture::PayloadSink).
//!
//! Implementors are responsible for:
//! - Allocating flow and stream identifiers
//! - Looking up live flow records by key, and TCP connections by id
//! - Appending segment metadata and moving `last_time` forward
//! - Enforcing write-once `final_status` and `data_path`
//!
//! All methods return a `Result`; the engine treats every error as fatal.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error_handling::types::StorageError;
use crate::network::flow_key::{FlowKey, FlowKind};
use crate::storage::types::{
    ConnectionRecord, FinalStatus, FlowHandle, FlowId, StreamId, StreamRecord,
};

pub trait FlowStore: Send + Sync {
    /// Creates a record for `key` and allocates its stream(s).
    ///
    /// Does not check for an existing record; callers look up first.
    fn create_flow(&self, key: &FlowKey, first_time: DateTime<Utc>)
        -> Result<FlowHandle, StorageError>;

    /// Finds the live record for `key`. A record stops being live once its
    /// data path has been set.
    fn find_flow(&self, key: &FlowKey) -> Result<Option<FlowHandle>, StorageError>;

    fn find_connection_by_id(&self, id: FlowId) -> Result<Option<FlowHandle>, StorageError>;

    /// Appends a segment of `length` bytes to the stream's log.
    fn append_segment(
        &self,
        stream: StreamId,
        length: u64,
        time: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Moves the stream's `last_time` forward; never backwards.
    fn set_stream_last_time(&self, stream: StreamId, time: DateTime<Utc>)
        -> Result<(), StorageError>;

    /// Moves the TCP connection's `last_time` forward; never backwards.
    fn set_connection_last_time(&self, id: FlowId, time: DateTime<Utc>)
        -> Result<(), StorageError>;

    fn set_final_status(&self, id: FlowId, status: FinalStatus) -> Result<(), StorageError>;

    /// Records where the stream's payload lives, optionally with a copy of it.
    fn set_data_path(
        &self,
        stream: StreamId,
        path: &Path,
        data: Option<&[u8]>,
    ) -> Result<(), StorageError>;

    /// Streams of IP-only and UDP flows whose data path is still unset.
    fn pending_connectionless_streams(&self) -> Result<Vec<StreamId>, StorageError>;

    fn load_stream(&self, stream: StreamId) -> Result<Option<StreamRecord>, StorageError>;

    fn load_connection(&self, id: FlowId) -> Result<Option<ConnectionRecord>, StorageError>;

    fn count_flows(&self, kind: FlowKind) -> Result<u64, StorageError>;

    /// Flushes and releases the backend. Further calls fail.
    fn close(&self) -> Result<(), StorageError>;
}
