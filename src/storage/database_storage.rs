use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite, SqliteConnection,
};

use crate::error_handling::types::StorageError;
use crate::network::flow_key::{FlowKey, FlowKind};
use crate::network::types::{Tuple3, Tuple4, IPPROTO_TCP, IPPROTO_UDP};
use crate::storage::storage_trait::FlowStore;
use crate::storage::types::{
    from_micros, to_micros, Channels, ConnectionRecord, FinalStatus, FlowHandle, FlowId, Segment,
    StreamId, StreamRecord,
};

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS streams (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_ip TEXT NOT NULL,
        dest_ip TEXT NOT NULL,
        proto INTEGER NOT NULL,
        first_time INTEGER NOT NULL,
        last_time INTEGER NOT NULL,
        data_path TEXT,
        data BLOB
    );",
    "CREATE INDEX IF NOT EXISTS streams_by_tuple ON streams (source_ip, dest_ip, proto);",
    "CREATE TABLE IF NOT EXISTS stream_segments (
        stream_id INTEGER NOT NULL,
        seq_no INTEGER NOT NULL,
        byte_offset INTEGER NOT NULL,
        length INTEGER NOT NULL,
        captured_at INTEGER NOT NULL,
        PRIMARY KEY (stream_id, seq_no),
        FOREIGN KEY(stream_id) REFERENCES streams(id)
    );",
    "CREATE TABLE IF NOT EXISTS udp_flows (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_port INTEGER NOT NULL,
        dest_port INTEGER NOT NULL,
        stream_id INTEGER NOT NULL UNIQUE,
        FOREIGN KEY(stream_id) REFERENCES streams(id)
    );",
    "CREATE TABLE IF NOT EXISTS tcp_connections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_port INTEGER NOT NULL,
        dest_port INTEGER NOT NULL,
        last_time INTEGER NOT NULL,
        final_status INTEGER,
        out_stream_id INTEGER NOT NULL UNIQUE,
        in_stream_id INTEGER NOT NULL UNIQUE,
        FOREIGN KEY(out_stream_id) REFERENCES streams(id),
        FOREIGN KEY(in_stream_id) REFERENCES streams(id)
    );",
];

#[derive(Debug, sqlx::FromRow)]
struct StreamRow {
    id: i64,
    source_ip: String,
    dest_ip: String,
    proto: i64,
    first_time: i64,
    last_time: i64,
    data_path: Option<String>,
    data: Option<Vec<u8>>,
}

#[derive(Debug, sqlx::FromRow)]
struct SegmentRow {
    seq_no: i64,
    byte_offset: i64,
    length: i64,
    captured_at: i64,
}

// A tcp_connections row joined with its outbound stream for the addresses.
#[derive(Debug, sqlx::FromRow)]
struct ConnectionRow {
    id: i64,
    source_ip: String,
    dest_ip: String,
    source_port: i64,
    dest_port: i64,
    last_time: i64,
    final_status: Option<i64>,
    out_stream_id: i64,
    in_stream_id: i64,
}

impl ConnectionRow {
    fn handle(&self) -> Result<FlowHandle, StorageError> {
        let key = FlowKey::Tcp(Tuple4 {
            source: parse_ip(&self.source_ip)?,
            source_port: parse_port(self.source_port)?,
            destination: parse_ip(&self.dest_ip)?,
            destination_port: parse_port(self.dest_port)?,
        });
        Ok(FlowHandle {
            id: FlowId(self.id),
            key,
            channels: Channels::Duplex {
                outbound: StreamId(self.out_stream_id),
                inbound: StreamId(self.in_stream_id),
            },
        })
    }
}

fn parse_ip(text: &str) -> Result<Ipv4Addr, StorageError> {
    text.parse().map_err(|e| StorageError::query("decode address", e))
}

fn parse_port(value: i64) -> Result<u16, StorageError> {
    u16::try_from(value).map_err(|e| StorageError::query("decode port", e))
}

fn parse_time(micros: i64) -> Result<DateTime<Utc>, StorageError> {
    from_micros(micros)
        .ok_or_else(|| StorageError::query("decode timestamp", format!("{} out of range", micros)))
}

async fn insert_stream(
    conn: &mut SqliteConnection,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: u8,
    first_time: i64,
) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO streams (source_ip, dest_ip, proto, first_time, last_time)
         VALUES (?1, ?2, ?3, ?4, ?4)",
    )
    .bind(source.to_string())
    .bind(destination.to_string())
    .bind(i64::from(protocol))
    .bind(first_time)
    .execute(&mut *conn)
    .await
    .map_err(|e| StorageError::query("insert stream", e))?;
    Ok(result.last_insert_rowid())
}

async fn fetch_stream(pool: &Pool<Sqlite>, id: i64) -> Result<Option<StreamRecord>, StorageError> {
    let row = sqlx::query_as::<_, StreamRow>(
        "SELECT id, source_ip, dest_ip, proto, first_time, last_time, data_path, data
         FROM streams WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::query("load stream", e))?;
    let Some(row) = row else {
        return Ok(None);
    };

    let segment_rows = sqlx::query_as::<_, SegmentRow>(
        "SELECT seq_no, byte_offset, length, captured_at
         FROM stream_segments WHERE stream_id = ?1 ORDER BY seq_no ASC",
    )
    .bind(id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::query("load segments", e))?;
    let mut segments = Vec::with_capacity(segment_rows.len());
    for s in segment_rows {
        segments.push(Segment {
            number: s.seq_no as u64,
            offset: s.byte_offset as u64,
            length: s.length as u64,
            time: parse_time(s.captured_at)?,
        });
    }

    Ok(Some(StreamRecord {
        id: StreamId(row.id),
        source: parse_ip(&row.source_ip)?,
        destination: parse_ip(&row.dest_ip)?,
        protocol: u8::try_from(row.proto).map_err(|e| StorageError::query("decode protocol", e))?,
        first_time: parse_time(row.first_time)?,
        last_time: parse_time(row.last_time)?,
        data_path: row.data_path,
        data: row.data,
        segments,
    }))
}

/// SQLite-backed [`FlowStore`].
///
/// sqlx is async; the store owns a current-thread runtime and blocks on each
/// call so the engine stays synchronous. Do not call it from inside another
/// tokio runtime.
pub struct SqliteStore {
    rt: tokio::runtime::Runtime,
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `path` and ensures the schema.
    pub fn new_file<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
            }
        }
        let pool = rt.block_on(async {
            let opts = SqliteConnectOptions::new()
                .filename(path_ref)
                .create_if_missing(true)
                .foreign_keys(true);
            // Single writer; one connection keeps statement order identical to event order.
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(opts)
                .await
                .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
            for statement in SCHEMA {
                sqlx::query(statement)
                    .execute(&pool)
                    .await
                    .map_err(|e| StorageError::query("create schema", e))?;
            }
            Ok::<_, StorageError>(pool)
        })?;
        info!("Opened flow database {}", path_ref.display());
        Ok(Self { rt, pool })
    }

    fn stream_exists(&self, id: i64) -> Result<bool, StorageError> {
        self.rt.block_on(async {
            let found: Option<i64> = sqlx::query_scalar("SELECT id FROM streams WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::query("find stream", e))?;
            Ok(found.is_some())
        })
    }

    fn connection_exists(&self, id: i64) -> Result<bool, StorageError> {
        self.rt.block_on(async {
            let found: Option<i64> =
                sqlx::query_scalar("SELECT id FROM tcp_connections WHERE id = ?1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| StorageError::query("find connection", e))?;
            Ok(found.is_some())
        })
    }
}

impl FlowStore for SqliteStore {
    fn create_flow(
        &self,
        key: &FlowKey,
        first_time: DateTime<Utc>,
    ) -> Result<FlowHandle, StorageError> {
        let t = to_micros(first_time);
        let handle = self.rt.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StorageError::query("begin create", e))?;
            let handle = match *key {
                FlowKey::Ip(t3) => {
                    let id =
                        insert_stream(&mut *tx, t3.source, t3.destination, t3.protocol, t).await?;
                    FlowHandle {
                        id: FlowId(id),
                        key: *key,
                        channels: Channels::Simplex(StreamId(id)),
                    }
                }
                FlowKey::Udp(t4) => {
                    let stream =
                        insert_stream(&mut *tx, t4.source, t4.destination, IPPROTO_UDP, t).await?;
                    let id = sqlx::query(
                        "INSERT INTO udp_flows (source_port, dest_port, stream_id) VALUES (?1, ?2, ?3)",
                    )
                    .bind(i64::from(t4.source_port))
                    .bind(i64::from(t4.destination_port))
                    .bind(stream)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StorageError::query("insert udp flow", e))?
                    .last_insert_rowid();
                    FlowHandle {
                        id: FlowId(id),
                        key: *key,
                        channels: Channels::Simplex(StreamId(stream)),
                    }
                }
                FlowKey::Tcp(t4) => {
                    let outbound =
                        insert_stream(&mut *tx, t4.source, t4.destination, IPPROTO_TCP, t).await?;
                    let inbound =
                        insert_stream(&mut *tx, t4.destination, t4.source, IPPROTO_TCP, t).await?;
                    let id = sqlx::query(
                        "INSERT INTO tcp_connections (source_port, dest_port, last_time, out_stream_id, in_stream_id)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .bind(i64::from(t4.source_port))
                    .bind(i64::from(t4.destination_port))
                    .bind(t)
                    .bind(outbound)
                    .bind(inbound)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StorageError::query("insert tcp connection", e))?
                    .last_insert_rowid();
                    FlowHandle {
                        id: FlowId(id),
                        key: *key,
                        channels: Channels::Duplex {
                            outbound: StreamId(outbound),
                            inbound: StreamId(inbound),
                        },
                    }
                }
            };
            tx.commit()
                .await
                .map_err(|e| StorageError::query("commit create", e))?;
            Ok::<_, StorageError>(handle)
        })?;
        debug!("[{}] created record {}", key, handle.id);
        Ok(handle)
    }

    fn find_flow(&self, key: &FlowKey) -> Result<Option<FlowHandle>, StorageError> {
        self.rt.block_on(async {
            match *key {
                FlowKey::Ip(Tuple3 {
                    source,
                    destination,
                    protocol,
                }) => {
                    let id: Option<i64> = sqlx::query_scalar(
                        "SELECT id FROM streams
                         WHERE source_ip = ?1 AND dest_ip = ?2 AND proto = ?3 AND data_path IS NULL
                         ORDER BY id DESC LIMIT 1",
                    )
                    .bind(source.to_string())
                    .bind(destination.to_string())
                    .bind(i64::from(protocol))
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| StorageError::query("find ip flow", e))?;
                    Ok(id.map(|id| FlowHandle {
                        id: FlowId(id),
                        key: *key,
                        channels: Channels::Simplex(StreamId(id)),
                    }))
                }
                FlowKey::Udp(t4) => {
                    let row: Option<(i64, i64)> = sqlx::query_as(
                        "SELECT u.id, u.stream_id FROM udp_flows u
                         JOIN streams s ON s.id = u.stream_id
                         WHERE s.source_ip = ?1 AND u.source_port = ?2
                           AND s.dest_ip = ?3 AND u.dest_port = ?4
                           AND s.data_path IS NULL
                         ORDER BY u.id DESC LIMIT 1",
                    )
                    .bind(t4.source.to_string())
                    .bind(i64::from(t4.source_port))
                    .bind(t4.destination.to_string())
                    .bind(i64::from(t4.destination_port))
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| StorageError::query("find udp flow", e))?;
                    Ok(row.map(|(id, stream)| FlowHandle {
                        id: FlowId(id),
                        key: *key,
                        channels: Channels::Simplex(StreamId(stream)),
                    }))
                }
                FlowKey::Tcp(t4) => {
                    let row = sqlx::query_as::<_, ConnectionRow>(
                        "SELECT c.id, s.source_ip, s.dest_ip, c.source_port, c.dest_port,
                                c.last_time, c.final_status, c.out_stream_id, c.in_stream_id
                         FROM tcp_connections c
                         JOIN streams s ON s.id = c.out_stream_id
                         WHERE s.source_ip = ?1 AND c.source_port = ?2
                           AND s.dest_ip = ?3 AND c.dest_port = ?4
                           AND s.data_path IS NULL
                         ORDER BY c.id DESC LIMIT 1",
                    )
                    .bind(t4.source.to_string())
                    .bind(i64::from(t4.source_port))
                    .bind(t4.destination.to_string())
                    .bind(i64::from(t4.destination_port))
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| StorageError::query("find tcp connection", e))?;
                    row.map(|r| r.handle()).transpose()
                }
            }
        })
    }

    fn find_connection_by_id(&self, id: FlowId) -> Result<Option<FlowHandle>, StorageError> {
        self.rt.block_on(async {
            let row = sqlx::query_as::<_, ConnectionRow>(
                "SELECT c.id, s.source_ip, s.dest_ip, c.source_port, c.dest_port,
                        c.last_time, c.final_status, c.out_stream_id, c.in_stream_id
                 FROM tcp_connections c
                 JOIN streams s ON s.id = c.out_stream_id
                 WHERE c.id = ?1",
            )
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::query("find connection by id", e))?;
            row.map(|r| r.handle()).transpose()
        })
    }

    fn append_segment(
        &self,
        stream: StreamId,
        length: u64,
        time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let length = i64::try_from(length).map_err(|e| StorageError::query("append segment", e))?;
        self.rt.block_on(async {
            // Number and offset are derived from the existing log in the same statement.
            sqlx::query(
                "INSERT INTO stream_segments (stream_id, seq_no, byte_offset, length, captured_at)
                 SELECT ?1, COALESCE(MAX(seq_no), 0) + 1, COALESCE(SUM(length), 0), ?2, ?3
                 FROM stream_segments WHERE stream_id = ?1",
            )
            .bind(stream.0)
            .bind(length)
            .bind(to_micros(time))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::query("append segment", e))?;
            Ok(())
        })
    }

    fn set_stream_last_time(
        &self,
        stream: StreamId,
        time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let affected = self.rt.block_on(async {
            sqlx::query("UPDATE streams SET last_time = MAX(last_time, ?2) WHERE id = ?1")
                .bind(stream.0)
                .bind(to_micros(time))
                .execute(&self.pool)
                .await
                .map(|r| r.rows_affected())
                .map_err(|e| StorageError::query("set stream last_time", e))
        })?;
        if affected == 0 {
            return Err(StorageError::NotFound {
                what: format!("stream {}", stream),
            });
        }
        Ok(())
    }

    fn set_connection_last_time(
        &self,
        id: FlowId,
        time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let affected = self.rt.block_on(async {
            sqlx::query("UPDATE tcp_connections SET last_time = MAX(last_time, ?2) WHERE id = ?1")
                .bind(id.0)
                .bind(to_micros(time))
                .execute(&self.pool)
                .await
                .map(|r| r.rows_affected())
                .map_err(|e| StorageError::query("set connection last_time", e))
        })?;
        if affected == 0 {
            return Err(StorageError::NotFound {
                what: format!("tcp connection {}", id),
            });
        }
        Ok(())
    }

    fn set_final_status(&self, id: FlowId, status: FinalStatus) -> Result<(), StorageError> {
        let affected = self.rt.block_on(async {
            sqlx::query(
                "UPDATE tcp_connections SET final_status = ?2 WHERE id = ?1 AND final_status IS NULL",
            )
            .bind(id.0)
            .bind(status.code())
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
            .map_err(|e| StorageError::query("set final_status", e))
        })?;
        if affected == 0 {
            if self.connection_exists(id.0)? {
                return Err(StorageError::WriteOnceViolation {
                    field: "final_status",
                    id: id.0,
                });
            }
            return Err(StorageError::NotFound {
                what: format!("tcp connection {}", id),
            });
        }
        Ok(())
    }

    fn set_data_path(
        &self,
        stream: StreamId,
        path: &Path,
        data: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        let affected = self.rt.block_on(async {
            sqlx::query(
                "UPDATE streams SET data_path = ?2, data = ?3 WHERE id = ?1 AND data_path IS NULL",
            )
            .bind(stream.0)
            .bind(path.to_string_lossy().into_owned())
            .bind(data)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
            .map_err(|e| StorageError::query("set data_path", e))
        })?;
        if affected == 0 {
            if self.stream_exists(stream.0)? {
                return Err(StorageError::WriteOnceViolation {
                    field: "data_path",
                    id: stream.0,
                });
            }
            return Err(StorageError::NotFound {
                what: format!("stream {}", stream),
            });
        }
        Ok(())
    }

    fn pending_connectionless_streams(&self) -> Result<Vec<StreamId>, StorageError> {
        self.rt.block_on(async {
            let ids: Vec<i64> = sqlx::query_scalar(
                "SELECT id FROM streams WHERE proto <> ?1 AND data_path IS NULL ORDER BY id ASC",
            )
            .bind(i64::from(IPPROTO_TCP))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::query("list pending streams", e))?;
            Ok(ids.into_iter().map(StreamId).collect())
        })
    }

    fn load_stream(&self, stream: StreamId) -> Result<Option<StreamRecord>, StorageError> {
        self.rt.block_on(fetch_stream(&self.pool, stream.0))
    }

    fn load_connection(&self, id: FlowId) -> Result<Option<ConnectionRecord>, StorageError> {
        self.rt.block_on(async {
            let row = sqlx::query_as::<_, ConnectionRow>(
                "SELECT c.id, s.source_ip, s.dest_ip, c.source_port, c.dest_port,
                        c.last_time, c.final_status, c.out_stream_id, c.in_stream_id
                 FROM tcp_connections c
                 JOIN streams s ON s.id = c.out_stream_id
                 WHERE c.id = ?1",
            )
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::query("load connection", e))?;
            let Some(row) = row else {
                return Ok(None);
            };
            let missing = |stream: i64| StorageError::NotFound {
                what: format!("stream {} of tcp connection {}", stream, row.id),
            };
            let outbound = fetch_stream(&self.pool, row.out_stream_id)
                .await?
                .ok_or_else(|| missing(row.out_stream_id))?;
            let inbound = fetch_stream(&self.pool, row.in_stream_id)
                .await?
                .ok_or_else(|| missing(row.in_stream_id))?;
            let final_status = match row.final_status {
                None => None,
                Some(code) => Some(FinalStatus::from_code(code).ok_or_else(|| {
                    StorageError::query("decode final_status", format!("unknown code {}", code))
                })?),
            };
            Ok(Some(ConnectionRecord {
                id: FlowId(row.id),
                source_port: parse_port(row.source_port)?,
                destination_port: parse_port(row.dest_port)?,
                last_time: parse_time(row.last_time)?,
                final_status,
                outbound,
                inbound,
            }))
        })
    }

    fn count_flows(&self, kind: FlowKind) -> Result<u64, StorageError> {
        let sql = match kind {
            FlowKind::Ip => "SELECT COUNT(*) FROM streams WHERE proto NOT IN (6, 17)",
            FlowKind::Udp => "SELECT COUNT(*) FROM udp_flows",
            FlowKind::Tcp => "SELECT COUNT(*) FROM tcp_connections",
        };
        self.rt.block_on(async {
            let count: i64 = sqlx::query_scalar(sql)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::query("count flows", e))?;
            Ok(count as u64)
        })
    }

    fn close(&self) -> Result<(), StorageError> {
        self.rt.block_on(self.pool.close());
        info!("Closed flow database");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let path: PathBuf = dir.path().join("flows.sqlite3");
        let store = SqliteStore::new_file(path).unwrap();
        (dir, store)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn tcp_key() -> FlowKey {
        FlowKey::Tcp(Tuple4 {
            source: Ipv4Addr::new(10, 0, 0, 1),
            source_port: 40000,
            destination: Ipv4Addr::new(10, 0, 0, 2),
            destination_port: 80,
        })
    }

    fn udp_key() -> FlowKey {
        FlowKey::Udp(Tuple4 {
            source: Ipv4Addr::new(10, 0, 0, 1),
            source_port: 5353,
            destination: Ipv4Addr::new(10, 0, 0, 9),
            destination_port: 53,
        })
    }

    fn ip_key() -> FlowKey {
        FlowKey::Ip(Tuple3 {
            source: Ipv4Addr::new(192, 168, 1, 1),
            destination: Ipv4Addr::new(192, 168, 1, 2),
            protocol: 47,
        })
    }

    fn stream_of(handle: &FlowHandle) -> StreamId {
        match handle.channels {
            Channels::Simplex(s) => s,
            Channels::Duplex { outbound, .. } => outbound,
        }
    }

    #[test]
    fn test_create_then_find_each_kind() {
        let (_dir, store) = temp_db();
        for key in [ip_key(), udp_key(), tcp_key()] {
            assert!(store.find_flow(&key).unwrap().is_none());
            let created = store.create_flow(&key, at(0)).unwrap();
            let found = store.find_flow(&key).unwrap().unwrap();
            assert_eq!(created, found);
        }
        assert_eq!(store.count_flows(FlowKind::Ip).unwrap(), 1);
        assert_eq!(store.count_flows(FlowKind::Udp).unwrap(), 1);
        assert_eq!(store.count_flows(FlowKind::Tcp).unwrap(), 1);
    }

    #[test]
    fn test_tcp_streams_are_oriented() {
        let (_dir, store) = temp_db();
        let handle = store.create_flow(&tcp_key(), at(1)).unwrap();
        let conn = store.load_connection(handle.id).unwrap().unwrap();
        assert_eq!(conn.outbound.source, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(conn.inbound.source, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(conn.outbound.protocol, IPPROTO_TCP);
        assert_eq!(conn.inbound.first_time, at(1));
        assert_eq!(conn.last_time, at(1));
        assert_eq!(conn.final_status, None);
        assert_ne!(conn.outbound.id, conn.inbound.id);
    }

    #[test]
    fn test_segments_are_numbered_with_offsets() {
        let (_dir, store) = temp_db();
        let handle = store.create_flow(&udp_key(), at(0)).unwrap();
        let stream = stream_of(&handle);
        store.append_segment(stream, 20, at(1)).unwrap();
        store.append_segment(stream, 15, at(2)).unwrap();
        store.append_segment(stream, 5, at(3)).unwrap();
        let record = store.load_stream(stream).unwrap().unwrap();
        let summary: Vec<(u64, u64, u64)> = record
            .segments
            .iter()
            .map(|s| (s.number, s.offset, s.length))
            .collect();
        assert_eq!(summary, vec![(1, 0, 20), (2, 20, 15), (3, 35, 5)]);
        assert_eq!(record.segments[1].time, at(2));
    }

    #[test]
    fn test_append_to_unknown_stream_fails() {
        let (_dir, store) = temp_db();
        assert!(store.append_segment(StreamId(99), 1, at(0)).is_err());
    }

    #[test]
    fn test_last_time_never_moves_backwards() {
        let (_dir, store) = temp_db();
        let handle = store.create_flow(&tcp_key(), at(5)).unwrap();
        store.set_connection_last_time(handle.id, at(9)).unwrap();
        store.set_connection_last_time(handle.id, at(7)).unwrap();
        let stream = stream_of(&handle);
        store.set_stream_last_time(stream, at(8)).unwrap();
        store.set_stream_last_time(stream, at(6)).unwrap();
        let conn = store.load_connection(handle.id).unwrap().unwrap();
        assert_eq!(conn.last_time, at(9));
        assert_eq!(conn.outbound.last_time, at(8));
    }

    #[test]
    fn test_last_time_on_missing_record_is_not_found() {
        let (_dir, store) = temp_db();
        let err = store.set_connection_last_time(FlowId(3), at(0)).unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[test]
    fn test_final_status_is_write_once() {
        let (_dir, store) = temp_db();
        let handle = store.create_flow(&tcp_key(), at(0)).unwrap();
        store.set_final_status(handle.id, FinalStatus::Reset).unwrap();
        let err = store
            .set_final_status(handle.id, FinalStatus::NormalClose)
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::WriteOnceViolation {
                field: "final_status",
                ..
            }
        ));
        let conn = store.load_connection(handle.id).unwrap().unwrap();
        assert_eq!(conn.final_status, Some(FinalStatus::Reset));
        assert!(matches!(
            store.set_final_status(FlowId(42), FinalStatus::Reset),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn test_data_path_is_write_once_and_ends_liveness() {
        let (_dir, store) = temp_db();
        let handle = store.create_flow(&ip_key(), at(0)).unwrap();
        let stream = stream_of(&handle);
        store
            .set_data_path(stream, Path::new("/tmp/stream_1"), Some(b"abc"))
            .unwrap();
        let err = store
            .set_data_path(stream, Path::new("/tmp/other"), None)
            .unwrap_err();
        assert!(matches!(err, StorageError::WriteOnceViolation { .. }));
        let record = store.load_stream(stream).unwrap().unwrap();
        assert_eq!(record.data_path.as_deref(), Some("/tmp/stream_1"));
        assert_eq!(record.data.as_deref(), Some(&b"abc"[..]));
        assert!(store.find_flow(&ip_key()).unwrap().is_none());
    }

    #[test]
    fn test_pending_streams_skip_tcp_and_finalized() {
        let (_dir, store) = temp_db();
        let ip = store.create_flow(&ip_key(), at(0)).unwrap();
        let udp = store.create_flow(&udp_key(), at(0)).unwrap();
        store.create_flow(&tcp_key(), at(0)).unwrap();
        assert_eq!(
            store.pending_connectionless_streams().unwrap(),
            vec![stream_of(&ip), stream_of(&udp)]
        );
        store
            .set_data_path(stream_of(&ip), Path::new("/tmp/x"), None)
            .unwrap();
        assert_eq!(
            store.pending_connectionless_streams().unwrap(),
            vec![stream_of(&udp)]
        );
    }

    #[test]
    fn test_find_connection_by_id() {
        let (_dir, store) = temp_db();
        let handle = store.create_flow(&tcp_key(), at(0)).unwrap();
        assert_eq!(store.find_connection_by_id(handle.id).unwrap(), Some(handle));
        assert_eq!(store.find_connection_by_id(FlowId(77)).unwrap(), None);
    }

    #[test]
    fn test_stream_ids_are_not_reused_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flows.sqlite3");
        let first = {
            let store = SqliteStore::new_file(&path).unwrap();
            let h = store.create_flow(&ip_key(), at(0)).unwrap();
            store.close().unwrap();
            stream_of(&h)
        };
        let store = SqliteStore::new_file(&path).unwrap();
        let second = store.create_flow(&udp_key(), at(1)).unwrap();
        assert!(stream_of(&second).0 > first.0);
    }

    #[test]
    fn test_closed_store_rejects_queries() {
        let (_dir, store) = temp_db();
        store.close().unwrap();
        assert!(store.find_flow(&ip_key()).is_err());
    }
}
