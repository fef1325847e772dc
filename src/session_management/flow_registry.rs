use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;

use crate::error_handling::types::{EngineError, StorageError};
use crate::storage::storage_trait::FlowStore;
use crate::storage::types::{FlowHandle, FlowId};

use super::EventContext;

/// Outcome of [`FlowRegistry::find_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub handle: FlowHandle,
    /// `true` if the record did not exist before this call.
    pub created: bool,
}

/// Maps flow keys to persisted records, at most one live record per key.
///
/// Never deletes. Every store failure surfaces as
/// [`EngineError::PersistenceFailure`].
pub struct FlowRegistry {
    store: Arc<dyn FlowStore>,
    created: AtomicU64,
}

impl FlowRegistry {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self {
            store,
            created: AtomicU64::new(0),
        }
    }

    /// Returns the live record for `ctx.key`, creating it with
    /// `first_time = ctx.timestamp` on a miss.
    pub fn find_or_create(&self, ctx: &EventContext) -> Result<Resolution, EngineError> {
        if let Some(handle) = self
            .store
            .find_flow(&ctx.key)
            .map_err(EngineError::persistence("find_flow"))?
        {
            return Ok(Resolution {
                handle,
                created: false,
            });
        }
        let handle = self
            .store
            .create_flow(&ctx.key, ctx.timestamp)
            .map_err(EngineError::persistence("create_flow"))?;
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(
            "[{}] new {} record {} (event {})",
            ctx.key,
            ctx.key.kind().as_str(),
            handle.id,
            ctx.sequence
        );
        Ok(Resolution {
            handle,
            created: true,
        })
    }

    /// Resolves a TCP connection record by id.
    pub fn find_by_id(&self, id: FlowId) -> Result<FlowHandle, EngineError> {
        self.store
            .find_connection_by_id(id)
            .map_err(EngineError::persistence("find_connection_by_id"))?
            .ok_or_else(|| EngineError::PersistenceFailure {
                operation: "find_connection_by_id",
                source: StorageError::NotFound {
                    what: format!("tcp connection {}", id),
                },
            })
    }

    /// Number of records created through this registry.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}
