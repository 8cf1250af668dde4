// Process-wide connection pool
// Bounds the number of concurrent units of work against the replica set

use std::sync::Arc;
use std::time::Duration;

use nexus_common::StoreError;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub max_size: usize,
    pub in_use: usize,
    pub closed: bool,
}

/// Connection pool with `max_size` slots
pub struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    max_size: usize,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(max_size: usize, acquire_timeout: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_size)),
            max_size,
            acquire_timeout,
        }
    }

    /// Wait for a free slot, bounded by the acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection, StoreError> {
        match timeout(self.acquire_timeout, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(PooledConnection { _permit: permit }),
            Ok(Err(_)) => Err(StoreError::PoolClosed),
            Err(_) => Err(StoreError::Unreachable(format!(
                "no pooled connection available within {}ms ({} in use)",
                self.acquire_timeout.as_millis(),
                self.max_size
            ))),
        }
    }

    /// Refuse new acquisitions. Connections already handed out stay valid
    /// until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            max_size: self.max_size,
            in_use: self.max_size - self.semaphore.available_permits().min(self.max_size),
            closed: self.is_closed(),
        }
    }
}

/// Slot in the pool, released on drop
#[derive(Debug)]
pub struct PooledConnection {
    _permit: OwnedSemaphorePermit,
}
