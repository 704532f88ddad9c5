//! One-shot cancellation latches.
//!
//! A latch is a named one-shot flag used to short-circuit a scan across
//! workers. Workers poll cooperatively; there is no signal-driven
//! interruption. Two flavors share the [`Latch`] trait:
//!
//! - [`OneShotFlag`] – a process-shared flag for workers that live in the
//!   engine's process.
//! - [`StoreLatch`] – backed by the storage module's latch table, usable
//!   when workers and the engine do not share memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use verdict_store_core::GrantStore;
use verdict_types::SdkError;

/// A shared one-shot boolean for cooperative cancellation.
#[async_trait]
pub trait Latch: Send + Sync {
    /// Whether the latch has been set.
    async fn is_set(&self) -> Result<bool, SdkError>;

    /// Set the latch. Setting an already-set latch is a no-op.
    async fn set(&self) -> Result<(), SdkError>;

    /// Free the latch's backing resource. Idempotent.
    async fn release(&self) -> Result<(), SdkError>;
}

/// Process-shared one-shot flag.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct OneShotFlag {
    flag: Arc<AtomicBool>,
}

impl OneShotFlag {
    /// Create a new, unset flag.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Latch for OneShotFlag {
    async fn is_set(&self) -> Result<bool, SdkError> {
        Ok(self.flag.load(Ordering::SeqCst))
    }

    async fn set(&self) -> Result<(), SdkError> {
        self.flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> Result<(), SdkError> {
        Ok(())
    }
}

/// Latch backed by the storage module's shared latch table.
///
/// This is the cross-process cancellation channel: any worker holding the
/// UUID can set it, and peers observe the set on their next poll.
#[derive(Clone)]
pub struct StoreLatch {
    storage: Arc<dyn GrantStore>,
    uuid: Uuid,
}

impl StoreLatch {
    /// Create a new latch in the store.
    pub async fn create(storage: Arc<dyn GrantStore>) -> Result<Self, SdkError> {
        let latch = storage.create_latch().await?;
        Ok(Self {
            storage,
            uuid: latch.uuid,
        })
    }

    /// The storage-assigned latch UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

#[async_trait]
impl Latch for StoreLatch {
    async fn is_set(&self) -> Result<bool, SdkError> {
        Ok(self.storage.get_latch(self.uuid).await?.set)
    }

    async fn set(&self) -> Result<(), SdkError> {
        self.storage.set_latch(self.uuid).await?;
        Ok(())
    }

    async fn release(&self) -> Result<(), SdkError> {
        match self.storage.delete_latch(self.uuid).await {
            Ok(()) | Err(SdkError::LatchNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
