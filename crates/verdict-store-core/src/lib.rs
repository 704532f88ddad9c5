#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-store-core** – Core storage abstraction for Verdict.
//!
//! Defines the [`GrantStore`] contract without providing concrete
//! implementations. Storage drivers (in-memory, database-backed, remote)
//! implement this trait in separate crates that depend on this core
//! abstraction.
//!
//! A store owns three things exclusively: the grant records with their
//! filter indexes, the pagination cursors it issues, and the shared latches
//! used for cooperative cross-worker cancellation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use verdict_types::{
    Effect, Grant, GrantsPage, IdentityDefinition, ModuleLocality, NewGrant, PageRefsPage,
    ResourceDefinition, SdkError, StorageLatch,
};

/// Result helper for storage operations.
pub type StoreResult<T> = std::result::Result<T, SdkError>;

/// Contract between the engine (and its compute workers) and a storage
/// driver.
///
/// # Pagination
///
/// Starting from `page_ref = None` and repeatedly following
/// `next_page_ref` visits every grant matching the filter exactly once, in
/// a total order stable for the duration of the scan. Page sizes are not
/// exact; a store may return fewer grants than requested. A page reference
/// that was not produced by this store, or was produced under different
/// filters, fails [`SdkError::PageReference`].
///
/// Snapshot semantics during concurrent `enact`/`repeal` are
/// driver-defined; production drivers must provide at least read-snapshot
/// semantics for the duration of a paginated scan.
///
/// # Parallel pagination
///
/// Stores that can enumerate cursors without fetching payloads advertise it
/// via [`parallel_paging_supported`](GrantStore::parallel_paging_supported)
/// and implement
/// [`get_grant_page_refs_page`](GrantStore::get_grant_page_refs_page); the
/// compute layer fans the returned refs out to workers that each fetch
/// their page independently.
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Initialize runtime resources and indexes for the given definitions.
    ///
    /// Called once by the engine before any other operation.
    async fn start(
        &self,
        identity_defs: &[IdentityDefinition],
        resource_defs: &[ResourceDefinition],
    ) -> StoreResult<()>;

    /// Release runtime resources. Stored grants may be lost for
    /// non-durable drivers.
    async fn shutdown(&self) -> StoreResult<()> {
        Ok(())
    }

    /// One-time provisioning of durable resources (tables, buckets, ...).
    /// A no-op for drivers without durable state.
    async fn setup(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Tear down everything [`setup`](GrantStore::setup) provisioned. May
    /// delete all stored grants.
    async fn teardown(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Deployment scope of this store, used by the engine's locality gate.
    fn locality(&self) -> ModuleLocality;

    /// Whether this store implements
    /// [`get_grant_page_refs_page`](GrantStore::get_grant_page_refs_page).
    fn parallel_paging_supported(&self) -> bool {
        false
    }

    /// Store a new grant, assigning its UUID. Indexes are updated
    /// atomically with the insert.
    async fn enact(&self, new_grant: NewGrant) -> StoreResult<Grant>;

    /// Delete a grant by UUID.
    ///
    /// Fails [`SdkError::GrantNotFound`] if absent.
    async fn repeal(&self, grant_uuid: Uuid) -> StoreResult<()>;

    /// Fetch a deep copy of a grant by UUID.
    ///
    /// Fails [`SdkError::GrantNotFound`] if absent.
    async fn get_grant(&self, grant_uuid: Uuid) -> StoreResult<Grant>;

    /// Get one page of grants matching the filters.
    ///
    /// `effect`/`action` of `None` mean no filter on that axis. An `action`
    /// filter also matches grants whose action list is empty (the
    /// every-action wildcard).
    async fn get_grants_page(
        &self,
        effect: Option<Effect>,
        action: Option<&str>,
        page_ref: Option<&str>,
        grants_page_size: usize,
    ) -> StoreResult<GrantsPage>;

    /// Enumerate page cursors for the filtered scan without fetching their
    /// payloads.
    ///
    /// Only available when
    /// [`parallel_paging_supported`](GrantStore::parallel_paging_supported)
    /// is true; the default body fails accordingly.
    async fn get_grant_page_refs_page(
        &self,
        effect: Option<Effect>,
        action: Option<&str>,
        page_ref: Option<&str>,
        grants_page_size: usize,
        refs_page_size: usize,
    ) -> StoreResult<PageRefsPage> {
        let _ = (effect, action, page_ref, grants_page_size, refs_page_size);
        if self.parallel_paging_supported() {
            Err(SdkError::NotImplemented(
                "this storage module advertises parallel pagination support but does not \
                 implement page reference enumeration"
                    .into(),
            ))
        } else {
            Err(SdkError::ParallelPaginationNotSupported)
        }
    }

    /// Create a new shared latch, unset.
    async fn create_latch(&self) -> StoreResult<StorageLatch>;

    /// Fetch a latch by UUID.
    ///
    /// Fails [`SdkError::LatchNotFound`] if absent.
    async fn get_latch(&self, latch_uuid: Uuid) -> StoreResult<StorageLatch>;

    /// Set a latch. Setting an already-set latch is a no-op.
    ///
    /// Fails [`SdkError::LatchNotFound`] if absent.
    async fn set_latch(&self, latch_uuid: Uuid) -> StoreResult<StorageLatch>;

    /// Delete a latch by UUID.
    ///
    /// Fails [`SdkError::LatchNotFound`] if absent.
    async fn delete_latch(&self, latch_uuid: Uuid) -> StoreResult<()>;

    /// Garbage-collect zombie latches created before `before`.
    async fn cleanup_latches(&self, before: DateTime<Utc>) -> StoreResult<()>;
}
