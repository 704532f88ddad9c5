#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-compute** – Compute substrate for Verdict.
//!
//! Drives the deny-overrides decision algorithm over paginated grant scans.
//! Three flavors share the algorithm:
//!
//! - [`InProcessCompute`] – the sequential reference; one page at a time in
//!   the caller's task.
//! - [`FanOutCompute`] – per-slab worker tasks with cooperative
//!   cancellation latches, aiming to serve one request as fast as possible.
//! - [`PoolCompute`] – a pool of workers each owning its own inner compute;
//!   whole invocations are shipped over a task queue.
//!
//! All flavors consume storage through [`GrantStore`] and the query
//! language through the kernel's [`SearchFn`]; neither is owned here.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use verdict_kernel::SearchFn;
use verdict_store_core::GrantStore;
use verdict_types::{
    AuditPage, AuthorizeResponse, ErrorBag, Grant, IdentityDefinition, ModuleLocality, Request,
    ResourceDefinition, Result, SdkError,
};

mod fan_out;
mod in_process;
mod latch;
mod paging;
mod pool;

pub use fan_out::{FanOutCompute, LatchMode};
pub use in_process::InProcessCompute;
pub use latch::{Latch, OneShotFlag, StoreLatch};
pub use pool::{ComputeFactory, PoolCompute};

//─────────────────────────────
//  Compute contract
//─────────────────────────────

/// Contract between the engine facade and a compute flavor.
///
/// A compute module is handed the validated definitions, the search
/// function and a storage handle at [`start`](ComputeBackend::start); it
/// owns any worker pool it spawns and must join outstanding workers before
/// returning from a decision.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Create runtime resources for the compute module.
    async fn start(
        &self,
        identity_defs: &[IdentityDefinition],
        resource_defs: &[ResourceDefinition],
        search: SearchFn,
        storage: Arc<dyn GrantStore>,
    ) -> Result<()>;

    /// Release runtime resources (worker pools, queues).
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// One-time provisioning hook. A no-op for the bundled flavors.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Tear down everything [`setup`](ComputeBackend::setup) provisioned.
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }

    /// Deployment scope of this compute module, used by the engine's
    /// locality gate.
    fn locality(&self) -> ModuleLocality;

    /// Process one slab of grants applicable to the request.
    ///
    /// A slab is one storage page or, under parallel paging, one refs-page
    /// worth of concurrently fetched pages merged in ref order. Clients
    /// iterate by passing `next_page_ref` back until it is `None`.
    async fn audit_page(
        &self,
        request: &Request,
        page_ref: Option<&str>,
        grants_page_size: usize,
        parallel_paging: bool,
        refs_page_size: usize,
    ) -> Result<AuditPage>;

    /// Decide the request: deny-overrides across the deny scan, then the
    /// allow scan; exhausting both without a match denies.
    async fn authorize(
        &self,
        request: &Request,
        grants_page_size: usize,
        parallel_paging: bool,
        refs_page_size: usize,
    ) -> Result<AuthorizeResponse>;
}

//─────────────────────────────
//  Shared started-state
//─────────────────────────────

/// Handles a compute flavor captures at start.
#[derive(Clone)]
pub(crate) struct ComputeCtx {
    pub(crate) search: SearchFn,
    pub(crate) storage: Arc<dyn GrantStore>,
}

/// Start-once context cell shared by the bundled flavors.
pub(crate) struct CtxCell {
    inner: RwLock<Option<ComputeCtx>>,
}

impl CtxCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    pub(crate) async fn put(&self, ctx: ComputeCtx) {
        *self.inner.write().await = Some(ctx);
    }

    pub(crate) async fn get(&self) -> std::result::Result<ComputeCtx, SdkError> {
        self.inner
            .read()
            .await
            .clone()
            .ok_or_else(|| SdkError::Start("the compute module has not been started".into()))
    }

    pub(crate) async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

//─────────────────────────────
//  Decision responses
//─────────────────────────────

pub(crate) const DENIED_MESSAGE: &str =
    "A deny grant is applicable to the request. Therefore, the request is not authorized.";
pub(crate) const ALLOWED_MESSAGE: &str = "An allow grant is applicable to the request, and there \
     are no deny grants that are applicable to the request. Therefore, the request is authorized.";
pub(crate) const IMPLICIT_DENY_MESSAGE: &str = "No allow or deny grants are applicable to the \
     request. Therefore, the request is implicitly denied and is not authorized.";
pub(crate) const CRITICAL_MESSAGE: &str =
    "A critical error has occurred. Therefore, the request is not authorized.";

pub(crate) fn denied_response(grant: Grant, errors: ErrorBag) -> AuthorizeResponse {
    AuthorizeResponse {
        authorized: false,
        completed: true,
        grant: Some(grant),
        message: DENIED_MESSAGE.to_string(),
        errors,
    }
}

pub(crate) fn allowed_response(grant: Grant, errors: ErrorBag) -> AuthorizeResponse {
    AuthorizeResponse {
        authorized: true,
        completed: true,
        grant: Some(grant),
        message: ALLOWED_MESSAGE.to_string(),
        errors,
    }
}

pub(crate) fn implicit_deny_response(errors: ErrorBag) -> AuthorizeResponse {
    AuthorizeResponse {
        authorized: false,
        completed: true,
        grant: None,
        message: IMPLICIT_DENY_MESSAGE.to_string(),
        errors,
    }
}

pub(crate) fn critical_response(grant: Option<Grant>, errors: ErrorBag) -> AuthorizeResponse {
    AuthorizeResponse {
        authorized: false,
        completed: false,
        grant,
        message: CRITICAL_MESSAGE.to_string(),
        errors,
    }
}
