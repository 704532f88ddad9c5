//! Worker fan-out compute.
//!
//! Slabs of grants are dispatched to worker tasks as the scan discovers
//! them, so page fetches and predicate evaluation overlap across workers.
//! Short-circuiting is cooperative: a deny match sets the shared cancel
//! latch, an allow match sets the allow-found latch, and every worker polls
//! the latches before each grant evaluation and exits early once one is
//! set. The driver stops dispatching as soon as a latch is set and always
//! joins outstanding workers before returning, so storage reads already in
//! flight complete.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use verdict_kernel::{evaluate_grant, Fault, PageOutcome, SearchFn};
use verdict_store_core::GrantStore;
use verdict_types::{
    AuditPage, AuthorizeResponse, Effect, ErrorBag, Grant, IdentityDefinition, ModuleLocality,
    Request, ResourceDefinition, Result, SdkError,
};

use crate::latch::{Latch, OneShotFlag, StoreLatch};
use crate::paging::fetch_slab;
use crate::{
    allowed_response, critical_response, denied_response, implicit_deny_response, ComputeBackend,
    ComputeCtx, CtxCell,
};

/// How the fan-out compute backs its two per-request latches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    /// Process-shared flags. The default; workers are tasks in the
    /// engine's process.
    Local,
    /// Storage-backed latches, observable by workers outside the engine's
    /// process. Created before the scan and deleted after it.
    Storage,
}

/// Evaluate a slice of grants, polling the given latches before every
/// grant evaluation.
///
/// Stops early with `cancelled` set once any latch is observed set; stops
/// with `fault` set on a critical failure.
async fn evaluate_cancellable(
    request: &Request,
    grants: &[Grant],
    search: &SearchFn,
    latches: &[Arc<dyn Latch>],
    stop_on_match: bool,
) -> std::result::Result<PageOutcome, SdkError> {
    let mut outcome = PageOutcome::default();
    for grant in grants {
        for latch in latches {
            if latch.is_set().await? {
                outcome.cancelled = true;
                return Ok(outcome);
            }
        }
        let eval = evaluate_grant(request, grant, search);
        let fault = eval.fault;
        outcome.errors.merge(eval.errors);
        if let Some(kind) = fault {
            outcome.fault = Some(Fault {
                kind,
                grant: grant.clone(),
            });
            return Ok(outcome);
        }
        if eval.applicable {
            outcome.matched.push(grant.clone());
            if stop_on_match {
                return Ok(outcome);
            }
        }
    }
    Ok(outcome)
}

/// Compute that fans slabs out to worker tasks for one request.
///
/// Generally aims to serve a single decision as fast as possible by keeping
/// up to `max_workers` slabs in flight.
pub struct FanOutCompute {
    max_workers: usize,
    latch_mode: LatchMode,
    permits: Arc<Semaphore>,
    ctx: CtxCell,
}

impl FanOutCompute {
    /// Create a fan-out compute with process-local latches.
    ///
    /// `max_workers` of `None` defaults to the machine's available
    /// parallelism.
    pub fn new(max_workers: Option<usize>) -> Self {
        Self::with_latch_mode(max_workers, LatchMode::Local)
    }

    /// Create a fan-out compute with the given latch mode.
    pub fn with_latch_mode(max_workers: Option<usize>, latch_mode: LatchMode) -> Self {
        let max_workers = max_workers
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(4)
            .max(1);
        Self {
            max_workers,
            latch_mode,
            permits: Arc::new(Semaphore::new(max_workers)),
            ctx: CtxCell::new(),
        }
    }

    async fn new_latch(&self, ctx: &ComputeCtx) -> std::result::Result<Arc<dyn Latch>, SdkError> {
        match self.latch_mode {
            LatchMode::Local => Ok(Arc::new(OneShotFlag::new())),
            LatchMode::Storage => Ok(Arc::new(StoreLatch::create(ctx.storage.clone()).await?)),
        }
    }

    /// Dispatch the filtered scan for one effect to worker tasks and join
    /// them all. Workers poll `latches` and set `on_match` at the first
    /// applicable grant.
    async fn scan_phase(
        &self,
        ctx: &ComputeCtx,
        request: &Request,
        effect: Effect,
        grants_page_size: usize,
        parallel_paging: bool,
        refs_page_size: usize,
        latches: Vec<Arc<dyn Latch>>,
        on_match: Arc<dyn Latch>,
    ) -> Result<PhaseOutcome> {
        let mut handles: Vec<JoinHandle<std::result::Result<PageOutcome, SdkError>>> = Vec::new();
        let mut page_ref: Option<String> = None;
        let mut dispatched = 0usize;

        loop {
            let mut stop = false;
            for latch in &latches {
                if latch.is_set().await? {
                    stop = true;
                    break;
                }
            }
            if stop {
                break;
            }

            let slab = fetch_slab(
                &ctx.storage,
                Some(effect),
                Some(&request.action),
                page_ref.as_deref(),
                grants_page_size,
                parallel_paging,
                refs_page_size,
            )
            .await?;
            page_ref = slab.next_page_ref;

            if !slab.grants.is_empty() {
                let permit = self
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| SdkError::Worker(e.to_string()))?;
                let grants = slab.grants;
                let request = request.clone();
                let search = ctx.search.clone();
                let latches = latches.clone();
                let on_match = on_match.clone();
                dispatched += 1;
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    let outcome =
                        evaluate_cancellable(&request, &grants, &search, &latches, true).await?;
                    if !outcome.matched.is_empty() {
                        on_match.set().await?;
                    }
                    Ok(outcome)
                }));
            }

            if page_ref.is_none() {
                break;
            }
        }
        debug!(%effect, workers = dispatched, "joining scan workers");

        let mut merged = PhaseOutcome::default();
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| SdkError::Worker(e.to_string()))??;
            merged.errors.merge(outcome.errors);
            if merged.fault.is_none() {
                merged.fault = outcome.fault;
            }
            if merged.winner.is_none() {
                merged.winner = outcome.matched.into_iter().next();
            }
        }
        Ok(merged)
    }
}

#[derive(Default)]
struct PhaseOutcome {
    winner: Option<Grant>,
    errors: ErrorBag,
    fault: Option<Fault>,
}

async fn release_latches(latches: &[Arc<dyn Latch>]) {
    for latch in latches {
        if let Err(e) = latch.release().await {
            warn!(error = %e, "failed to release cancellation latch");
        }
    }
}

#[async_trait]
impl ComputeBackend for FanOutCompute {
    async fn start(
        &self,
        _identity_defs: &[IdentityDefinition],
        _resource_defs: &[ResourceDefinition],
        search: SearchFn,
        storage: Arc<dyn GrantStore>,
    ) -> Result<()> {
        self.ctx.put(ComputeCtx { search, storage }).await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.ctx.clear().await;
        Ok(())
    }

    fn locality(&self) -> ModuleLocality {
        ModuleLocality::Process
    }

    async fn audit_page(
        &self,
        request: &Request,
        page_ref: Option<&str>,
        grants_page_size: usize,
        parallel_paging: bool,
        refs_page_size: usize,
    ) -> Result<AuditPage> {
        let ctx = self.ctx.get().await?;
        let slab = fetch_slab(
            &ctx.storage,
            None,
            Some(&request.action),
            page_ref,
            grants_page_size,
            parallel_paging,
            refs_page_size,
        )
        .await?;

        // Audit has no short-circuit, so the slab is split into chunks and
        // evaluated concurrently without latches.
        let chunk_size = slab.grants.len().div_ceil(self.max_workers).max(1);
        let chunks: Vec<Vec<Grant>> = slab
            .grants
            .chunks(chunk_size)
            .map(<[Grant]>::to_vec)
            .collect();

        let mut handles = Vec::new();
        for grants in chunks {
            let request = request.clone();
            let search = ctx.search.clone();
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SdkError::Worker(e.to_string()))?;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                verdict_kernel::collect_matches(&request, &grants, &search)
            }));
        }

        let mut page = AuditPage {
            completed: true,
            grants: Vec::new(),
            errors: ErrorBag::default(),
            next_page_ref: slab.next_page_ref,
        };
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| SdkError::Worker(e.to_string()))?;
            page.grants.extend(outcome.matched);
            page.errors.merge(outcome.errors);
            if outcome.fault.is_some() {
                page.completed = false;
            }
        }
        Ok(page)
    }

    async fn authorize(
        &self,
        request: &Request,
        grants_page_size: usize,
        parallel_paging: bool,
        refs_page_size: usize,
    ) -> Result<AuthorizeResponse> {
        let ctx = self.ctx.get().await?;
        let cancel = self.new_latch(&ctx).await?;
        let allow_found = self.new_latch(&ctx).await?;
        let all_latches = [cancel.clone(), allow_found.clone()];

        let deny = self
            .scan_phase(
                &ctx,
                request,
                Effect::Deny,
                grants_page_size,
                parallel_paging,
                refs_page_size,
                vec![cancel.clone()],
                cancel.clone(),
            )
            .await;
        let deny = match deny {
            Ok(outcome) => outcome,
            Err(e) => {
                release_latches(&all_latches).await;
                return Err(e);
            }
        };
        let mut errors = deny.errors;
        if let Some(fault) = deny.fault {
            release_latches(&all_latches).await;
            return Ok(critical_response(Some(fault.grant), errors));
        }
        if let Some(winner) = deny.winner {
            release_latches(&all_latches).await;
            return Ok(denied_response(winner, errors));
        }

        let allow = self
            .scan_phase(
                &ctx,
                request,
                Effect::Allow,
                grants_page_size,
                parallel_paging,
                refs_page_size,
                vec![cancel.clone(), allow_found.clone()],
                allow_found.clone(),
            )
            .await;
        release_latches(&all_latches).await;
        let allow = allow?;
        errors.merge(allow.errors);

        if let Some(fault) = allow.fault {
            return Ok(critical_response(Some(fault.grant), errors));
        }
        if let Some(winner) = allow.winner {
            return Ok(allowed_response(winner, errors));
        }
        Ok(implicit_deny_response(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use verdict_kernel::jmespath_search;
    use verdict_store_memory::MemoryStore;
    use verdict_types::{ContextValidation, NewGrant, QueryValidation};

    fn defs() -> Vec<ResourceDefinition> {
        vec![ResourceDefinition {
            resource_type: "Balloon".into(),
            actions: vec!["Balloon:Read".into(), "Balloon:Inflate".into()],
            schema: json!({"type": "object"}),
            parent_types: vec![],
            child_types: vec![],
        }]
    }

    fn new_grant(effect: Effect, actions: Vec<&str>, query: &str) -> NewGrant {
        NewGrant {
            name: "g".into(),
            description: String::new(),
            tags: BTreeMap::new(),
            effect,
            actions: actions.into_iter().map(String::from).collect(),
            query: query.into(),
            query_validation: QueryValidation::Validate,
            equality: true,
            data: json!({}),
            context_schema: json!({"type": "object"}),
            context_validation: ContextValidation::None,
        }
    }

    fn request(action: &str, color: &str) -> Request {
        let mut identities = HashMap::new();
        identities.insert("User".to_string(), vec![json!({"id": "user123"})]);
        Request {
            identities,
            resource_type: "Balloon".into(),
            action: action.into(),
            resource: json!({"color": color}),
            parents: HashMap::new(),
            children: HashMap::new(),
            context: serde_json::Map::new(),
            query_validation: QueryValidation::None,
            context_validation: ContextValidation::Grant,
        }
    }

    async fn populated_store(denies: usize, allows: usize) -> MemoryStore {
        let store = MemoryStore::new();
        store.start(&[], &defs()).await.unwrap();
        for _ in 0..denies {
            store
                .enact(new_grant(Effect::Deny, vec!["Balloon:Read"], "`false`"))
                .await
                .unwrap();
        }
        for _ in 0..allows {
            store
                .enact(new_grant(
                    Effect::Allow,
                    vec!["Balloon:Read"],
                    "request.resource.color == 'green'",
                ))
                .await
                .unwrap();
        }
        store
    }

    async fn started(store: &MemoryStore, mode: LatchMode) -> FanOutCompute {
        let compute = FanOutCompute::with_latch_mode(Some(4), mode);
        compute
            .start(&[], &defs(), jmespath_search(), Arc::new(store.clone()))
            .await
            .unwrap();
        compute
    }

    #[tokio::test]
    async fn allow_match_across_many_pages() {
        let store = populated_store(30, 30).await;
        let compute = started(&store, LatchMode::Local).await;
        let resp = compute
            .authorize(&request("Balloon:Read", "green"), 5, false, 5)
            .await
            .unwrap();
        assert!(resp.authorized);
        assert!(resp.completed);
        assert_eq!(resp.grant.unwrap().effect, Effect::Allow);
    }

    #[tokio::test]
    async fn deny_short_circuits_peers() {
        let store = populated_store(0, 40).await;
        store
            .enact(new_grant(Effect::Deny, vec![], "`true`"))
            .await
            .unwrap();
        let compute = started(&store, LatchMode::Local).await;
        let resp = compute
            .authorize(&request("Balloon:Read", "green"), 5, false, 5)
            .await
            .unwrap();
        assert!(!resp.authorized);
        assert_eq!(resp.grant.unwrap().effect, Effect::Deny);
    }

    #[tokio::test]
    async fn storage_latches_are_created_and_freed() {
        let store = populated_store(3, 3).await;
        let compute = started(&store, LatchMode::Storage).await;
        let resp = compute
            .authorize(&request("Balloon:Read", "green"), 2, false, 2)
            .await
            .unwrap();
        assert!(resp.authorized);
        // both per-request latches were deleted on return
        assert_eq!(store.latch_count().await, 0);
    }

    #[tokio::test]
    async fn parallel_paging_gives_the_same_decision() {
        let store = populated_store(10, 10).await;
        let compute = started(&store, LatchMode::Local).await;
        let sequential = compute
            .authorize(&request("Balloon:Read", "green"), 3, false, 3)
            .await
            .unwrap();
        let parallel = compute
            .authorize(&request("Balloon:Read", "green"), 3, true, 3)
            .await
            .unwrap();
        assert_eq!(sequential.authorized, parallel.authorized);
        assert_eq!(sequential.completed, parallel.completed);
    }

    #[tokio::test]
    async fn critical_failure_aborts() {
        let store = populated_store(0, 0).await;
        let mut bad = new_grant(Effect::Deny, vec![], "nosuchfunc(request)");
        bad.query_validation = QueryValidation::Error;
        store.enact(bad).await.unwrap();
        let compute = started(&store, LatchMode::Local).await;
        let resp = compute
            .authorize(&request("Balloon:Read", "green"), 5, false, 5)
            .await
            .unwrap();
        assert!(!resp.completed);
        assert!(resp.errors.jmespath[0].critical);
    }

    #[tokio::test]
    async fn audit_page_chunks_cover_the_slab() {
        let store = populated_store(0, 23).await;
        let compute = started(&store, LatchMode::Local).await;
        let page = compute
            .audit_page(&request("Balloon:Read", "green"), None, 50, false, 5)
            .await
            .unwrap();
        assert!(page.completed);
        assert_eq!(page.grants.len(), 23);
        assert!(page.next_page_ref.is_none());
    }
}
