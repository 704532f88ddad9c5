//! Sequential reference compute.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use verdict_kernel::{collect_matches, find_match, SearchFn};
use verdict_store_core::GrantStore;
use verdict_types::{
    AuditPage, AuthorizeResponse, Effect, ErrorBag, IdentityDefinition, ModuleLocality, Request,
    ResourceDefinition, Result,
};

use crate::paging::fetch_slab;
use crate::{
    allowed_response, critical_response, denied_response, implicit_deny_response, ComputeBackend,
    ComputeCtx, CtxCell,
};

/// Compute that runs in the caller's task.
///
/// Parallel paging is supported, but only widens each slab; evaluation is
/// still sequential.
pub struct InProcessCompute {
    ctx: CtxCell,
}

impl InProcessCompute {
    /// Create a compute in the `Created` state; call
    /// [`start`](ComputeBackend::start) before use.
    pub fn new() -> Self {
        Self {
            ctx: CtxCell::new(),
        }
    }
}

impl Default for InProcessCompute {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeBackend for InProcessCompute {
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
        let outcome = collect_matches(request, &slab.grants, &ctx.search);
        Ok(AuditPage {
            completed: outcome.fault.is_none(),
            grants: outcome.matched,
            errors: outcome.errors,
            next_page_ref: slab.next_page_ref,
        })
    }

    async fn authorize(
        &self,
        request: &Request,
        grants_page_size: usize,
        parallel_paging: bool,
        refs_page_size: usize,
    ) -> Result<AuthorizeResponse> {
        let ctx = self.ctx.get().await?;
        let mut errors = ErrorBag::default();

        for effect in [Effect::Deny, Effect::Allow] {
            let mut page_ref: Option<String> = None;
            loop {
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
                debug!(%effect, grants = slab.grants.len(), "evaluating slab");
                let outcome = find_match(request, &slab.grants, &ctx.search);
                let fault = outcome.fault;
                errors.merge(outcome.errors);

                if let Some(fault) = fault {
                    return Ok(critical_response(Some(fault.grant), errors));
                }
                if let Some(winner) = outcome.matched.into_iter().next() {
                    return Ok(match effect {
                        Effect::Deny => denied_response(winner, errors),
                        Effect::Allow => allowed_response(winner, errors),
                    });
                }

                page_ref = slab.next_page_ref;
                if page_ref.is_none() {
                    break;
                }
            }
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
    use verdict_types::{ContextValidation, Error, NewGrant, QueryValidation, SdkError};

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

    async fn started(store: &MemoryStore) -> InProcessCompute {
        let compute = InProcessCompute::new();
        compute
            .start(&[], &defs(), jmespath_search(), Arc::new(store.clone()))
            .await
            .unwrap();
        compute
    }

    #[tokio::test]
    async fn deny_overrides_allow() {
        let store = MemoryStore::new();
        store.start(&[], &defs()).await.unwrap();
        store
            .enact(new_grant(
                Effect::Allow,
                vec!["Balloon:Inflate"],
                "request.resource.color == 'green'",
            ))
            .await
            .unwrap();
        store
            .enact(new_grant(Effect::Deny, vec![], "`true`"))
            .await
            .unwrap();

        let compute = started(&store).await;
        let resp = compute
            .authorize(&request("Balloon:Inflate", "green"), 10, false, 10)
            .await
            .unwrap();
        assert!(!resp.authorized);
        assert!(resp.completed);
        assert_eq!(resp.grant.unwrap().effect, Effect::Deny);
    }

    #[tokio::test]
    async fn allow_match_authorizes() {
        let store = MemoryStore::new();
        store.start(&[], &defs()).await.unwrap();
        store
            .enact(new_grant(
                Effect::Allow,
                vec!["Balloon:Inflate"],
                "request.resource.color == 'green'",
            ))
            .await
            .unwrap();

        let compute = started(&store).await;
        let resp = compute
            .authorize(&request("Balloon:Inflate", "green"), 10, false, 10)
            .await
            .unwrap();
        assert!(resp.authorized);
        assert_eq!(resp.grant.unwrap().effect, Effect::Allow);
        assert_eq!(resp.message, crate::ALLOWED_MESSAGE);
    }

    #[tokio::test]
    async fn no_applicable_grant_is_implicit_deny() {
        let store = MemoryStore::new();
        store.start(&[], &defs()).await.unwrap();
        let compute = started(&store).await;
        let resp = compute
            .authorize(&request("Balloon:Read", "green"), 10, false, 10)
            .await
            .unwrap();
        assert!(!resp.authorized);
        assert!(resp.completed);
        assert!(resp.grant.is_none());
    }

    #[tokio::test]
    async fn critical_query_failure_stops_the_scan() {
        let store = MemoryStore::new();
        store.start(&[], &defs()).await.unwrap();
        let mut bad = new_grant(Effect::Allow, vec![], "nosuchfunc(request)");
        bad.query_validation = QueryValidation::Error;
        store.enact(bad).await.unwrap();

        let compute = started(&store).await;
        let resp = compute
            .authorize(&request("Balloon:Read", "green"), 10, false, 10)
            .await
            .unwrap();
        assert!(!resp.completed);
        assert!(!resp.authorized);
        assert!(resp.errors.jmespath[0].critical);
    }

    #[tokio::test]
    async fn non_critical_query_failure_is_recorded() {
        let store = MemoryStore::new();
        store.start(&[], &defs()).await.unwrap();
        store
            .enact(new_grant(Effect::Allow, vec![], "nosuchfunc(request)"))
            .await
            .unwrap();

        let compute = started(&store).await;
        let resp = compute
            .authorize(&request("Balloon:Read", "green"), 10, false, 10)
            .await
            .unwrap();
        assert!(!resp.authorized);
        assert!(resp.completed);
        assert_eq!(resp.errors.jmespath.len(), 1);
        assert!(!resp.errors.jmespath[0].critical);
    }

    #[tokio::test]
    async fn audit_pages_cover_all_matching_grants() {
        let store = MemoryStore::new();
        store.start(&[], &defs()).await.unwrap();
        for _ in 0..25 {
            store
                .enact(new_grant(Effect::Allow, vec!["Balloon:Read"], "`true`"))
                .await
                .unwrap();
        }

        let compute = started(&store).await;
        let mut grants = Vec::new();
        let mut page_ref: Option<String> = None;
        let mut slabs = 0;
        loop {
            let page = compute
                .audit_page(&request("Balloon:Read", "green"), page_ref.as_deref(), 10, false, 10)
                .await
                .unwrap();
            assert!(page.completed);
            slabs += 1;
            grants.extend(page.grants);
            page_ref = page.next_page_ref;
            if page_ref.is_none() {
                break;
            }
        }
        assert_eq!(slabs, 3);
        assert_eq!(grants.len(), 25);
    }

    #[tokio::test]
    async fn unstarted_compute_is_rejected() {
        let compute = InProcessCompute::new();
        let err = compute
            .authorize(&request("Balloon:Read", "green"), 10, false, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sdk(SdkError::Start(_))));
    }
}
