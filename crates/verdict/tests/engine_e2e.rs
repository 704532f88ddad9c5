//! End-to-end scenarios against the full engine: facade, schema
//! validation, storage, and every compute flavor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use verdict::{
    jmespath_search, AuditPage, AuthorizeResponse, ComputeBackend, ContextValidation, Effect,
    Engine, EngineConfig, Error, FanOutCompute, GrantStore, IdentityDefinition, InProcessCompute,
    MemoryStore, ModuleLocality, NewGrant, PoolCompute, QueryValidation, Request,
    ResourceDefinition, Result, SdkError, SearchFn, SpecError,
};

fn identity_defs() -> Vec<IdentityDefinition> {
    vec![IdentityDefinition {
        identity_type: "User".into(),
        schema: json!({
            "type": "object",
            "properties": {"id": {"type": "string"}},
            "required": ["id"]
        }),
    }]
}

fn resource_defs() -> Vec<ResourceDefinition> {
    vec![ResourceDefinition {
        resource_type: "Balloon".into(),
        actions: vec!["Balloon:Read".into(), "Balloon:Inflate".into()],
        schema: json!({
            "type": "object",
            "properties": {"color": {"type": "string"}},
            "required": ["color"]
        }),
        parent_types: vec![],
        child_types: vec![],
    }]
}

fn new_grant(effect: Effect, actions: Vec<&str>, query: &str) -> NewGrant {
    NewGrant {
        name: "grant".into(),
        description: "a test grant".into(),
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

async fn started_engine(compute: Arc<dyn ComputeBackend>) -> Engine {
    let engine = Engine::new(
        identity_defs(),
        resource_defs(),
        jmespath_search(),
        Arc::new(MemoryStore::new()),
        compute,
        EngineConfig::default(),
    );
    engine.start().await.unwrap();
    engine
}

async fn in_process_engine() -> Engine {
    started_engine(Arc::new(InProcessCompute::new())).await
}

#[tokio::test]
async fn s1_allow_only_match() {
    let engine = in_process_engine().await;
    engine
        .enact(new_grant(
            Effect::Allow,
            vec!["Balloon:Inflate"],
            "request.resource.color == 'green'",
        ))
        .await
        .unwrap();

    let resp = engine
        .authorize(&request("Balloon:Inflate", "green"), None, None, None)
        .await
        .unwrap();
    assert!(resp.authorized);
    assert!(resp.completed);
    assert_eq!(resp.grant.unwrap().effect, Effect::Allow);
}

#[tokio::test]
async fn s2_deny_overrides() {
    let engine = in_process_engine().await;
    engine
        .enact(new_grant(
            Effect::Allow,
            vec!["Balloon:Inflate"],
            "request.resource.color == 'green'",
        ))
        .await
        .unwrap();
    engine
        .enact(new_grant(Effect::Deny, vec![], "`true`"))
        .await
        .unwrap();

    let resp = engine
        .authorize(&request("Balloon:Inflate", "green"), None, None, None)
        .await
        .unwrap();
    assert!(!resp.authorized);
    assert!(resp.completed);
    assert_eq!(resp.grant.unwrap().effect, Effect::Deny);
}

#[tokio::test]
async fn s3_action_mismatch() {
    let engine = in_process_engine().await;
    engine
        .enact(new_grant(
            Effect::Allow,
            vec!["Balloon:Inflate"],
            "request.resource.color == 'green'",
        ))
        .await
        .unwrap();

    let resp = engine
        .authorize(&request("Balloon:Read", "green"), None, None, None)
        .await
        .unwrap();
    assert!(!resp.authorized);
    assert!(resp.completed);
    assert!(resp.grant.is_none());
}

#[tokio::test]
async fn s4_non_critical_query_failure() {
    let engine = in_process_engine().await;
    engine
        .enact(new_grant(Effect::Allow, vec![], "nosuchfunc(request)"))
        .await
        .unwrap();

    let resp = engine
        .authorize(&request("Balloon:Read", "green"), None, None, None)
        .await
        .unwrap();
    assert!(!resp.authorized);
    assert!(resp.completed);
    assert_eq!(resp.errors.jmespath.len(), 1);
    assert!(!resp.errors.jmespath[0].critical);
}

#[tokio::test]
async fn s5_critical_query_failure() {
    let engine = in_process_engine().await;
    let mut grant = new_grant(Effect::Allow, vec![], "nosuchfunc(request)");
    grant.query_validation = QueryValidation::Error;
    engine.enact(grant).await.unwrap();

    let err = engine
        .authorize(&request("Balloon:Read", "green"), None, None, None)
        .await
        .unwrap_err();
    let Error::Spec(SpecError::Jmespath { errors, .. }) = err else {
        panic!("expected a critical query error, got {err:?}");
    };
    assert_eq!(errors.jmespath.len(), 1);
    assert!(errors.jmespath[0].critical);
}

#[tokio::test]
async fn s6_paginated_authorize_and_audit() {
    let engine = in_process_engine().await;
    for _ in 0..250 {
        engine
            .enact(new_grant(Effect::Allow, vec!["Balloon:Read"], "`true`"))
            .await
            .unwrap();
    }

    let resp = engine
        .authorize(&request("Balloon:Read", "green"), Some(50), None, None)
        .await
        .unwrap();
    assert!(resp.authorized);

    let mut grants = Vec::new();
    let mut slabs = 0;
    let mut page_ref: Option<String> = None;
    loop {
        let page: AuditPage = engine
            .audit_page(
                &request("Balloon:Read", "green"),
                page_ref.as_deref(),
                Some(50),
                None,
                None,
            )
            .await
            .unwrap();
        slabs += 1;
        grants.extend(page.grants);
        page_ref = page.next_page_ref;
        if page_ref.is_none() {
            break;
        }
    }
    assert_eq!(slabs, 5);
    assert_eq!(grants.len(), 250);
}

#[tokio::test]
async fn parallel_and_sequential_paging_agree() {
    let engine = in_process_engine().await;
    for i in 0..60 {
        let query = if i % 3 == 0 {
            "request.resource.color == 'green'"
        } else {
            "`false`"
        };
        engine
            .enact(new_grant(Effect::Allow, vec!["Balloon:Read"], query))
            .await
            .unwrap();
        engine
            .enact(new_grant(Effect::Deny, vec!["Balloon:Inflate"], "`true`"))
            .await
            .unwrap();
    }

    let sequential = engine
        .authorize(&request("Balloon:Read", "green"), Some(7), Some(false), Some(3))
        .await
        .unwrap();
    let parallel = engine
        .authorize(&request("Balloon:Read", "green"), Some(7), Some(true), Some(3))
        .await
        .unwrap();
    assert!(sequential.authorized);
    assert_eq!(sequential.authorized, parallel.authorized);
    assert_eq!(sequential.completed, parallel.completed);

    let denied_seq = engine
        .authorize(&request("Balloon:Inflate", "green"), Some(7), Some(false), Some(3))
        .await
        .unwrap();
    let denied_par = engine
        .authorize(&request("Balloon:Inflate", "green"), Some(7), Some(true), Some(3))
        .await
        .unwrap();
    assert!(!denied_seq.authorized);
    assert_eq!(denied_seq.authorized, denied_par.authorized);
}

#[tokio::test]
async fn fan_out_and_pool_agree_with_in_process() {
    async fn decide(compute: Arc<dyn ComputeBackend>) -> (AuthorizeResponse, AuthorizeResponse) {
        let engine = started_engine(compute).await;
        for i in 0..40 {
            let query = if i == 25 {
                "request.resource.color == 'green'"
            } else {
                "`false`"
            };
            engine
                .enact(new_grant(Effect::Allow, vec!["Balloon:Read"], query))
                .await
                .unwrap();
        }
        let allowed = engine
            .authorize(&request("Balloon:Read", "green"), Some(5), None, None)
            .await
            .unwrap();
        let denied = engine
            .authorize(&request("Balloon:Read", "red"), Some(5), None, None)
            .await
            .unwrap();
        (allowed, denied)
    }

    let (a1, d1) = decide(Arc::new(InProcessCompute::new())).await;
    let (a2, d2) = decide(Arc::new(FanOutCompute::new(Some(4)))).await;
    let (a3, d3) = decide(Arc::new(PoolCompute::new(
        2,
        Arc::new(|| Box::new(InProcessCompute::new()) as Box<dyn ComputeBackend>),
    )))
    .await;

    for allowed in [&a1, &a2, &a3] {
        assert!(allowed.authorized);
        assert!(allowed.completed);
    }
    for denied in [&d1, &d2, &d3] {
        assert!(!denied.authorized);
        assert!(denied.completed);
        assert!(denied.grant.is_none());
    }
}

#[tokio::test]
async fn invalid_request_is_rejected_before_compute() {
    let engine = in_process_engine().await;
    let mut bad = request("Balloon:Read", "green");
    bad.action = "Balloon:Pop".into();
    let err = engine.authorize(&bad, None, None, None).await.unwrap_err();
    assert!(matches!(err, Error::Spec(SpecError::Request { .. })));
}

#[tokio::test]
async fn invalid_grant_is_rejected() {
    let engine = in_process_engine().await;
    let err = engine
        .enact(new_grant(Effect::Allow, vec!["Balloon:Pop"], "`true`"))
        .await
        .unwrap_err();
    let Error::Spec(SpecError::Grant { errors, .. }) = err else {
        panic!("expected a grant validation error");
    };
    assert!(!errors.grant.is_empty());
}

#[tokio::test]
async fn grant_crud_through_the_facade() {
    let engine = in_process_engine().await;
    let grant = engine
        .enact(new_grant(Effect::Allow, vec!["Balloon:Read"], "`true`"))
        .await
        .unwrap();
    let fetched = engine.get_grant(grant.grant_uuid).await.unwrap();
    assert_eq!(fetched.grant_uuid, grant.grant_uuid);

    let page = engine
        .get_grants_page(Some(Effect::Allow), Some("Balloon:Read"), None, None)
        .await
        .unwrap();
    assert_eq!(page.grants.len(), 1);

    let refs = engine
        .get_grant_page_refs_page(Some(Effect::Allow), Some("Balloon:Read"), None, None, None)
        .await
        .unwrap();
    assert_eq!(refs.page_refs.len(), 1);
    assert!(refs.next_page_ref.is_none());

    engine.repeal(grant.grant_uuid).await.unwrap();
    let err = engine.get_grant(grant.grant_uuid).await.unwrap_err();
    assert!(matches!(err, Error::Sdk(SdkError::GrantNotFound(_))));
}

#[tokio::test]
async fn lifecycle_is_enforced() {
    let engine = Engine::new(
        identity_defs(),
        resource_defs(),
        jmespath_search(),
        Arc::new(MemoryStore::new()),
        Arc::new(InProcessCompute::new()),
        EngineConfig::default(),
    );

    let err = engine
        .authorize(&request("Balloon:Read", "green"), None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Sdk(SdkError::Start(_))));

    engine.start().await.unwrap();
    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, Error::Sdk(SdkError::Start(_))));

    engine.shutdown().await.unwrap();
    let err = engine
        .authorize(&request("Balloon:Read", "green"), None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Sdk(SdkError::Start(_))));
}

#[tokio::test]
async fn invalid_definitions_fail_start() {
    let mut ids = identity_defs();
    ids.push(ids[0].clone());
    let engine = Engine::new(
        ids,
        resource_defs(),
        jmespath_search(),
        Arc::new(MemoryStore::new()),
        Arc::new(InProcessCompute::new()),
        EngineConfig::default(),
    );
    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, Error::Spec(SpecError::Definition { .. })));
}

//─────────────────────────────
//  Locality gating
//─────────────────────────────

struct StubCompute {
    locality: ModuleLocality,
}

#[async_trait]
impl ComputeBackend for StubCompute {
    async fn start(
        &self,
        _identity_defs: &[IdentityDefinition],
        _resource_defs: &[ResourceDefinition],
        _search: SearchFn,
        _storage: Arc<dyn GrantStore>,
    ) -> Result<()> {
        Ok(())
    }

    fn locality(&self) -> ModuleLocality {
        self.locality
    }

    async fn audit_page(
        &self,
        _request: &Request,
        _page_ref: Option<&str>,
        _grants_page_size: usize,
        _parallel_paging: bool,
        _refs_page_size: usize,
    ) -> Result<AuditPage> {
        Err(SdkError::NotImplemented("audit_page".into()).into())
    }

    async fn authorize(
        &self,
        _request: &Request,
        _grants_page_size: usize,
        _parallel_paging: bool,
        _refs_page_size: usize,
    ) -> Result<AuthorizeResponse> {
        Err(SdkError::NotImplemented("authorize".into()).into())
    }
}

#[tokio::test]
async fn incompatible_localities_fail_start() {
    for locality in [ModuleLocality::System, ModuleLocality::Network] {
        let engine = Engine::new(
            identity_defs(),
            resource_defs(),
            jmespath_search(),
            Arc::new(MemoryStore::new()),
            Arc::new(StubCompute { locality }),
            EngineConfig::default(),
        );
        let err = engine.start().await.unwrap_err();
        let Error::Sdk(SdkError::LocalityIncompatibility { compute, storage }) = err else {
            panic!("expected a locality error for {locality}");
        };
        assert_eq!(compute, locality);
        assert_eq!(storage, ModuleLocality::Process);
    }
}

#[tokio::test]
async fn process_compute_accepts_process_storage() {
    let engine = started_engine(Arc::new(StubCompute {
        locality: ModuleLocality::Process,
    }))
    .await;
    engine.shutdown().await.unwrap();
}
