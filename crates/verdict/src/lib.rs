#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict** – Attribute-based authorization engine.
//!
//! Given declarative identity and resource definitions, operators *enact*
//! grants (allow/deny rules whose bodies are expression-language
//! predicates) and later submit requests describing a caller, a target
//! resource, an action, and ambient context. The engine decides whether a
//! request is authorized by deny-overrides composition over a paginated
//! scan of applicable grants.
//!
//! The [`Engine`] facade owns the generated schemas and the configured
//! storage and compute modules:
//!
//! ```no_run
//! use std::sync::Arc;
//! use verdict::{Engine, EngineConfig, InProcessCompute, MemoryStore};
//! use verdict::jmespath_search;
//!
//! # async fn demo(identity_defs: Vec<verdict::IdentityDefinition>,
//! #               resource_defs: Vec<verdict::ResourceDefinition>,
//! #               new_grant: verdict::NewGrant,
//! #               request: verdict::Request) -> verdict::Result<()> {
//! let engine = Engine::new(
//!     identity_defs,
//!     resource_defs,
//!     jmespath_search(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(InProcessCompute::new()),
//!     EngineConfig::default(),
//! );
//! engine.start().await?;
//! engine.enact(new_grant).await?;
//! let decision = engine.authorize(&request, None, None, None).await?;
//! if decision.authorized {
//!     // proceed
//! }
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use verdict_schema::{generate_schemas, validate_definitions, validate_grants, validate_request};

pub use verdict_compute::{
    ComputeBackend, ComputeFactory, FanOutCompute, InProcessCompute, Latch, LatchMode,
    OneShotFlag, PoolCompute, StoreLatch,
};
pub use verdict_kernel::{jmespath_search, SearchError, SearchFn};
pub use verdict_schema::{Schemas, ValidationReport};
pub use verdict_store_core::{GrantStore, StoreResult};
pub use verdict_store_memory::MemoryStore;
pub use verdict_types::{
    AuditPage, AuthorizeResponse, ContextError, ContextValidation, DefinitionError,
    DefinitionKind, Effect, Error, ErrorBag, Grant, GrantError, GrantsPage, IdentityDefinition,
    JmespathError, ModuleLocality, NewGrant, PageRefsPage, QueryValidation, Request,
    RequestError, ResourceDefinition, Result, SdkError, SpecError, StorageLatch,
};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Default values applied when a caller passes `None` for a per-call
/// parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default number of grants per page. Not exact.
    pub grants_page_size: usize,
    /// Default number of page references per refs page. Not exact.
    pub refs_page_size: usize,
    /// Default for enabling parallel pagination.
    pub parallel_paging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grants_page_size: 100,
            refs_page_size: 10,
            parallel_paging: false,
        }
    }
}

//─────────────────────────────
//  Lifecycle
//─────────────────────────────

#[derive(Clone)]
struct StartedState {
    schemas: Schemas,
    declared_actions: HashSet<String>,
}

enum Lifecycle {
    Created,
    Started(StartedState),
    Shutdown,
}

//─────────────────────────────
//  Engine facade
//─────────────────────────────

/// The authorization engine.
///
/// Lifecycle: `Created → Started → Shutdown`, with optional
/// [`setup`](Engine::setup)/[`teardown`](Engine::teardown) provisioning
/// hooks. Every public operation other than the lifecycle methods requires
/// the `Started` state.
pub struct Engine {
    identity_defs: Vec<IdentityDefinition>,
    resource_defs: Vec<ResourceDefinition>,
    search: SearchFn,
    storage: Arc<dyn GrantStore>,
    compute: Arc<dyn ComputeBackend>,
    config: EngineConfig,
    state: RwLock<Lifecycle>,
}

impl Engine {
    /// Wire an engine from its parts. Nothing runs until
    /// [`start`](Engine::start).
    pub fn new(
        identity_defs: Vec<IdentityDefinition>,
        resource_defs: Vec<ResourceDefinition>,
        search: SearchFn,
        storage: Arc<dyn GrantStore>,
        compute: Arc<dyn ComputeBackend>,
        config: EngineConfig,
    ) -> Self {
        Self {
            identity_defs,
            resource_defs,
            search,
            storage,
            compute,
            config,
            state: RwLock::new(Lifecycle::Created),
        }
    }

    async fn started(&self) -> Result<StartedState> {
        match &*self.state.read().await {
            Lifecycle::Started(s) => Ok(s.clone()),
            Lifecycle::Created => Err(SdkError::Start(
                "the engine has not been started; call start() first".into(),
            )
            .into()),
            Lifecycle::Shutdown => {
                Err(SdkError::Start("the engine has been shut down".into()).into())
            }
        }
    }

    /// Validate the definitions, generate the derived schemas, start
    /// storage then compute, and verify locality compatibility.
    pub async fn start(&self) -> Result<()> {
        {
            let state = self.state.read().await;
            match &*state {
                Lifecycle::Created => {}
                Lifecycle::Started(_) => {
                    return Err(SdkError::Start("the engine is already started".into()).into())
                }
                Lifecycle::Shutdown => {
                    return Err(SdkError::Start("the engine has been shut down".into()).into())
                }
            }
        }

        let report = validate_definitions(&self.identity_defs, &self.resource_defs);
        if !report.valid {
            return Err(SpecError::Definition {
                message: "Error when validating the identity or resource definitions.".into(),
                errors: report.errors,
            }
            .into());
        }

        let schemas = generate_schemas(&self.identity_defs, &self.resource_defs);
        let declared_actions: HashSet<String> = self
            .resource_defs
            .iter()
            .flat_map(|rd| rd.actions.iter().cloned())
            .collect();

        self.storage
            .start(&self.identity_defs, &self.resource_defs)
            .await?;
        self.compute
            .start(
                &self.identity_defs,
                &self.resource_defs,
                self.search.clone(),
                self.storage.clone(),
            )
            .await?;

        let compute_locality = self.compute.locality();
        let storage_locality = self.storage.locality();
        if !compute_locality.accepts(storage_locality) {
            return Err(SdkError::LocalityIncompatibility {
                compute: compute_locality,
                storage: storage_locality,
            }
            .into());
        }

        *self.state.write().await = Lifecycle::Started(StartedState {
            schemas,
            declared_actions,
        });
        info!(compute = %compute_locality, storage = %storage_locality, "engine started");
        Ok(())
    }

    /// Release runtime resources of the compute and storage modules.
    ///
    /// Should be called on program shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        self.storage.shutdown().await?;
        self.compute.shutdown().await?;
        *self.state.write().await = Lifecycle::Shutdown;
        info!("engine shut down");
        Ok(())
    }

    /// One-time provisioning of durable resources for the configured
    /// modules. Idempotent.
    pub async fn setup(&self) -> Result<()> {
        self.storage.setup().await?;
        self.compute.setup().await?;
        Ok(())
    }

    /// Tear down everything [`setup`](Engine::setup) provisioned. May
    /// delete all stored grants.
    pub async fn teardown(&self) -> Result<()> {
        self.storage.teardown().await?;
        self.compute.teardown().await?;
        Ok(())
    }

    /// The five schemas generated from the definitions at start.
    pub async fn schemas(&self) -> Result<Schemas> {
        Ok(self.started().await?.schemas)
    }

    /// Validate and store a new grant, returning it with its assigned
    /// UUID.
    pub async fn enact(&self, new_grant: NewGrant) -> Result<Grant> {
        let state = self.started().await?;
        let payload = serde_json::to_value(&new_grant).unwrap_or(Value::Null);
        let report = validate_grants(
            std::slice::from_ref(&payload),
            &state.schemas.grant,
            &state.declared_actions,
        );
        if !report.valid {
            return Err(SpecError::Grant {
                message: "Error when validating the new grant.".into(),
                errors: report.errors,
            }
            .into());
        }
        let grant = self.storage.enact(new_grant).await?;
        debug!(grant_uuid = %grant.grant_uuid, effect = %grant.effect, "grant enacted");
        Ok(grant)
    }

    /// Delete a grant by UUID.
    pub async fn repeal(&self, grant_uuid: uuid::Uuid) -> Result<()> {
        self.started().await?;
        self.storage.repeal(grant_uuid).await?;
        debug!(%grant_uuid, "grant repealed");
        Ok(())
    }

    /// Fetch a grant by UUID.
    pub async fn get_grant(&self, grant_uuid: uuid::Uuid) -> Result<Grant> {
        self.started().await?;
        Ok(self.storage.get_grant(grant_uuid).await?)
    }

    /// Get one page of grants matching the filters.
    ///
    /// Pass the previous response's `next_page_ref` to continue;
    /// pagination is complete when it is `None`.
    pub async fn get_grants_page(
        &self,
        effect: Option<Effect>,
        action: Option<&str>,
        page_ref: Option<&str>,
        grants_page_size: Option<usize>,
    ) -> Result<GrantsPage> {
        self.started().await?;
        Ok(self
            .storage
            .get_grants_page(
                effect,
                action,
                page_ref,
                grants_page_size.unwrap_or(self.config.grants_page_size),
            )
            .await?)
    }

    /// Get one page of page references for parallel pagination.
    pub async fn get_grant_page_refs_page(
        &self,
        effect: Option<Effect>,
        action: Option<&str>,
        page_ref: Option<&str>,
        grants_page_size: Option<usize>,
        refs_page_size: Option<usize>,
    ) -> Result<PageRefsPage> {
        self.started().await?;
        Ok(self
            .storage
            .get_grant_page_refs_page(
                effect,
                action,
                page_ref,
                grants_page_size.unwrap_or(self.config.grants_page_size),
                refs_page_size.unwrap_or(self.config.refs_page_size),
            )
            .await?)
    }

    /// Process one slab of grants applicable to the request.
    ///
    /// Iterate by passing the returned `next_page_ref` back until it is
    /// `None`. A critical evaluation failure aborts with the matching
    /// specification error.
    pub async fn audit_page(
        &self,
        request: &Request,
        page_ref: Option<&str>,
        grants_page_size: Option<usize>,
        parallel_paging: Option<bool>,
        refs_page_size: Option<usize>,
    ) -> Result<AuditPage> {
        let state = self.started().await?;
        self.check_request(&state, request)?;
        let page = self
            .compute
            .audit_page(
                request,
                page_ref,
                grants_page_size.unwrap_or(self.config.grants_page_size),
                parallel_paging.unwrap_or(self.config.parallel_paging),
                refs_page_size.unwrap_or(self.config.refs_page_size),
            )
            .await?;
        if !page.completed {
            return Err(critical_error(page.errors));
        }
        Ok(page)
    }

    /// Decide the request: deny-overrides across all applicable grants.
    ///
    /// A critical evaluation failure aborts with the matching
    /// specification error.
    pub async fn authorize(
        &self,
        request: &Request,
        grants_page_size: Option<usize>,
        parallel_paging: Option<bool>,
        refs_page_size: Option<usize>,
    ) -> Result<AuthorizeResponse> {
        let state = self.started().await?;
        self.check_request(&state, request)?;
        let response = self
            .compute
            .authorize(
                request,
                grants_page_size.unwrap_or(self.config.grants_page_size),
                parallel_paging.unwrap_or(self.config.parallel_paging),
                refs_page_size.unwrap_or(self.config.refs_page_size),
            )
            .await?;
        if !response.completed {
            return Err(critical_error(response.errors));
        }
        debug!(authorized = response.authorized, "request decided");
        Ok(response)
    }

    fn check_request(&self, state: &StartedState, request: &Request) -> Result<()> {
        let report = validate_request(
            request,
            &state.schemas.request,
            &self.identity_defs,
            &self.resource_defs,
        );
        if !report.valid {
            return Err(SpecError::Request {
                message: "Error when validating the request.".into(),
                errors: report.errors,
            }
            .into());
        }
        Ok(())
    }
}

/// Map an aborted workflow's error bag onto the specification error that
/// caused it.
fn critical_error(errors: ErrorBag) -> Error {
    let message = errors
        .first_critical_message()
        .unwrap_or("A critical error has occurred.")
        .to_string();
    if errors.context.iter().any(|e| e.critical) {
        SpecError::Context { message, errors }.into()
    } else {
        SpecError::Jmespath { message, errors }.into()
    }
}
