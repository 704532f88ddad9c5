#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-types** – Shared primitive data structures for Verdict.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the declarative data model (definitions, grants, requests),
//! the response and page types, the module locality matrix, and the two-tier
//! error taxonomy shared across the workspace.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod errors;

pub use errors::{
    ContextError, DefinitionError, DefinitionKind, ErrorBag, GrantError, JmespathError,
    RequestError,
};

/// Crate result helper using the umbrella [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

//─────────────────────────────
//  Definitions
//─────────────────────────────

/// Declares a category of caller (User, Service, Role, ...).
///
/// `schema` is a JSON Schema that every identity object of this type in a
/// request must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityDefinition {
    /// Unique name for this identity type.
    pub identity_type: String,
    /// JSON Schema for identity objects of this type.
    pub schema: Value,
}

/// Declares a resource type, the actions that belong to it, and its place in
/// the (opaque) resource hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Unique name for this resource type.
    pub resource_type: String,
    /// Actions declared for this resource. Action strings must be unique
    /// across the union of all resource definitions.
    pub actions: Vec<String>,
    /// JSON Schema for resource objects of this type.
    pub schema: Value,
    /// Resource types that are parents of this one.
    pub parent_types: Vec<String>,
    /// Resource types that are children of this one.
    pub child_types: Vec<String>,
}

//─────────────────────────────
//  Grants
//─────────────────────────────

/// Whether an applicable grant allows or denies the request.
///
/// Composition is deny-overrides: any applicable deny grant forbids the
/// request regardless of allow grants; with no applicable grant at all the
/// request is implicitly denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// An applicable grant authorizes the request (unless a deny matches).
    Allow,
    /// An applicable grant forbids the request.
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Allow => f.write_str("allow"),
            Effect::Deny => f.write_str("deny"),
        }
    }
}

/// How query evaluation failures are treated.
///
/// Variants are ordered by strictness; the kernel resolves the effective
/// policy for a grant evaluation as the stricter of the request-level and
/// grant-level tags.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum QueryValidation {
    /// Record the failure as a non-critical error; the grant is simply not
    /// applicable.
    #[default]
    None,
    /// Reserved. Currently behaves exactly like `None`.
    Validate,
    /// The failure is critical and aborts the operation.
    Error,
}

/// How request-context validation failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextValidation {
    /// Skip context validation entirely.
    None,
    /// On the request: defer to the grant's own tag. On a grant: record a
    /// non-critical error and treat the grant as not applicable.
    #[default]
    Grant,
    /// The failure is critical and aborts the operation.
    Error,
}

/// A grant as submitted for enactment, before the engine assigns its UUID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGrant {
    /// Short display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Caller-owned labels.
    pub tags: BTreeMap<String, String>,
    /// Allow or deny.
    pub effect: Effect,
    /// Actions this grant applies to. Empty matches every action.
    pub actions: Vec<String>,
    /// Predicate expression, evaluated against
    /// `{"request": <request>, "grant": <grant>}`.
    pub query: String,
    /// Grant-level query failure policy.
    pub query_validation: QueryValidation,
    /// Expected truth value of the query result. A non-boolean result makes
    /// the grant non-applicable.
    pub equality: bool,
    /// Opaque payload carried for the caller and exposed to the query.
    pub data: Value,
    /// JSON Schema that `request.context` is validated against.
    pub context_schema: Value,
    /// Grant-level context failure policy.
    pub context_validation: ContextValidation,
}

impl NewGrant {
    /// Promote this payload into a stored [`Grant`] with the given UUID.
    pub fn into_grant(self, grant_uuid: Uuid) -> Grant {
        Grant {
            grant_uuid,
            name: self.name,
            description: self.description,
            tags: self.tags,
            effect: self.effect,
            actions: self.actions,
            query: self.query,
            query_validation: self.query_validation,
            equality: self.equality,
            data: self.data,
            context_schema: self.context_schema,
            context_validation: self.context_validation,
        }
    }
}

/// An enacted authorization rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    /// Engine-assigned unique identifier.
    pub grant_uuid: Uuid,
    /// Short display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Caller-owned labels.
    pub tags: BTreeMap<String, String>,
    /// Allow or deny.
    pub effect: Effect,
    /// Actions this grant applies to. Empty matches every action.
    pub actions: Vec<String>,
    /// Predicate expression, evaluated against
    /// `{"request": <request>, "grant": <grant>}`.
    pub query: String,
    /// Grant-level query failure policy.
    pub query_validation: QueryValidation,
    /// Expected truth value of the query result.
    pub equality: bool,
    /// Opaque payload carried for the caller and exposed to the query.
    pub data: Value,
    /// JSON Schema that `request.context` is validated against.
    pub context_schema: Value,
    /// Grant-level context failure policy.
    pub context_validation: ContextValidation,
}

impl Grant {
    /// True when this grant's action filter admits `action`.
    ///
    /// An empty `actions` list is the wildcard and admits everything.
    pub fn covers_action(&self, action: &str) -> bool {
        self.actions.is_empty() || self.actions.iter().any(|a| a == action)
    }
}

//─────────────────────────────
//  Requests
//─────────────────────────────

/// An authorization request: who is calling, what they are acting on, and
/// the ambient context the grant predicates may inspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller identities, keyed by identity type. Each object must satisfy
    /// the declared schema for its type.
    pub identities: HashMap<String, Vec<Value>>,
    /// Declared resource type the request targets.
    pub resource_type: String,
    /// Action being performed. Must be declared for `resource_type`.
    pub action: String,
    /// The target resource object.
    pub resource: Value,
    /// Parent resource objects, keyed by declared parent type. Opaque to
    /// evaluation.
    pub parents: HashMap<String, Vec<Value>>,
    /// Child resource objects, keyed by declared child type. Opaque to
    /// evaluation.
    pub children: HashMap<String, Vec<Value>>,
    /// Ambient request context, validated per-grant against each grant's
    /// `context_schema`.
    pub context: serde_json::Map<String, Value>,
    /// Request-level query failure policy.
    pub query_validation: QueryValidation,
    /// Request-level context failure policy.
    pub context_validation: ContextValidation,
}

//─────────────────────────────
//  Pages and responses
//─────────────────────────────

/// One page of grants from a filtered storage scan.
///
/// `next_page_ref` is an opaque storage-issued cursor; `None` terminates the
/// scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantsPage {
    /// Grants in this page, in scan order.
    pub grants: Vec<Grant>,
    /// Cursor for the next page, or `None` at the end of the scan.
    pub next_page_ref: Option<String>,
}

/// One page of page references for parallel pagination.
///
/// Each entry in `page_refs` is an independent cursor that can be handed to
/// a worker for a concurrent `get_grants_page` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRefsPage {
    /// Independent page cursors, in scan order.
    pub page_refs: Vec<String>,
    /// Cursor for the next page of references, or `None` at the end.
    pub next_page_ref: Option<String>,
}

/// Result of processing one slab of grants against a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditPage {
    /// False iff a critical error aborted the slab.
    pub completed: bool,
    /// Grants in the slab that are applicable to the request.
    pub grants: Vec<Grant>,
    /// Non-critical (and, on abort, critical) failures accumulated while
    /// evaluating the slab.
    pub errors: ErrorBag,
    /// Cursor for the next slab, or `None` when the scan is exhausted.
    pub next_page_ref: Option<String>,
}

/// Outcome of the authorize workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    /// True iff the request is authorized.
    pub authorized: bool,
    /// False iff a critical error aborted the decision.
    pub completed: bool,
    /// The grant responsible for the decision, if any.
    pub grant: Option<Grant>,
    /// Human-readable explanation of the decision.
    pub message: String,
    /// Non-critical (and, on abort, critical) failures accumulated during
    /// the scan.
    pub errors: ErrorBag,
}

//─────────────────────────────
//  Module locality
//─────────────────────────────

/// Deployment scope of a compute or storage module.
///
/// The engine rejects pairings where the compute module could not actually
/// reach the storage module: an in-process compute can use any storage, but
/// a compute running outside the engine's process can only use storage that
/// is reachable from where the compute runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleLocality {
    /// Confined to the engine's own process.
    Process,
    /// Spans processes on the machine running the engine.
    System,
    /// Reachable over the network, external to the engine's machine.
    Network,
}

impl ModuleLocality {
    /// True when a compute module with this locality can use a storage
    /// module with locality `storage`.
    pub fn accepts(self, storage: ModuleLocality) -> bool {
        match self {
            ModuleLocality::Process => true,
            ModuleLocality::System => {
                matches!(storage, ModuleLocality::System | ModuleLocality::Network)
            }
            ModuleLocality::Network => matches!(storage, ModuleLocality::Network),
        }
    }

    /// The storage localities compatible with a compute module of this
    /// locality.
    pub fn compatible_storage(self) -> &'static [ModuleLocality] {
        match self {
            ModuleLocality::Process => &[
                ModuleLocality::Process,
                ModuleLocality::System,
                ModuleLocality::Network,
            ],
            ModuleLocality::System => &[ModuleLocality::System, ModuleLocality::Network],
            ModuleLocality::Network => &[ModuleLocality::Network],
        }
    }
}

impl fmt::Display for ModuleLocality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleLocality::Process => f.write_str("PROCESS"),
            ModuleLocality::System => f.write_str("SYSTEM"),
            ModuleLocality::Network => f.write_str("NETWORK"),
        }
    }
}

//─────────────────────────────
//  Storage latches
//─────────────────────────────

/// A cross-process one-shot flag owned by the storage module.
///
/// Created before a scan, optionally set by any worker to abort its peers,
/// and deleted after the scan. Latches that leak (worker crash) are garbage
/// collected by `cleanup_latches`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageLatch {
    /// Storage-assigned unique identifier.
    pub uuid: Uuid,
    /// Whether the latch has been set. One-shot: never cleared.
    pub set: bool,
    /// Creation time, used by zombie-latch cleanup.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Error taxonomy
//─────────────────────────────

/// Errors defined by the authorization contract.
///
/// Each variant carries the five-bucket [`ErrorBag`] accumulated up to the
/// abort, including the critical entry that caused it.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SpecError {
    /// Critical failure while validating request context against a grant's
    /// context schema.
    #[error("{message}")]
    Context {
        /// Explanation of the abort.
        message: String,
        /// Failures accumulated up to the abort.
        errors: ErrorBag,
    },
    /// The identity or resource definitions are invalid.
    #[error("{message}")]
    Definition {
        /// Explanation of the abort.
        message: String,
        /// Failures accumulated up to the abort.
        errors: ErrorBag,
    },
    /// A grant failed validation.
    #[error("{message}")]
    Grant {
        /// Explanation of the abort.
        message: String,
        /// Failures accumulated up to the abort.
        errors: ErrorBag,
    },
    /// Critical failure while evaluating a grant's query expression.
    #[error("{message}")]
    Jmespath {
        /// Explanation of the abort.
        message: String,
        /// Failures accumulated up to the abort.
        errors: ErrorBag,
    },
    /// The request failed validation.
    #[error("{message}")]
    Request {
        /// Explanation of the abort.
        message: String,
        /// Failures accumulated up to the abort.
        errors: ErrorBag,
    },
}

impl SpecError {
    /// The error bag carried by any variant.
    pub fn errors(&self) -> &ErrorBag {
        match self {
            SpecError::Context { errors, .. }
            | SpecError::Definition { errors, .. }
            | SpecError::Grant { errors, .. }
            | SpecError::Jmespath { errors, .. }
            | SpecError::Request { errors, .. } => errors,
        }
    }
}

/// Errors from the library mechanics rather than the authorization
/// contract. These are raised directly and never end up in an error bucket.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SdkError {
    /// Lifecycle failure: initialization failed, or an operation was invoked
    /// outside the `Started` state.
    #[error("engine lifecycle error: {0}")]
    Start(String),
    /// The configured storage module cannot be reached from the configured
    /// compute module.
    #[error(
        "the storage locality '{storage}' is not compatible with the compute locality \
         '{compute}'"
    )]
    LocalityIncompatibility {
        /// Locality published by the compute module.
        compute: ModuleLocality,
        /// Locality published by the storage module.
        storage: ModuleLocality,
    },
    /// No grant with the given UUID exists in storage.
    #[error("grant with UUID '{0}' was not found")]
    GrantNotFound(Uuid),
    /// No storage latch with the given UUID exists.
    #[error("storage latch with UUID '{0}' was not found")]
    LatchNotFound(Uuid),
    /// The module does not implement the requested operation.
    #[error("{0}")]
    NotImplemented(String),
    /// Parallel pagination was requested but the storage module does not
    /// support it.
    #[error("this storage module does not support parallel pagination")]
    ParallelPaginationNotSupported,
    /// A page reference was not produced by this store, or was produced
    /// under different filters.
    #[error("invalid page reference: {0}")]
    PageReference(String),
    /// A worker task or its dispatch queue failed.
    #[error("compute worker failure: {0}")]
    Worker(String),
}

/// Umbrella error for public engine operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum Error {
    /// An error defined by the authorization contract.
    #[error(transparent)]
    Spec(#[from] SpecError),
    /// A library-mechanics error.
    #[error(transparent)]
    Sdk(#[from] SdkError),
}
