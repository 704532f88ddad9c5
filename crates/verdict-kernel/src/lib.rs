#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-kernel** – Pure grant-matching kernel.
//!
//! Evaluates one grant against one request payload and classifies failures
//! by the validation-policy tags carried on the grant and the request. The
//! kernel is deterministic given its inputs and performs no I/O; paging,
//! worker fan-out and cancellation live in the compute layer.
//!
//! The query language is opaque to the kernel: callers supply a [`SearchFn`]
//! and the kernel only inspects the returned JSON value. A JMESPath-backed
//! implementation is bundled in [`search`].

use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::{json, Value};

use verdict_types::{
    ContextError, ContextValidation, ErrorBag, Grant, JmespathError, QueryValidation, Request,
};

pub mod search;

pub use search::{jmespath_search, SearchError};

/// Query evaluation function: `search(expr, data) -> value`.
///
/// `data` is the JSON object `{"request": <request>, "grant": <grant>}`.
pub type SearchFn = Arc<dyn Fn(&str, &Value) -> Result<Value, SearchError> + Send + Sync>;

//─────────────────────────────
//  Evaluation results
//─────────────────────────────

/// Which kind of failure aborted an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Critical context validation failure.
    Context,
    /// Critical query evaluation failure.
    Jmespath,
}

/// A critical failure, with the grant whose evaluation caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// What kind of failure occurred.
    pub kind: FaultKind,
    /// The grant under evaluation when the failure occurred.
    pub grant: Grant,
}

/// Result of evaluating a single grant against a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// True when the grant's action filter admits the request and the query
    /// returned the grant's expected truth value.
    pub applicable: bool,
    /// Non-critical (and, on fault, critical) failures recorded during the
    /// evaluation.
    pub errors: ErrorBag,
    /// Set when a critical failure occurred; the operation must abort.
    pub fault: Option<FaultKind>,
}

/// Result of evaluating a slice of grants against a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageOutcome {
    /// Applicable grants, in evaluation order.
    pub matched: Vec<Grant>,
    /// Failures accumulated across the slice.
    pub errors: ErrorBag,
    /// Set when a critical failure aborted the slice.
    pub fault: Option<Fault>,
    /// Set when evaluation stopped early due to cooperative cancellation.
    /// Never set by the kernel's own helpers.
    pub cancelled: bool,
}

//─────────────────────────────
//  Policy resolution
//─────────────────────────────

/// Effective query failure policy: the stricter of the request-level and
/// grant-level tags.
pub fn effective_query_validation(request: &Request, grant: &Grant) -> QueryValidation {
    request.query_validation.max(grant.query_validation)
}

/// Effective context validation policy: the request-level tag, unless it is
/// `grant`, in which case the grant's own tag governs.
pub fn effective_context_validation(request: &Request, grant: &Grant) -> ContextValidation {
    match request.context_validation {
        ContextValidation::Grant => grant.context_validation,
        other => other,
    }
}

//─────────────────────────────
//  Single-grant evaluation
//─────────────────────────────

/// Evaluate one grant against one request.
///
/// 1. If the grant's action filter does not admit the request action the
///    grant is not applicable.
/// 2. The request context is validated against the grant's context schema
///    per the effective context policy: `none` skips validation, `grant`
///    records a non-critical failure and makes the grant non-applicable,
///    `error` makes the failure critical.
/// 3. The query runs against `{"request": .., "grant": ..}`. Failures are
///    classified per the effective query policy: `error` is critical,
///    anything else records a non-critical failure.
/// 4. The grant is applicable iff the query returned a boolean equal to
///    `grant.equality`. Any other value is non-applicable.
pub fn evaluate_grant(request: &Request, grant: &Grant, search: &SearchFn) -> Evaluation {
    let mut eval = Evaluation::default();

    if !grant.covers_action(&request.action) {
        return eval;
    }

    let context_policy = effective_context_validation(request, grant);
    if context_policy != ContextValidation::None {
        if let Err(message) = validate_context(&grant.context_schema, &request.context) {
            let critical = context_policy == ContextValidation::Error;
            eval.errors.context.push(ContextError {
                message,
                critical,
                grant: grant.clone(),
            });
            if critical {
                eval.fault = Some(FaultKind::Context);
            }
            return eval;
        }
    }

    match query_data(request, grant).and_then(|data| search(&grant.query, &data)) {
        Ok(value) => {
            eval.applicable = matches!(value, Value::Bool(b) if b == grant.equality);
        }
        Err(e) => {
            let critical = effective_query_validation(request, grant) == QueryValidation::Error;
            eval.errors.jmespath.push(JmespathError {
                message: e.to_string(),
                critical,
                grant: grant.clone(),
            });
            if critical {
                eval.fault = Some(FaultKind::Jmespath);
            }
        }
    }

    eval
}

fn validate_context(
    context_schema: &Value,
    context: &serde_json::Map<String, Value>,
) -> Result<(), String> {
    let validator = JSONSchema::compile(context_schema)
        .map_err(|e| format!("The grant context schema is not a valid JSON Schema: {e}"))?;
    let context_value = Value::Object(context.clone());
    let result = match validator.validate(&context_value) {
        Ok(()) => Ok(()),
        Err(errors) => {
            let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
            Err(messages.join(", "))
        }
    };
    result
}

fn query_data(request: &Request, grant: &Grant) -> Result<Value, SearchError> {
    let request_value = serde_json::to_value(request).map_err(|e| SearchError::new(e.to_string()))?;
    let grant_value = serde_json::to_value(grant).map_err(|e| SearchError::new(e.to_string()))?;
    Ok(json!({"request": request_value, "grant": grant_value}))
}

//─────────────────────────────
//  Page-level helpers
//─────────────────────────────

/// Evaluate every grant in the slice, collecting all applicable grants.
///
/// Stops at the first critical failure. Used by the audit workflow.
pub fn collect_matches(request: &Request, grants: &[Grant], search: &SearchFn) -> PageOutcome {
    evaluate_slice(request, grants, search, false)
}

/// Evaluate grants in order until one is applicable.
///
/// Stops at the first applicable grant or the first critical failure. Used
/// by the authorize workflow, where the first match decides the phase.
pub fn find_match(request: &Request, grants: &[Grant], search: &SearchFn) -> PageOutcome {
    evaluate_slice(request, grants, search, true)
}

fn evaluate_slice(
    request: &Request,
    grants: &[Grant],
    search: &SearchFn,
    stop_on_match: bool,
) -> PageOutcome {
    let mut outcome = PageOutcome::default();
    for grant in grants {
        let eval = evaluate_grant(request, grant, search);
        let fault = eval.fault;
        outcome.errors.merge(eval.errors);
        if let Some(kind) = fault {
            outcome.fault = Some(Fault {
                kind,
                grant: grant.clone(),
            });
            return outcome;
        }
        if eval.applicable {
            outcome.matched.push(grant.clone());
            if stop_on_match {
                return outcome;
            }
        }
    }
    outcome
}
