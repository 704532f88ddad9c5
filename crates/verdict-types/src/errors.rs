//! Structured error buckets attached to validation reports, responses, and
//! specification errors.
//!
//! Every entry carries `critical`: non-critical entries are accumulated and
//! attached to the response while the offending grant is treated as
//! non-applicable; a critical entry invalidates the operation outcome.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Grant;

/// Which kind of definition an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    /// An identity definition.
    Identity,
    /// A resource definition.
    Resource,
}

/// Failure while validating request context against a grant's context
/// schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextError {
    /// What went wrong.
    pub message: String,
    /// Whether the failure invalidates the operation outcome.
    pub critical: bool,
    /// The grant whose context schema rejected the request context.
    pub grant: Grant,
}

/// Failure while validating an identity or resource definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionError {
    /// What went wrong.
    pub message: String,
    /// Whether the failure invalidates the operation outcome.
    pub critical: bool,
    /// Which kind of definition is at fault.
    pub definition_type: DefinitionKind,
    /// The offending definition, as submitted.
    pub definition: Value,
}

/// Failure while validating a grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantError {
    /// What went wrong.
    pub message: String,
    /// Whether the failure invalidates the operation outcome.
    pub critical: bool,
    /// The offending grant payload, as submitted.
    pub grant: Value,
}

/// Failure while evaluating a grant's query expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JmespathError {
    /// What went wrong.
    pub message: String,
    /// Whether the failure invalidates the operation outcome.
    pub critical: bool,
    /// The grant whose query failed.
    pub grant: Grant,
}

/// Failure while validating a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestError {
    /// What went wrong.
    pub message: String,
    /// Whether the failure invalidates the operation outcome.
    pub critical: bool,
}

/// The five error buckets attached to every workflow response and
/// specification error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorBag {
    /// Context validation failures.
    pub context: Vec<ContextError>,
    /// Definition validation failures.
    pub definition: Vec<DefinitionError>,
    /// Grant validation failures.
    pub grant: Vec<GrantError>,
    /// Query evaluation failures.
    pub jmespath: Vec<JmespathError>,
    /// Request validation failures.
    pub request: Vec<RequestError>,
}

impl ErrorBag {
    /// True when no bucket holds any entry.
    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.definition.is_empty()
            && self.grant.is_empty()
            && self.jmespath.is_empty()
            && self.request.is_empty()
    }

    /// True when any bucket holds a critical entry.
    pub fn has_critical(&self) -> bool {
        self.context.iter().any(|e| e.critical)
            || self.definition.iter().any(|e| e.critical)
            || self.grant.iter().any(|e| e.critical)
            || self.jmespath.iter().any(|e| e.critical)
            || self.request.iter().any(|e| e.critical)
    }

    /// Drain `other` into `self`, preserving per-bucket order.
    pub fn merge(&mut self, other: ErrorBag) {
        self.context.extend(other.context);
        self.definition.extend(other.definition);
        self.grant.extend(other.grant);
        self.jmespath.extend(other.jmespath);
        self.request.extend(other.request);
    }

    /// The message of the first critical entry, bucket order: context,
    /// definition, grant, jmespath, request.
    pub fn first_critical_message(&self) -> Option<&str> {
        self.context
            .iter()
            .find(|e| e.critical)
            .map(|e| e.message.as_str())
            .or_else(|| {
                self.definition
                    .iter()
                    .find(|e| e.critical)
                    .map(|e| e.message.as_str())
            })
            .or_else(|| {
                self.grant
                    .iter()
                    .find(|e| e.critical)
                    .map(|e| e.message.as_str())
            })
            .or_else(|| {
                self.jmespath
                    .iter()
                    .find(|e| e.critical)
                    .map(|e| e.message.as_str())
            })
            .or_else(|| {
                self.request
                    .iter()
                    .find(|e| e.critical)
                    .map(|e| e.message.as_str())
            })
    }
}
