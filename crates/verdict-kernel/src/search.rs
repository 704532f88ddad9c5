//! The bundled JMESPath implementation of the query-language boundary.
//!
//! The engine only ever sees a [`SearchFn`](crate::SearchFn); deployments
//! with a different expression engine can supply their own function with the
//! same shape.

use std::sync::Arc;

use serde_json::Value;

use crate::SearchFn;

/// Failure raised by a search function.
///
/// Compile errors, unknown functions and runtime evaluation failures are
/// all folded into this one shape; the kernel classifies them by the
/// validation-policy tags, not by cause.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("{message}")]
pub struct SearchError {
    /// What the expression engine reported.
    pub message: String,
}

impl SearchError {
    /// Build a search error from any displayable source.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A [`SearchFn`] backed by the `jmespath` crate.
///
/// Each call compiles the expression and runs it over the supplied data;
/// grants carry arbitrary expressions so there is no compilation cache to
/// share safely across requests.
pub fn jmespath_search() -> SearchFn {
    Arc::new(|query: &str, data: &Value| {
        let expr = jmespath::compile(query).map_err(|e| SearchError::new(e.to_string()))?;
        let json = serde_json::to_string(data).map_err(|e| SearchError::new(e.to_string()))?;
        let payload =
            jmespath::Variable::from_json(&json).map_err(|e| SearchError::new(e.to_string()))?;
        let found = expr
            .search(payload)
            .map_err(|e| SearchError::new(e.to_string()))?;
        serde_json::to_value(found.as_ref()).map_err(|e| SearchError::new(e.to_string()))
    })
}
