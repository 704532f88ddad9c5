#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-schema** – Derived JSON Schemas and input validators.
//!
//! From a set of identity and resource definitions this crate builds the
//! five derived schemas (`grant`, `errors`, `request`, `audit`,
//! `authorize`) and provides the three validators the engine dispatches to:
//! [`validate_definitions`], [`validate_grants`] and [`validate_request`].
//!
//! Validators never fail; they return a [`ValidationReport`] whose error
//! buckets the engine facade turns into the matching specification error.

use std::collections::{BTreeSet, HashSet};

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use verdict_types::{
    DefinitionError, DefinitionKind, ErrorBag, GrantError, IdentityDefinition, RequestError,
    Request, ResourceDefinition,
};

//─────────────────────────────
//  Validation report
//─────────────────────────────

/// Outcome of a validator: `valid` plus the populated error buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True when no validation errors were found.
    pub valid: bool,
    /// The failures, all critical.
    pub errors: ErrorBag,
}

impl ValidationReport {
    fn from_bag(errors: ErrorBag) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

//─────────────────────────────
//  Base definition schemas
//─────────────────────────────

/// Schema that every identity definition must satisfy.
pub fn identity_definition_schema() -> Value {
    json!({
        "title": "Identity Definition",
        "description": "Defines a type of caller identity.",
        "type": "object",
        "additionalProperties": false,
        "required": ["identity_type", "schema"],
        "properties": {
            "identity_type": {
                "title": "Identity Type",
                "description": "A unique name for this identity type.",
                "type": "string",
                "pattern": "^[A-Za-z0-9_]*$",
                "minLength": 1,
                "maxLength": 256
            },
            "schema": {
                "$schema": "https://json-schema.org/draft/2020-12/schema"
            }
        }
    })
}

/// Schema that every resource definition must satisfy.
pub fn resource_definition_schema() -> Value {
    json!({
        "title": "Resource Definition",
        "description": "Defines a type of resource and its actions.",
        "type": "object",
        "additionalProperties": false,
        "required": ["resource_type", "actions", "schema", "parent_types", "child_types"],
        "properties": {
            "resource_type": {
                "title": "Resource Type",
                "description": "A unique name for this resource type.",
                "type": "string",
                "pattern": "^[A-Za-z0-9_]*$",
                "minLength": 1,
                "maxLength": 256
            },
            "actions": {
                "type": "array",
                "uniqueItems": true,
                "items": {
                    "title": "Resource Action",
                    "description": "Unique name for a resource action. The 'ResourceType:Action' pattern is common.",
                    "type": "string",
                    "pattern": "^[A-Za-z0-9_.:-]*$",
                    "minLength": 1,
                    "maxLength": 512
                }
            },
            "schema": {
                "$schema": "https://json-schema.org/draft/2020-12/schema"
            },
            "parent_types": {
                "type": "array",
                "uniqueItems": true,
                "items": {"type": "string"},
                "description": "Resource types that are parents of this type."
            },
            "child_types": {
                "type": "array",
                "uniqueItems": true,
                "items": {"type": "string"},
                "description": "Resource types that are children of this type."
            }
        }
    })
}

//─────────────────────────────
//  Derived schemas
//─────────────────────────────

/// The five schemas derived from a set of definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schemas {
    /// Schema for grants, with the declared actions embedded as an enum.
    pub grant: Value,
    /// Schema for the five-bucket error object.
    pub errors: Value,
    /// Schema for requests, one branch per resource type.
    pub request: Value,
    /// Schema for the audit response.
    pub audit: Value,
    /// Schema for the authorize response.
    pub authorize: Value,
}

/// Build the five derived schemas from validated definitions.
pub fn generate_schemas(
    identity_defs: &[IdentityDefinition],
    resource_defs: &[ResourceDefinition],
) -> Schemas {
    let actions: BTreeSet<&str> = resource_defs
        .iter()
        .flat_map(|rd| rd.actions.iter().map(String::as_str))
        .collect();
    let actions: Vec<&str> = actions.into_iter().collect();

    let grant_schema = json!({
        "title": "Grant",
        "description": "An enacted authorization rule.",
        "type": "object",
        "additionalProperties": false,
        "required": [
            "name", "description", "tags", "effect", "actions", "query",
            "query_validation", "equality", "data", "context_schema",
            "context_validation"
        ],
        "properties": {
            "grant_uuid": {
                "type": "string",
                "description": "Engine-assigned grant identifier."
            },
            "name": {"type": "string"},
            "description": {"type": "string"},
            "tags": {
                "type": "object",
                "additionalProperties": {"type": "string"}
            },
            "effect": {
                "type": "string",
                "enum": ["allow", "deny"],
                "description": "Any applicable deny grant causes the request to not be authorized. With no applicable deny grants, an applicable allow grant authorizes the request. With no applicable grants at all the request is implicitly denied."
            },
            "actions": {
                "type": "array",
                "uniqueItems": true,
                "items": {
                    "type": "string",
                    "enum": actions
                },
                "description": "Actions this grant applies to, or empty to match every action."
            },
            "query": {
                "type": "string",
                "description": "Query to run on the authorization data: {\"grant\": <grant>, \"request\": <request>}"
            },
            "query_validation": {
                "type": "string",
                "title": "Grant-Level Query Validation Setting",
                "description": "How query failures are treated. 'none' and 'validate' record a non-critical error and make the grant non-applicable. 'error' flags the failure as critical, aborting the workflow.",
                "enum": ["none", "validate", "error"]
            },
            "equality": {
                "type": "boolean",
                "description": "Expected truth value of the query result. The grant is applicable when the query returns exactly this boolean."
            },
            "data": {
                "type": "object",
                "description": "Data made available at query time so it does not have to be embedded in the query."
            },
            "context_schema": {
                "$schema": "https://json-schema.org/draft/2020-12/schema"
            },
            "context_validation": {
                "type": "string",
                "title": "Grant-Level Context Validation Setting",
                "description": "How the request context is validated against the grant context schema. 'none' skips validation. 'grant' records a non-critical error and makes the grant non-applicable. 'error' flags the failure as critical, aborting the workflow.",
                "enum": ["none", "grant", "error"]
            }
        }
    });

    let errors_schema = json!({
        "title": "Workflow Errors",
        "description": "Errors returned from authorization workflows.",
        "type": "object",
        "additionalProperties": false,
        "required": ["context", "definition", "grant", "jmespath", "request"],
        "properties": {
            "context": {"type": "array"},
            "definition": {"type": "array"},
            "grant": {"type": "array"},
            "jmespath": {"type": "array"},
            "request": {"type": "array"}
        }
    });

    let mut request_schema = json!({
        "title": "Workflow Request",
        "description": "Request for an authorization workflow.",
        "anyOf": [],
        "$defs": {
            "identities": {
                "type": "object",
                "additionalProperties": false,
                "required": [],
                "properties": {}
            },
            "query_validation": {
                "type": "string",
                "enum": ["none", "validate", "error"]
            },
            "context": {
                "type": "object",
                "patternProperties": {
                    "^[a-zA-Z0-9_]{1,256}$": {}
                }
            },
            "context_validation": {
                "type": "string",
                "enum": ["none", "grant", "error"]
            }
        }
    });

    for id_def in identity_defs {
        if let Some(required) = request_schema["$defs"]["identities"]["required"].as_array_mut() {
            required.push(json!(id_def.identity_type));
        }
        request_schema["$defs"]["identities"]["properties"][&id_def.identity_type] = json!({
            "type": "array",
            "items": id_def.schema.clone()
        });
    }

    for r_def in resource_defs {
        let r_type = &r_def.resource_type;
        let rt_request_schema = json!({
            "title": format!("'{}' Resource Type Workflow Request", r_type),
            "description": format!("'{}' resource type request for an authorization workflow.", r_type),
            "type": "object",
            "additionalProperties": false,
            "required": [
                "identities", "resource_type", "action", "resource", "parents",
                "children", "query_validation", "context", "context_validation"
            ],
            "properties": {
                "identities": {"$ref": "#/$defs/identities"},
                "action": {
                    "type": "string",
                    "enum": r_def.actions.clone()
                },
                "resource_type": {"const": r_type},
                "resource": {"$ref": format!("#/$defs/{}", r_type)},
                "parents": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": r_def.parent_types.clone(),
                    "properties": r_def.parent_types.iter().map(|p_type| {
                        (p_type.clone(), json!({
                            "type": "array",
                            "items": {"$ref": format!("#/$defs/{}", p_type)}
                        }))
                    }).collect::<Map<String, Value>>()
                },
                "children": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": r_def.child_types.clone(),
                    "properties": r_def.child_types.iter().map(|c_type| {
                        (c_type.clone(), json!({
                            "type": "array",
                            "items": {"$ref": format!("#/$defs/{}", c_type)}
                        }))
                    }).collect::<Map<String, Value>>()
                },
                "query_validation": {"$ref": "#/$defs/query_validation"},
                "context": {"$ref": "#/$defs/context"},
                "context_validation": {"$ref": "#/$defs/context_validation"}
            }
        });

        request_schema["$defs"][r_type] = r_def.schema.clone();
        if let Some(any_of) = request_schema["anyOf"].as_array_mut() {
            any_of.push(rt_request_schema);
        }
    }

    let audit_schema = json!({
        "title": "Audit Response",
        "description": "Response for one slab of the audit workflow.",
        "type": "object",
        "additionalProperties": false,
        "required": ["completed", "grants", "errors", "next_page_ref"],
        "properties": {
            "completed": {
                "type": "boolean",
                "description": "The slab completed without a critical error."
            },
            "grants": {
                "type": "array",
                "items": grant_schema.clone(),
                "description": "Grants in the slab that are applicable to the request."
            },
            "errors": errors_schema.clone(),
            "next_page_ref": {
                "type": ["string", "null"],
                "description": "Cursor for the next slab, or null at the end of the scan."
            }
        }
    });

    let authorize_schema = json!({
        "title": "Authorize Response",
        "description": "Response for the authorize workflow.",
        "type": "object",
        "additionalProperties": false,
        "required": ["authorized", "completed", "grant", "message", "errors"],
        "properties": {
            "authorized": {
                "type": "boolean",
                "description": "true if the request is authorized."
            },
            "completed": {
                "type": "boolean",
                "description": "The workflow completed without a critical error."
            },
            "grant": {
                "description": "Grant responsible for the decision, if any.",
                "anyOf": [grant_schema.clone(), {"type": "null"}]
            },
            "message": {
                "type": "string",
                "description": "Details about why the request was or was not authorized."
            },
            "errors": errors_schema.clone()
        }
    });

    Schemas {
        grant: grant_schema,
        errors: errors_schema,
        request: request_schema,
        audit: audit_schema,
        authorize: authorize_schema,
    }
}

//─────────────────────────────
//  Validators
//─────────────────────────────

fn schema_error_messages(
    validator: &JSONSchema,
    instance: &Value,
) -> std::result::Result<(), String> {
    match validator.validate(instance) {
        Ok(()) => Ok(()),
        Err(errors) => {
            let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
            Err(messages.join(", "))
        }
    }
}

/// Validate identity and resource definitions.
///
/// Enforces: each definition satisfies its base schema, identity and
/// resource type names are unique, action strings are unique across the
/// union of all resource definitions, every parent/child type is a declared
/// resource type, and every embedded schema is itself a valid JSON Schema.
pub fn validate_definitions(
    identity_defs: &[IdentityDefinition],
    resource_defs: &[ResourceDefinition],
) -> ValidationReport {
    let mut bag = ErrorBag::default();

    let identity_schema = identity_definition_schema();
    let identity_validator = match JSONSchema::compile(&identity_schema) {
        Ok(v) => v,
        Err(e) => {
            bag.definition.push(DefinitionError {
                message: format!(
                    "The identity definition schema is not a valid JSON Schema: {e}"
                ),
                critical: true,
                definition_type: DefinitionKind::Identity,
                definition: Value::Null,
            });
            return ValidationReport::from_bag(bag);
        }
    };
    let resource_schema = resource_definition_schema();
    let resource_validator = match JSONSchema::compile(&resource_schema) {
        Ok(v) => v,
        Err(e) => {
            bag.definition.push(DefinitionError {
                message: format!(
                    "The resource definition schema is not a valid JSON Schema: {e}"
                ),
                critical: true,
                definition_type: DefinitionKind::Resource,
                definition: Value::Null,
            });
            return ValidationReport::from_bag(bag);
        }
    };

    let mut id_types: HashSet<&str> = HashSet::new();
    for id_def in identity_defs {
        let id_def_value = serde_json::to_value(id_def).unwrap_or(Value::Null);
        if let Err(message) = schema_error_messages(&identity_validator, &id_def_value) {
            bag.definition.push(DefinitionError {
                message: format!(
                    "The identity definition is not valid. Schema Error: {message}"
                ),
                critical: true,
                definition_type: DefinitionKind::Identity,
                definition: id_def_value,
            });
            continue;
        }
        if !id_types.insert(&id_def.identity_type) {
            bag.definition.push(DefinitionError {
                message: format!(
                    "Identity types must be unique. '{}' is present more than once.",
                    id_def.identity_type
                ),
                critical: true,
                definition_type: DefinitionKind::Identity,
                definition: id_def_value.clone(),
            });
        }
        if let Err(e) = JSONSchema::compile(&id_def.schema) {
            bag.definition.push(DefinitionError {
                message: format!(
                    "The schema of identity type '{}' is not a valid JSON Schema: {e}",
                    id_def.identity_type
                ),
                critical: true,
                definition_type: DefinitionKind::Identity,
                definition: id_def_value,
            });
        }
    }

    let mut r_types: HashSet<&str> = HashSet::new();
    let mut seen_actions: HashSet<&str> = HashSet::new();
    for r_def in resource_defs {
        let r_def_value = serde_json::to_value(r_def).unwrap_or(Value::Null);
        if let Err(message) = schema_error_messages(&resource_validator, &r_def_value) {
            bag.definition.push(DefinitionError {
                message: format!(
                    "The resource definition is not valid. Schema Error: {message}"
                ),
                critical: true,
                definition_type: DefinitionKind::Resource,
                definition: r_def_value,
            });
            continue;
        }
        if !r_types.insert(&r_def.resource_type) {
            bag.definition.push(DefinitionError {
                message: format!(
                    "Resource types must be unique. '{}' is present more than once.",
                    r_def.resource_type
                ),
                critical: true,
                definition_type: DefinitionKind::Resource,
                definition: r_def_value.clone(),
            });
        }
        for action in &r_def.actions {
            if !seen_actions.insert(action) {
                bag.definition.push(DefinitionError {
                    message: format!(
                        "Actions must be unique across all resource definitions. '{action}' is present more than once."
                    ),
                    critical: true,
                    definition_type: DefinitionKind::Resource,
                    definition: r_def_value.clone(),
                });
            }
        }
        if let Err(e) = JSONSchema::compile(&r_def.schema) {
            bag.definition.push(DefinitionError {
                message: format!(
                    "The schema of resource type '{}' is not a valid JSON Schema: {e}",
                    r_def.resource_type
                ),
                critical: true,
                definition_type: DefinitionKind::Resource,
                definition: r_def_value,
            });
        }
    }

    for r_def in resource_defs {
        for (relation, types) in [("Parent", &r_def.parent_types), ("Child", &r_def.child_types)]
        {
            for r_type in types {
                if !r_types.contains(r_type.as_str()) {
                    bag.definition.push(DefinitionError {
                        message: format!(
                            "{relation} type '{r_type}' does not have a corresponding resource definition."
                        ),
                        critical: true,
                        definition_type: DefinitionKind::Resource,
                        definition: serde_json::to_value(r_def).unwrap_or(Value::Null),
                    });
                }
            }
        }
    }

    ValidationReport::from_bag(bag)
}

/// Validate grant payloads against the generated grant schema, then check
/// that every listed action is a declared resource action.
///
/// `grants` are raw payloads so that both new grants (no UUID) and stored
/// grants can be validated.
pub fn validate_grants(
    grants: &[Value],
    grant_schema: &Value,
    declared_actions: &HashSet<String>,
) -> ValidationReport {
    let mut bag = ErrorBag::default();

    let validator = match JSONSchema::compile(grant_schema) {
        Ok(v) => v,
        Err(e) => {
            bag.grant.push(GrantError {
                message: format!("The grant schema is not a valid JSON Schema: {e}"),
                critical: true,
                grant: Value::Null,
            });
            return ValidationReport::from_bag(bag);
        }
    };

    for grant in grants {
        if let Err(message) = schema_error_messages(&validator, grant) {
            bag.grant.push(GrantError {
                message: format!("The grant is not valid. Schema Error: {message}"),
                critical: true,
                grant: grant.clone(),
            });
            continue;
        }
        if let Some(actions) = grant.get("actions").and_then(Value::as_array) {
            for action in actions.iter().filter_map(Value::as_str) {
                if !declared_actions.contains(action) {
                    bag.grant.push(GrantError {
                        message: format!(
                            "The grant action '{action}' does not have a corresponding resource definition action."
                        ),
                        critical: true,
                        grant: grant.clone(),
                    });
                }
            }
        }
        if let Some(context_schema) = grant.get("context_schema") {
            if let Err(e) = JSONSchema::compile(context_schema) {
                bag.grant.push(GrantError {
                    message: format!(
                        "The grant context schema is not a valid JSON Schema: {e}"
                    ),
                    critical: true,
                    grant: grant.clone(),
                });
            }
        }
    }

    ValidationReport::from_bag(bag)
}

/// Validate a request against the generated request schema, then check that
/// the action is declared for the resource type and that each identity
/// entry conforms to its declared identity schema.
pub fn validate_request(
    request: &Request,
    request_schema: &Value,
    identity_defs: &[IdentityDefinition],
    resource_defs: &[ResourceDefinition],
) -> ValidationReport {
    let mut bag = ErrorBag::default();

    let request_value = serde_json::to_value(request).unwrap_or(Value::Null);
    match JSONSchema::compile(request_schema) {
        Ok(validator) => {
            if let Err(message) = schema_error_messages(&validator, &request_value) {
                bag.request.push(RequestError {
                    message: format!(
                        "The request is not valid for the request schema: {message}"
                    ),
                    critical: true,
                });
            }
        }
        Err(e) => {
            bag.request.push(RequestError {
                message: format!("The request schema is not a valid JSON Schema: {e}"),
                critical: true,
            });
        }
    }

    match resource_defs
        .iter()
        .find(|rd| rd.resource_type == request.resource_type)
    {
        Some(r_def) => {
            if !r_def.actions.iter().any(|a| a == &request.action) {
                bag.request.push(RequestError {
                    message: format!(
                        "The action '{}' is not declared for resource type '{}'.",
                        request.action, request.resource_type
                    ),
                    critical: true,
                });
            }
        }
        None => {
            bag.request.push(RequestError {
                message: format!(
                    "The resource type '{}' does not have a corresponding resource definition.",
                    request.resource_type
                ),
                critical: true,
            });
        }
    }

    for (identity_type, objects) in &request.identities {
        let Some(id_def) = identity_defs
            .iter()
            .find(|d| &d.identity_type == identity_type)
        else {
            bag.request.push(RequestError {
                message: format!(
                    "The identity type '{identity_type}' does not have a corresponding identity definition."
                ),
                critical: true,
            });
            continue;
        };
        let validator = match JSONSchema::compile(&id_def.schema) {
            Ok(v) => v,
            Err(e) => {
                bag.request.push(RequestError {
                    message: format!(
                        "The schema of identity type '{identity_type}' is not a valid JSON Schema: {e}"
                    ),
                    critical: true,
                });
                continue;
            }
        };
        for object in objects {
            if let Err(message) = schema_error_messages(&validator, object) {
                bag.request.push(RequestError {
                    message: format!(
                        "An identity of type '{identity_type}' is not valid for its schema: {message}"
                    ),
                    critical: true,
                });
            }
        }
    }

    ValidationReport::from_bag(bag)
}
