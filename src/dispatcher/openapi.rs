//! OpenAPI 3 document generation from the action registry (spec §4.7),
//! plus a "lite" variant capped at 30 operations for agent runtimes with
//! a tight tool-definition budget.

use serde_json::{json, Value};

use super::{ActionRegistry, ParamKind};

const LITE_OPERATION_CAP: usize = 30;

fn param_schema(kind: ParamKind) -> Value {
    match kind {
        ParamKind::String => json!({"type": "string"}),
        ParamKind::Number => json!({"type": "number"}),
        ParamKind::Bool => json!({"type": "boolean"}),
        ParamKind::Object => json!({"type": "object"}),
    }
}

fn action_schema(registry: &ActionRegistry, name: &str) -> Value {
    let spec = registry.get(name).expect("action listed in registry");
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for param in &spec.params {
        properties.insert(param.name.to_string(), param_schema(param.kind));
        if param.required {
            required.push(Value::String(param.name.to_string()));
        }
    }

    json!({
        "type": "object",
        "description": spec.description,
        "properties": {
            "action": { "const": spec.name },
            "params": {
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": false,
            }
        },
        "required": ["action", "params"],
    })
}

/// Build the full OpenAPI document. When `lite` is true, only the first
/// `LITE_OPERATION_CAP` actions (by sorted name) are included.
pub fn generate(registry: &ActionRegistry, lite: bool) -> Value {
    let mut names = registry.sorted_names();
    if lite {
        names.truncate(LITE_OPERATION_CAP);
    }

    let mut schemas = serde_json::Map::new();
    let mut paths = serde_json::Map::new();
    for name in &names {
        schemas.insert(name.to_string(), action_schema(registry, name));
        paths.insert(
            format!("/api/agent#{name}"),
            json!({
                "post": {
                    "operationId": name,
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": { "$ref": format!("#/components/schemas/{name}") }
                            }
                        }
                    },
                    "responses": {
                        "200": { "description": "action result" },
                        "400": { "description": "validation error" },
                        "429": { "description": "rate limited" },
                    }
                }
            }),
        );
    }

    json!({
        "openapi": "3.0.3",
        "info": {
            "title": if lite { "Trading Bridge Agent API (lite)" } else { "Trading Bridge Agent API" },
            "version": "1.0.0",
        },
        "paths": paths,
        "components": { "schemas": schemas },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::actions::register_default_actions;

    #[test]
    fn full_document_has_one_schema_per_action() {
        let mut registry = ActionRegistry::new();
        register_default_actions(&mut registry);
        let doc = generate(&registry, false);
        let schema_count = doc["components"]["schemas"].as_object().unwrap().len();
        assert_eq!(schema_count, registry.sorted_names().len());
    }

    #[test]
    fn lite_document_is_capped() {
        let mut registry = ActionRegistry::new();
        register_default_actions(&mut registry);
        let doc = generate(&registry, true);
        let schema_count = doc["components"]["schemas"].as_object().unwrap().len();
        assert!(schema_count <= LITE_OPERATION_CAP);
    }

    #[test]
    fn get_status_schema_has_no_required_params() {
        let mut registry = ActionRegistry::new();
        register_default_actions(&mut registry);
        let doc = generate(&registry, false);
        let required = doc["components"]["schemas"]["get_status"]["properties"]["params"]["required"]
            .as_array()
            .unwrap();
        assert!(required.is_empty());
    }
}
