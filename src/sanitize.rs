//! JSON-Schema sanitization for upstream tool declarations.
//!
//! The upstream accepts a restricted schema subset. This pass strips the
//! keywords it rejects, inlines local `$defs` pointers, and normalizes a few
//! shapes clients commonly get wrong. The transform is pure and idempotent:
//! sanitizing twice yields the same value.

use serde_json::{Map, Value};

/// `format` values the upstream accepts on string-typed fields.
const ALLOWED_FORMATS: &[&str] = &["enum", "date-time"];

const MAX_REF_DEPTH: usize = 16;

pub fn sanitize_schema(schema: &Value) -> Value {
    let defs = collect_defs(schema);
    let mut out = schema.clone();
    walk(&mut out, &defs, 0);
    out
}

/// Local definitions available for `$ref` inlining, keyed by name.
fn collect_defs(schema: &Value) -> Map<String, Value> {
    let mut defs = Map::new();
    if let Some(obj) = schema.as_object() {
        for key in ["$defs", "definitions"] {
            if let Some(Value::Object(table)) = obj.get(key) {
                for (name, def) in table {
                    defs.insert(name.clone(), def.clone());
                }
            }
        }
    }
    defs
}

fn walk(node: &mut Value, defs: &Map<String, Value>, depth: usize) {
    match node {
        Value::Object(_) => walk_object(node, defs, depth),
        Value::Array(arr) => {
            for item in arr {
                walk(item, defs, depth);
            }
        }
        _ => {}
    }
}

fn walk_object(node: &mut Value, defs: &Map<String, Value>, depth: usize) {
    // Inline a simple local pointer; external URIs are dropped entirely.
    if let Some(target) = node.get("$ref").and_then(|r| r.as_str()).map(String::from) {
        if let Some(name) = local_ref_name(&target) {
            if depth < MAX_REF_DEPTH {
                if let Some(resolved) = defs.get(name) {
                    *node = resolved.clone();
                    walk(node, defs, depth + 1);
                    return;
                }
            }
        }
        if let Some(obj) = node.as_object_mut() {
            obj.remove("$ref");
        }
    }

    let obj = match node.as_object_mut() {
        Some(o) => o,
        None => return,
    };

    obj.remove("$schema");
    obj.remove("$id");
    obj.remove("additionalProperties");
    obj.remove("$defs");
    obj.remove("definitions");

    // Boolean-form exclusive bounds (draft-4) are rejected; the numeric form
    // is kept as-is.
    for key in ["exclusiveMinimum", "exclusiveMaximum"] {
        if obj.get(key).map(|v| v.is_boolean()).unwrap_or(false) {
            obj.remove(key);
        }
    }

    if let Some(format) = obj.get("format").and_then(|v| v.as_str()) {
        if !ALLOWED_FORMATS.contains(&format) {
            obj.remove("format");
        }
    }

    // A type array collapses to its first non-null member; the null member
    // only signalled optionality, which `required` pruning handles below.
    if let Some(Value::Array(types)) = obj.get("type") {
        let first = types
            .iter()
            .find(|t| t.as_str() != Some("null"))
            .cloned()
            .unwrap_or(Value::String("string".to_string()));
        obj.insert("type".to_string(), first);
    }

    // Single-arm anyOf/oneOf collapse to the arm itself.
    for key in ["anyOf", "oneOf"] {
        let single = match obj.get(key) {
            Some(Value::Array(arms)) if arms.len() == 1 => Some(arms[0].clone()),
            _ => None,
        };
        if let Some(arm) = single {
            obj.remove(key);
            if let Value::Object(arm_obj) = arm {
                for (k, v) in arm_obj {
                    obj.entry(k).or_insert(v);
                }
            }
        }
    }

    // `properties` must be an object; anything else is replaced.
    if let Some(props) = obj.get("properties") {
        if !props.is_object() {
            obj.insert("properties".to_string(), Value::Object(Map::new()));
        }
    }

    // Fields whose type array admitted null are optional: drop them from
    // the parent's required list.
    prune_required_of_nullable(obj);

    for (_, v) in obj.iter_mut() {
        walk(v, defs, depth);
    }
}

fn local_ref_name(target: &str) -> Option<&str> {
    target
        .strip_prefix("#/$defs/")
        .or_else(|| target.strip_prefix("#/definitions/"))
}

fn prune_required_of_nullable(obj: &mut Map<String, Value>) {
    let nullable: Vec<String> = match obj.get("properties").and_then(|p| p.as_object()) {
        Some(props) => props
            .iter()
            .filter(|(_, schema)| {
                matches!(schema.get("type"), Some(Value::Array(types))
                    if types.iter().any(|t| t.as_str() == Some("null")))
            })
            .map(|(name, _)| name.clone())
            .collect(),
        None => return,
    };
    if nullable.is_empty() {
        return;
    }
    if let Some(Value::Array(required)) = obj.get_mut("required") {
        required.retain(|r| {
            r.as_str()
                .map(|name| !nullable.iter().any(|n| n == name))
                .unwrap_or(true)
        });
    }
}
