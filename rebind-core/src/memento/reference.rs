//! Object references embedded in config values.
//!
//! A config value may point at another managed object with
//! `{"$ref": {"kind": "ENTITY", "id": "abc"}}`, or with the untyped form
//! `{"$ref": "abc"}` when the referenced kind is not known. References are
//! resolved during wiring exactly like relationship ids.

use serde_json::{json, Map, Value};

use super::ObjectKind;

const REF_KEY: &str = "$ref";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigRef {
    pub kind: Option<ObjectKind>,
    pub id: String,
}

impl ConfigRef {
    pub fn typed(kind: ObjectKind, id: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            id: id.into(),
        }
    }

    pub fn untyped(id: impl Into<String>) -> Self {
        Self {
            kind: None,
            id: id.into(),
        }
    }

    /// Recognise a reference value. Any other shape is plain data.
    pub fn parse(value: &Value) -> Option<ConfigRef> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        match object.get(REF_KEY)? {
            Value::String(id) => Some(ConfigRef::untyped(id.clone())),
            Value::Object(target) => {
                let id = target.get("id")?.as_str()?;
                let kind = serde_json::from_value(target.get("kind")?.clone()).ok()?;
                Some(ConfigRef::typed(kind, id))
            }
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self.kind {
            Some(kind) => json!({ "$ref": { "kind": kind, "id": self.id } }),
            None => json!({ "$ref": self.id }),
        }
    }
}

/// Collect every reference nested anywhere inside `value`.
pub fn collect_refs(value: &Value, out: &mut Vec<ConfigRef>) {
    if let Some(reference) = ConfigRef::parse(value) {
        out.push(reference);
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_refs(item, out)),
        Value::Object(entries) => entries.values().for_each(|item| collect_refs(item, out)),
        _ => {}
    }
}

/// Rewrite every reference inside `value` through `resolve`.
///
/// `resolve` returns the value to put in place of the reference, or `None` to
/// drop it. A dropped reference removes its array element or map entry; a
/// dropped top-level reference yields `None`.
pub fn resolve_refs<F>(value: &Value, resolve: &mut F) -> Option<Value>
where
    F: FnMut(&ConfigRef) -> Option<Value>,
{
    if let Some(reference) = ConfigRef::parse(value) {
        return resolve(&reference);
    }
    match value {
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| resolve_refs(item, resolve))
                .collect(),
        )),
        Value::Object(entries) => {
            let mut resolved = Map::with_capacity(entries.len());
            for (key, item) in entries {
                if let Some(item) = resolve_refs(item, resolve) {
                    resolved.insert(key.clone(), item);
                }
            }
            Some(Value::Object(resolved))
        }
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typed_and_untyped() {
        let typed = json!({"$ref": {"kind": "LOCATION", "id": "loc-1"}});
        assert_eq!(
            ConfigRef::parse(&typed),
            Some(ConfigRef::typed(ObjectKind::Location, "loc-1"))
        );

        let untyped = json!({"$ref": "e-9"});
        assert_eq!(ConfigRef::parse(&untyped), Some(ConfigRef::untyped("e-9")));

        assert_eq!(ConfigRef::parse(&json!({"$ref": "a", "other": 1})), None);
        assert_eq!(ConfigRef::parse(&json!("plain")), None);
    }

    #[test]
    fn test_to_value_parses_back() {
        let reference = ConfigRef::typed(ObjectKind::Entity, "db");
        assert_eq!(ConfigRef::parse(&reference.to_value()), Some(reference));
    }

    #[test]
    fn test_collect_nested() {
        let value = json!({
            "primary": {"$ref": "a"},
            "backups": [{"$ref": {"kind": "ENTITY", "id": "b"}}, 3]
        });
        let mut refs = Vec::new();
        collect_refs(&value, &mut refs);
        let ids: Vec<_> = refs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_resolve_drops_missing() {
        let value = json!({
            "keep": {"$ref": "present"},
            "drop": {"$ref": "missing"},
            "list": [{"$ref": "missing"}, {"$ref": "present"}]
        });
        let resolved = resolve_refs(&value, &mut |r: &ConfigRef| {
            (r.id == "present").then(|| r.to_value())
        })
        .unwrap();

        assert_eq!(
            resolved,
            json!({"keep": {"$ref": "present"}, "list": [{"$ref": "present"}]})
        );
    }
}
