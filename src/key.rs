//! Deterministic identity of cached records.
//!
//! A rendered key looks like `Order#p#/tenant-1#Id=42`: the escaped cache object name, the key kind (`p` for primary,
//! `s` for secondary), the prefix segments each introduced by `/`, and the `&`-joined field pairs sorted by field
//! name. Every separator character occurring inside a name or a value is backslash-escaped, which keeps rendering
//! injective over the (object, prefix, fields) triple.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use serde_json::Value;

use crate::entity::EntityConfig;
use crate::query::Record;

const ESCAPE: char = '\\';
const OBJECT_SEP: char = '#';
const SEGMENT_SEP: char = '/';
const FIELD_SEP: char = '&';
const PAIR_SEP: char = '=';

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        if matches!(c, ESCAPE | OBJECT_SEP | SEGMENT_SEP | FIELD_SEP | PAIR_SEP) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    escape_into(&mut out, raw);
    out
}

fn normalize(value: &str) -> &str {
    if value.trim().is_empty() {
        ""
    }
    else {
        value
    }
}

/// Turns a field value into a key segment. `None` for nulls and blank strings.
pub fn segment(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Namespace of one entity type's cached records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheObject {
    name:    Arc<str>,
    escaped: Arc<str>,
}

impl CacheObject {
    pub fn new(name: &str) -> Self {
        Self {
            name:    Arc::from(name),
            escaped: Arc::from(escape(name).as_str()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prefix shared by every key of this object, primary and secondary alike.
    pub fn namespace(&self) -> String {
        format!("{}{OBJECT_SEP}", self.escaped)
    }

    pub fn kind_namespace(&self, kind: KeyKind) -> String {
        format!("{}{OBJECT_SEP}{}{OBJECT_SEP}", self.escaped, kind.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Primary,
    Secondary,
}

impl KeyKind {
    fn tag(&self) -> char {
        match self {
            Self::Primary => 'p',
            Self::Secondary => 's',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    object: CacheObject,
    kind:   KeyKind,
    prefix: Vec<String>,
    fields: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new<I, F, V>(object: CacheObject, kind: KeyKind, prefix: Vec<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<String>,
        V: Into<String>,
    {
        Self {
            object,
            kind,
            prefix,
            fields: fields.into_iter().map(|(f, v)| (f.into(), v.into())).collect(),
        }
    }

    pub fn object(&self) -> &CacheObject {
        &self.object
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn render(&self) -> String {
        let mut out = self.object.kind_namespace(self.kind);
        for seg in &self.prefix {
            out.push(SEGMENT_SEP);
            escape_into(&mut out, normalize(seg));
        }
        out.push(OBJECT_SEP);
        for (idx, (field, value)) in self.fields.iter().enumerate() {
            if idx > 0 {
                out.push(FIELD_SEP);
            }
            escape_into(&mut out, field);
            out.push(PAIR_SEP);
            escape_into(&mut out, normalize(value));
        }
        out
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Builds keys of one entity for a fixed set of prefix segment values.
#[derive(Debug, Clone)]
pub struct KeyBuilder<'a> {
    config: &'a EntityConfig,
    prefix: Vec<String>,
}

impl<'a> KeyBuilder<'a> {
    /// `prefix` must follow the declaration order of the entity's prefix fields.
    pub fn new(config: &'a EntityConfig, prefix: Vec<String>) -> Self {
        Self { config, prefix }
    }

    /// Takes prefix values from the record itself. `None` if any of them is missing.
    pub fn for_record(config: &'a EntityConfig, record: &Record) -> Option<Self> {
        let mut prefix = Vec::with_capacity(config.prefix_fields().len());
        for field in config.prefix_fields() {
            let Some(seg) = record.get(field).and_then(segment)
            else {
                log::warn!("[{}] record has no value for prefix field '{field}'", config.name());
                return None;
            };
            prefix.push(seg);
        }
        Some(Self::new(config, prefix))
    }

    pub fn primary(&self, record: &Record) -> Option<CacheKey> {
        let mut fields = Vec::with_capacity(self.config.primary_fields().len());
        for field in self.config.primary_fields() {
            let Some(seg) = record.get(field).and_then(segment)
            else {
                log::warn!("[{}] record has no value for primary key field '{field}'", self.config.name());
                return None;
            };
            fields.push((field.clone(), seg));
        }
        Some(self.primary_from(fields))
    }

    pub fn secondary(&self, record: &Record) -> Option<Vec<CacheKey>> {
        let mut keys = Vec::new();
        for field in self.config.secondary_fields() {
            let Some(seg) = record.get(field).and_then(segment)
            else {
                log::warn!("[{}] record has no value for cache key field '{field}'", self.config.name());
                return None;
            };
            keys.push(self.secondary_from(field, seg));
        }
        Some(keys)
    }

    pub fn primary_from<I, F, V>(&self, fields: I) -> CacheKey
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<String>,
        V: Into<String>,
    {
        CacheKey::new(
            self.config.object().clone(),
            KeyKind::Primary,
            self.prefix.clone(),
            fields,
        )
    }

    pub fn secondary_from<F: Into<String>, V: Into<String>>(&self, field: F, value: V) -> CacheKey {
        CacheKey::new(
            self.config.object().clone(),
            KeyKind::Secondary,
            self.prefix.clone(),
            [(field, value)],
        )
    }
}

pub fn build_primary_key(config: &EntityConfig, record: &Record) -> Option<CacheKey> {
    KeyBuilder::for_record(config, record)?.primary(record)
}

pub fn build_secondary_keys(config: &EntityConfig, record: &Record) -> Option<Vec<CacheKey>> {
    KeyBuilder::for_record(config, record)?.secondary(record)
}

/// Entity identity of a record as the rendered primary key; used for cross-shard de-duplication.
pub fn identity(config: &EntityConfig, record: &Record) -> Option<String> {
    build_primary_key(config, record).map(|k| k.render())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn order_config() -> EntityConfig {
        EntityConfig::new("Order")
            .primary_keys(["Id", "Line"])
            .prefix_keys(["Tenant", "Region"])
            .secondary_keys(["Code"])
    }

    #[test]
    fn rendering_is_deterministic() {
        let cfg = order_config();
        let r = record(json!({"Id": 1, "Line": 2, "Tenant": "t1", "Region": "eu", "Code": "A"}));
        let k1 = build_primary_key(&cfg, &r).unwrap().render();
        let k2 = build_primary_key(&cfg, &r.clone()).unwrap().render();
        assert_eq!(k1, k2);
        assert_eq!(k1, "Order#p#/t1/eu#Id=1&Line=2");
    }

    #[test]
    fn field_order_does_not_matter_prefix_order_does() {
        let cfg = order_config();
        let b = KeyBuilder::new(&cfg, vec!["t1".into(), "eu".into()]);
        let a = b.primary_from([("Id", "1"), ("Line", "2")]);
        let c = b.primary_from([("Line", "2"), ("Id", "1")]);
        assert_eq!(a.render(), c.render());

        let swapped = KeyBuilder::new(&cfg, vec!["eu".into(), "t1".into()]).primary_from([("Id", "1"), ("Line", "2")]);
        assert_ne!(a.render(), swapped.render());
    }

    #[test]
    fn missing_values_invalidate_the_key() {
        let cfg = order_config();
        assert!(build_primary_key(&cfg, &record(json!({"Id": 1, "Line": 2, "Tenant": "t1"}))).is_none());
        assert!(build_primary_key(&cfg, &record(json!({"Id": 1, "Line": null, "Tenant": "t1", "Region": "eu"})))
            .is_none());
        assert!(build_primary_key(&cfg, &record(json!({"Id": " ", "Line": 1, "Tenant": "t1", "Region": "eu"})))
            .is_none());
        assert!(build_secondary_keys(&cfg, &record(json!({"Id": 1, "Line": 2, "Tenant": "t1", "Region": "eu"})))
            .is_none());
    }

    #[test]
    fn separators_are_escaped() {
        let cfg = EntityConfig::new("A#B").primary_keys(["k"]);
        let b = KeyBuilder::new(&cfg, vec![]);
        let one = b.primary_from([("k", "x&y=z")]).render();
        let other_cfg = EntityConfig::new("A").primary_keys(["k"]);
        let two = KeyBuilder::new(&other_cfg, vec!["B".into()])
            .primary_from([("k", "x&y=z")])
            .render();
        assert_ne!(one, two);
        assert_eq!(one, r"A\#B#p##k=x\&y\=z");
        assert!(one.starts_with(&cfg.object().namespace()));
    }

    #[test]
    fn secondary_and_primary_namespaces_differ() {
        let cfg = order_config();
        let b = KeyBuilder::new(&cfg, vec!["t1".into(), "eu".into()]);
        let s = b.secondary_from("Code", "A").render();
        assert!(s.starts_with(&cfg.object().kind_namespace(KeyKind::Secondary)));
        assert!(!s.starts_with(&cfg.object().kind_namespace(KeyKind::Primary)));
    }

    #[test]
    fn blank_values_render_as_empty() {
        let cfg = EntityConfig::new("T").primary_keys(["k"]);
        let k = KeyBuilder::new(&cfg, vec!["  ".into()]).primary_from([("k", "\t")]);
        assert_eq!(k.render(), "T#p#/#k=");
    }
}
