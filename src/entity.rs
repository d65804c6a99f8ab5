use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;
use crate::key::CacheObject;
use crate::query::Record;

/// Binds a Rust type to the entity metadata registered under [`Entity::NAME`].
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

pub fn to_record<T: Serialize>(value: &T) -> Result<Record> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Serialization(<serde_json::Error as serde::ser::Error>::custom(format!(
            "entity must serialize into an object, got {other}"
        )))),
    }
}

pub fn from_record<T: DeserializeOwned>(record: Record) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

/// Cache-relevant metadata of one entity type.
#[derive(Debug, Clone)]
pub struct EntityConfig {
    object:          CacheObject,
    primary_keys:    Vec<String>,
    secondary_keys:  Vec<String>,
    prefix_keys:     Vec<String>,
    ignore_keys:     Vec<String>,
    expiration:      Option<Duration>,
    null_expiration: Option<Duration>,
}

fn strings<I, S>(fields: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    fields.into_iter().map(Into::into).collect()
}

impl EntityConfig {
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        Self {
            object:          CacheObject::new(name.as_ref()),
            primary_keys:    Vec::new(),
            secondary_keys:  Vec::new(),
            prefix_keys:     Vec::new(),
            ignore_keys:     Vec::new(),
            expiration:      None,
            null_expiration: None,
        }
    }

    pub fn for_entity<T: Entity>() -> Self {
        Self::new(T::NAME)
    }

    pub fn primary_keys<I: IntoIterator<Item = S>, S: Into<String>>(mut self, fields: I) -> Self {
        self.primary_keys = strings(fields);
        self
    }

    /// Alternate-lookup fields. Each of them gets its own secondary cache key pointing at the primary one.
    pub fn secondary_keys<I: IntoIterator<Item = S>, S: Into<String>>(mut self, fields: I) -> Self {
        self.secondary_keys = strings(fields);
        self
    }

    pub fn prefix_keys<I: IntoIterator<Item = S>, S: Into<String>>(mut self, fields: I) -> Self {
        self.prefix_keys = strings(fields);
        self
    }

    pub fn ignore_keys<I: IntoIterator<Item = S>, S: Into<String>>(mut self, fields: I) -> Self {
        self.ignore_keys = strings(fields);
        self
    }

    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn null_expiration(mut self, ttl: Duration) -> Self {
        self.null_expiration = Some(ttl);
        self
    }

    pub fn name(&self) -> &str {
        self.object.name()
    }

    pub fn object(&self) -> &CacheObject {
        &self.object
    }

    pub fn primary_fields(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn prefix_fields(&self) -> &[String] {
        &self.prefix_keys
    }

    pub fn ignore_fields(&self) -> &[String] {
        &self.ignore_keys
    }

    /// Declared secondary fields minus those already covered by primary, prefix or ignore sets.
    pub fn secondary_fields(&self) -> Vec<&str> {
        self.secondary_keys
            .iter()
            .filter(|f| {
                !self.is_primary_field(f) && !self.is_prefix_field(f) && !self.ignore_fields().contains(f)
            })
            .map(String::as_str)
            .collect()
    }

    pub fn is_prefix_field(&self, field: &str) -> bool {
        self.prefix_keys.iter().any(|f| f == field)
    }

    pub fn is_primary_field(&self, field: &str) -> bool {
        self.primary_keys.iter().any(|f| f == field)
    }

    pub fn record_ttl(&self) -> Option<Duration> {
        self.expiration
    }

    /// Null markers fall back to the record expiration when no dedicated one is declared.
    pub fn null_ttl(&self) -> Option<Duration> {
        self.null_expiration.or(self.expiration)
    }
}

pub trait MetadataProvider: Debug + Send + Sync + 'static {
    fn entity_config(&self, entity: &str) -> Result<Arc<EntityConfig>>;
}

#[derive(Debug, Default)]
pub struct MetadataRegistry {
    configs: RwLock<HashMap<String, Arc<EntityConfig>>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config: EntityConfig) -> Result<Arc<EntityConfig>> {
        if config.primary_keys.is_empty() {
            return Err(Error::MissingPrimaryKey(config.name().to_string()));
        }
        let config = Arc::new(config);
        self.configs
            .write()
            .insert(config.name().to_string(), Arc::clone(&config));
        Ok(config)
    }

    pub fn with(self, config: EntityConfig) -> Result<Self> {
        self.register(config)?;
        Ok(self)
    }
}

impl MetadataProvider for MetadataRegistry {
    fn entity_config(&self, entity: &str) -> Result<Arc<EntityConfig>> {
        self.configs
            .read()
            .get(entity)
            .cloned()
            .ok_or_else(|| Error::MissingMetadata(entity.to_string()))
    }
}
