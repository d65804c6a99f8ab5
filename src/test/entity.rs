use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::entity::Entity;
use crate::entity::EntityConfig;
use crate::entity::MetadataRegistry;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Order {
    pub id:          u64,
    pub customer_id: u64,
    pub status:      String,
    pub total:       f64,
}

impl Entity for Order {
    const NAME: &'static str = "Order";
}

impl Order {
    pub fn new(id: u64, customer_id: u64, status: &str, total: f64) -> Self {
        Self {
            id,
            customer_id,
            status: status.to_string(),
            total,
        }
    }
}

/// Tenant-partitioned, with an alternate lookup by email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Customer {
    pub tenant: String,
    pub id:     u64,
    pub email:  String,
    pub name:   String,
}

impl Entity for Customer {
    const NAME: &'static str = "Customer";
}

impl Customer {
    pub fn new(tenant: &str, id: u64, email: &str, name: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            id,
            email: email.to_string(),
            name: name.to_string(),
        }
    }
}

pub fn order_config() -> EntityConfig {
    EntityConfig::for_entity::<Order>()
        .primary_keys(["Id"])
        .expiration(Duration::from_secs(300))
        .null_expiration(Duration::from_secs(30))
}

pub fn customer_config() -> EntityConfig {
    EntityConfig::for_entity::<Customer>()
        .primary_keys(["Id"])
        .prefix_keys(["Tenant"])
        .secondary_keys(["Email"])
        .expiration(Duration::from_secs(300))
}

pub fn registry() -> Result<MetadataRegistry> {
    MetadataRegistry::new().with(order_config())?.with(customer_config())
}
