//! # aside-db
//!
//! Cache-aside data access for entity-oriented storage, spread over one or many database servers.
//!
//! # The Basics
//!
//! The crate sits between typed entity operations and the databases that store them:
//!
//! - A [cache policy](policy::CachePolicy) intercepts the lifecycle of every data command. The default one,
//!   [`CacheEngine`], derives cache identity from entity metadata, answers reads from the cache whenever it can prove
//!   the answer complete, and keeps the cache consistent with writes by invalidating what they touch.
//! - The [dispatcher](dispatcher::Dispatcher) runs every command through `before → execute → after` phases and
//!   routes them to the policy according to a per-operation [trigger table](settings::TriggerTable).
//! - The [coordinator](shard::Coordinator) executes commands against the servers a resolver picks for them and
//!   merges what comes back: de-duplicated, re-sorted, re-paged, re-aggregated.
//! - [`DataAccess`] ties all of the above together behind a typed API.
//!
//! # Cache Keys
//!
//! Every entity declares primary key fields, optional prefix (tenant/partition) fields and optional alternate
//! lookup fields. A record is cached under its primary key; every alternate lookup field gets a secondary key whose
//! value is the primary key string. See the [`key`] module for the rendered format.
//!
//! A read is answered by the cache only if the cache can prove that nothing is missing. Queries the key model can't
//! represent always go to the database. With [null caching](settings::CacheSettings) enabled, keys that a complete
//! database answer did not produce are remembered as "confirmed absent" for a while.
//!
//! # Failure Model
//!
//! Configuration mistakes (a server without a provider, an entity without metadata) are loud and immediate. Cache
//! backend failures are not: they are logged and turn into "ask the database" or "skip the cache write".
//!
//! # Deferred Population
//!
//! Database answers to plain queries are written into the cache by a small pool of background workers fed from a
//! bounded [queue](queue::WriteQueue), so the caller never waits for the cache. Call [`CacheEngine::flush`] to wait
//! for pending writes.

pub mod data;
pub mod dispatcher;
pub mod engine;
pub mod entity;
pub mod error;
pub mod key;
pub mod policy;
pub mod query;
pub mod queue;
pub mod settings;
pub mod shard;
pub mod store;

#[doc(inline)]
pub use data::DataAccess;
#[doc(inline)]
pub use engine::CacheEngine;
#[doc(inline)]
pub use error::Error;

pub mod prelude {
    pub use crate::data::DataAccess;
    pub use crate::data::Page;
    pub use crate::dispatcher::Dispatcher;
    pub use crate::engine::CacheEngine;
    pub use crate::entity::Entity;
    pub use crate::entity::EntityConfig;
    pub use crate::entity::MetadataProvider;
    pub use crate::entity::MetadataRegistry;
    pub use crate::error::Error;
    pub use crate::error::Result;
    pub use crate::policy::CachePolicy;
    pub use crate::query::*;
    pub use crate::settings::*;
    pub use crate::shard::Coordinator;
    pub use crate::shard::DatabaseProvider;
    pub use crate::shard::DatabaseServer;
    pub use crate::shard::ServerResolver;
    pub use crate::shard::StaticResolver;
    pub use crate::store::CacheStore;
    pub use crate::store::MokaStore;
}
