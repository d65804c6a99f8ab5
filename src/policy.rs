use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;

use crate::entity::EntityConfig;
use crate::error::Result;
use crate::query::Query;
use crate::query::Record;

/// Outcome of a before-phase hook. `abort == true` is the only way to veto a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartingResult {
    pub abort:   bool,
    pub message: Option<String>,
}

impl StartingResult {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn abort<S: Into<String>>(message: S) -> Self {
        Self {
            abort:   true,
            message: Some(message.into()),
        }
    }
}

/// Result of a cache read. Built fresh for every read and never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheQueryResult {
    pub records:        Vec<Record>,
    /// The cache could not prove the result complete; the database must be consulted.
    pub query_database: bool,
    pub primary_keys:   Vec<String>,
    pub secondary_keys: Vec<String>,
}

impl CacheQueryResult {
    pub fn database() -> Self {
        Self {
            query_database: true,
            ..Self::default()
        }
    }
}

/// The "fetch by predicate" callback used to find out which records a by-predicate command touches.
#[async_trait]
pub trait RecordSource: Send + Sync + 'static {
    async fn fetch(&self, entity: &Arc<EntityConfig>, query: &Query) -> Result<Vec<Record>>;
}

/// Context of record-based operations: add, update, remove.
#[derive(Debug, Clone)]
pub struct RecordsContext {
    pub entity:  Arc<EntityConfig>,
    pub records: Arc<Vec<Record>>,
}

/// Context of predicate-based update and remove.
#[derive(Clone)]
pub struct PredicateContext {
    pub entity: Arc<EntityConfig>,
    pub query:  Arc<Query>,
    pub source: Arc<dyn RecordSource>,
}

impl std::fmt::Debug for PredicateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateContext")
            .field("entity", &self.entity.name())
            .field("query", &self.query)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct QueryContext {
    pub entity: Arc<EntityConfig>,
    pub query:  Arc<Query>,
}

#[derive(Debug, Clone)]
pub struct QueryCallbackContext {
    pub entity:   Arc<EntityConfig>,
    pub query:    Arc<Query>,
    /// What the database returned for the query.
    pub records:  Arc<Vec<Record>>,
    /// Populate the cache off the caller's path.
    pub deferred: bool,
}

/// Cache policy hooks, one pair per operation family.
///
/// Implementations must not fail a data operation because of the cache: backend trouble degrades to "ask the
/// database" or "skip the write".
#[async_trait]
pub trait CachePolicy: Send + Sync + 'static {
    async fn on_add_starting(&self, ctx: &RecordsContext) -> StartingResult;
    async fn on_add_callback(&self, ctx: &RecordsContext);

    async fn on_update_starting(&self, ctx: &RecordsContext) -> StartingResult;
    async fn on_update_callback(&self, ctx: &RecordsContext);

    async fn on_remove_starting(&self, ctx: &RecordsContext) -> StartingResult;
    async fn on_remove_callback(&self, ctx: &RecordsContext);

    async fn on_update_by_query_starting(&self, ctx: &PredicateContext) -> StartingResult;
    async fn on_update_by_query_callback(&self, ctx: &PredicateContext);

    async fn on_remove_by_query_starting(&self, ctx: &PredicateContext) -> StartingResult;
    async fn on_remove_by_query_callback(&self, ctx: &PredicateContext);

    async fn on_query_starting(&self, ctx: &QueryContext) -> CacheQueryResult;
    async fn on_query_callback(&self, ctx: QueryCallbackContext);
}

/// Policy that never caches anything: every read goes to the database.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCachePolicy;

#[async_trait]
impl CachePolicy for NoCachePolicy {
    async fn on_add_starting(&self, _ctx: &RecordsContext) -> StartingResult {
        StartingResult::proceed()
    }

    async fn on_add_callback(&self, _ctx: &RecordsContext) {}

    async fn on_update_starting(&self, _ctx: &RecordsContext) -> StartingResult {
        StartingResult::proceed()
    }

    async fn on_update_callback(&self, _ctx: &RecordsContext) {}

    async fn on_remove_starting(&self, _ctx: &RecordsContext) -> StartingResult {
        StartingResult::proceed()
    }

    async fn on_remove_callback(&self, _ctx: &RecordsContext) {}

    async fn on_update_by_query_starting(&self, _ctx: &PredicateContext) -> StartingResult {
        StartingResult::proceed()
    }

    async fn on_update_by_query_callback(&self, _ctx: &PredicateContext) {}

    async fn on_remove_by_query_starting(&self, _ctx: &PredicateContext) -> StartingResult {
        StartingResult::proceed()
    }

    async fn on_remove_by_query_callback(&self, _ctx: &PredicateContext) {}

    async fn on_query_starting(&self, _ctx: &QueryContext) -> CacheQueryResult {
        CacheQueryResult::database()
    }

    async fn on_query_callback(&self, _ctx: QueryCallbackContext) {}
}

static DEFAULT_POLICY: OnceLock<Arc<dyn CachePolicy>> = OnceLock::new();

/// Install the process-wide default policy. Only the first call wins; returns `false` for the rest.
pub fn install_default(policy: Arc<dyn CachePolicy>) -> bool {
    DEFAULT_POLICY.set(policy).is_ok()
}

/// The process-wide default policy, if one was installed. Falls back to [`NoCachePolicy`].
pub fn default_policy() -> Arc<dyn CachePolicy> {
    DEFAULT_POLICY
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(NoCachePolicy))
}
