//! Command lifecycle: `Pending → Before → Execute → After → Done`.
//!
//! The dispatcher routes the before/after phases of a data command to a [`CachePolicy`] according to the
//! [`TriggerTable`]. The database execution itself is supplied by the caller as a closure, so the dispatcher knows
//! nothing about shards or providers.

use std::future::Future;
use std::sync::Arc;

use tracing::instrument;

use crate::error::Error;
use crate::error::Result;
use crate::policy::default_policy;
use crate::policy::CachePolicy;
use crate::policy::PredicateContext;
use crate::policy::QueryCallbackContext;
use crate::policy::QueryContext;
use crate::policy::RecordsContext;
use crate::policy::StartingResult;
use crate::query::Record;
use crate::settings::CommandBehavior;
use crate::settings::TriggerTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CommandPhase {
    Pending,
    Before,
    Execute,
    After,
    Done,
}

/// Context of a mutating command, one variant per operation family.
#[derive(Debug, Clone)]
pub enum WriteContext {
    Add(RecordsContext),
    Update(RecordsContext),
    Remove(RecordsContext),
    UpdateByQuery(PredicateContext),
    RemoveByQuery(PredicateContext),
}

impl WriteContext {
    pub fn behavior(&self) -> CommandBehavior {
        match self {
            Self::Add(_) => CommandBehavior::Add,
            Self::Update(_) => CommandBehavior::Update,
            Self::Remove(_) => CommandBehavior::Remove,
            Self::UpdateByQuery(_) => CommandBehavior::UpdateByQuery,
            Self::RemoveByQuery(_) => CommandBehavior::RemoveByQuery,
        }
    }

    pub fn entity_name(&self) -> &str {
        match self {
            Self::Add(ctx) | Self::Update(ctx) | Self::Remove(ctx) => ctx.entity.name(),
            Self::UpdateByQuery(ctx) | Self::RemoveByQuery(ctx) => ctx.entity.name(),
        }
    }

    async fn starting(&self, policy: &dyn CachePolicy) -> StartingResult {
        match self {
            Self::Add(ctx) => policy.on_add_starting(ctx).await,
            Self::Update(ctx) => policy.on_update_starting(ctx).await,
            Self::Remove(ctx) => policy.on_remove_starting(ctx).await,
            Self::UpdateByQuery(ctx) => policy.on_update_by_query_starting(ctx).await,
            Self::RemoveByQuery(ctx) => policy.on_remove_by_query_starting(ctx).await,
        }
    }

    async fn callback(&self, policy: &dyn CachePolicy) {
        match self {
            Self::Add(ctx) => policy.on_add_callback(ctx).await,
            Self::Update(ctx) => policy.on_update_callback(ctx).await,
            Self::Remove(ctx) => policy.on_remove_callback(ctx).await,
            Self::UpdateByQuery(ctx) => policy.on_update_by_query_callback(ctx).await,
            Self::RemoveByQuery(ctx) => policy.on_remove_by_query_callback(ctx).await,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    policy:   Arc<dyn CachePolicy>,
    triggers: TriggerTable,
}

impl Dispatcher {
    pub fn new(policy: Arc<dyn CachePolicy>, triggers: TriggerTable) -> Self {
        Self { policy, triggers }
    }

    /// Dispatcher over the process-wide default policy and default triggers.
    pub fn with_default_policy() -> Self {
        Self::new(default_policy(), TriggerTable::default())
    }

    pub fn policy(&self) -> &Arc<dyn CachePolicy> {
        &self.policy
    }

    pub fn triggers(&self) -> &TriggerTable {
        &self.triggers
    }

    fn phase(&self, entity: &str, behavior: CommandBehavior, phase: CommandPhase) {
        log::trace!("[{entity}] {behavior} command: {phase}");
    }

    /// Runs a mutating command through its lifecycle. Returns what `execute` returns, usually the affected row count.
    #[instrument(level = "trace", skip_all, fields(entity = ctx.entity_name(), behavior = %ctx.behavior()))]
    pub async fn run_write<F, Fut>(&self, ctx: WriteContext, execute: F) -> Result<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        let behavior = ctx.behavior();
        let trigger = self.triggers.get(behavior);
        self.phase(ctx.entity_name(), behavior, CommandPhase::Pending);

        if trigger.timing.before() {
            self.phase(ctx.entity_name(), behavior, CommandPhase::Before);
            if trigger.asynchronous {
                // Detached hooks cannot veto the command.
                let policy = Arc::clone(&self.policy);
                let detached = ctx.clone();
                tokio::spawn(async move {
                    let started = detached.starting(policy.as_ref()).await;
                    if started.abort {
                        log::warn!(
                            "[{}] detached {} hook requested an abort; ignored",
                            detached.entity_name(),
                            detached.behavior()
                        );
                    }
                });
            }
            else {
                let started = ctx.starting(self.policy.as_ref()).await;
                if started.abort {
                    let message = started
                        .message
                        .unwrap_or_else(|| format!("{behavior} vetoed by cache policy"));
                    log::debug!("[{}] {behavior} aborted: {message}", ctx.entity_name());
                    return Err(Error::Aborted(message));
                }
            }
        }

        self.phase(ctx.entity_name(), behavior, CommandPhase::Execute);
        let affected = execute().await?;

        if trigger.timing.after() {
            self.phase(ctx.entity_name(), behavior, CommandPhase::After);
            ctx.callback(self.policy.as_ref()).await;
        }

        self.phase(ctx.entity_name(), behavior, CommandPhase::Done);
        Ok(affected)
    }

    /// Runs a plain query: the cache is consulted first and the database only if the cache cannot answer.
    #[instrument(level = "trace", skip_all, fields(entity = ctx.entity.name()))]
    pub async fn run_query<F, Fut>(&self, ctx: QueryContext, execute: F) -> Result<Vec<Record>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Record>>>,
    {
        let behavior = CommandBehavior::Query;
        let trigger = self.triggers.get(behavior);
        let entity = ctx.entity.name().to_string();
        self.phase(&entity, behavior, CommandPhase::Pending);

        if trigger.timing.before() {
            self.phase(&entity, behavior, CommandPhase::Before);
            // A cache read is always awaited: its answer decides whether the database is needed at all.
            let cached = self.policy.on_query_starting(&ctx).await;
            if !cached.query_database {
                log::debug!("[{entity}] query answered from cache ({} record(s))", cached.records.len());
                self.phase(&entity, behavior, CommandPhase::Done);
                return Ok(cached.records);
            }
        }

        self.phase(&entity, behavior, CommandPhase::Execute);
        let records = execute().await?;

        if trigger.timing.after() {
            self.phase(&entity, behavior, CommandPhase::After);
            self.policy
                .on_query_callback(QueryCallbackContext {
                    entity:   ctx.entity,
                    query:    ctx.query,
                    records:  Arc::new(records.clone()),
                    deferred: trigger.asynchronous,
                })
                .await;
        }

        self.phase(&entity, behavior, CommandPhase::Done);
        Ok(records)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("triggers", &self.triggers).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::entity::EntityConfig;
    use crate::policy::install_default;
    use crate::policy::CacheQueryResult;
    use crate::policy::NoCachePolicy;
    use crate::query::Query;
    use crate::settings::Trigger;
    use crate::settings::TriggerTiming;

    /// Records hook calls; vetoes removals when asked to.
    #[derive(Default)]
    struct HookLog {
        calls:        Mutex<Vec<String>>,
        veto_removes: bool,
        cached:       Option<Vec<Record>>,
    }

    impl HookLog {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn log(&self, what: &str) {
            self.calls.lock().push(what.to_string());
        }
    }

    #[async_trait]
    impl CachePolicy for HookLog {
        async fn on_add_starting(&self, _ctx: &RecordsContext) -> StartingResult {
            self.log("add:before");
            StartingResult::proceed()
        }

        async fn on_add_callback(&self, _ctx: &RecordsContext) {
            self.log("add:after");
        }

        async fn on_update_starting(&self, _ctx: &RecordsContext) -> StartingResult {
            self.log("update:before");
            StartingResult::proceed()
        }

        async fn on_update_callback(&self, _ctx: &RecordsContext) {
            self.log("update:after");
        }

        async fn on_remove_starting(&self, _ctx: &RecordsContext) -> StartingResult {
            self.log("remove:before");
            if self.veto_removes {
                StartingResult::abort("read-only")
            }
            else {
                StartingResult::proceed()
            }
        }

        async fn on_remove_callback(&self, _ctx: &RecordsContext) {
            self.log("remove:after");
        }

        async fn on_update_by_query_starting(&self, _ctx: &PredicateContext) -> StartingResult {
            StartingResult::proceed()
        }

        async fn on_update_by_query_callback(&self, _ctx: &PredicateContext) {}

        async fn on_remove_by_query_starting(&self, _ctx: &PredicateContext) -> StartingResult {
            StartingResult::proceed()
        }

        async fn on_remove_by_query_callback(&self, _ctx: &PredicateContext) {}

        async fn on_query_starting(&self, _ctx: &QueryContext) -> CacheQueryResult {
            self.log("query:before");
            match &self.cached {
                Some(records) => CacheQueryResult {
                    records: records.clone(),
                    ..CacheQueryResult::default()
                },
                None => CacheQueryResult::database(),
            }
        }

        async fn on_query_callback(&self, ctx: QueryCallbackContext) {
            self.log(if ctx.deferred { "query:after:deferred" } else { "query:after" });
        }
    }

    fn records_ctx() -> RecordsContext {
        RecordsContext {
            entity:  Arc::new(EntityConfig::new("Order").primary_keys(["Id"])),
            records: Arc::new(vec![json!({"Id": 1}).as_object().cloned().unwrap()]),
        }
    }

    fn query_ctx() -> QueryContext {
        QueryContext {
            entity: Arc::new(EntityConfig::new("Order").primary_keys(["Id"])),
            query:  Arc::new(Query::all().and_eq("Id", 1)),
        }
    }

    #[tokio::test]
    async fn default_triggers_follow_the_lifecycle() {
        let hooks = Arc::new(HookLog::default());
        let dispatcher = Dispatcher::new(hooks.clone(), TriggerTable::default());

        let n = dispatcher
            .run_write(WriteContext::Add(records_ctx()), || async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(n, 1);
        dispatcher
            .run_write(WriteContext::Update(records_ctx()), || async { Ok(1) })
            .await
            .unwrap();

        // Add fires only after execution by default.
        assert_eq!(hooks.calls(), vec!["add:after", "update:before", "update:after"]);
    }

    #[tokio::test]
    async fn veto_skips_execution() {
        let hooks = Arc::new(HookLog {
            veto_removes: true,
            ..HookLog::default()
        });
        let dispatcher = Dispatcher::new(hooks.clone(), TriggerTable::default());
        let executed = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&executed);

        let err = dispatcher
            .run_write(WriteContext::Remove(records_ctx()), move || async move {
                e.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Aborted(ref m) if m == "read-only"));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(hooks.calls(), vec!["remove:before"]);
    }

    #[tokio::test]
    async fn detached_before_hook_cannot_veto() {
        let hooks = Arc::new(HookLog {
            veto_removes: true,
            ..HookLog::default()
        });
        let triggers =
            TriggerTable::default().with(CommandBehavior::Remove, Trigger::deferred(TriggerTiming::BEFORE));
        let dispatcher = Dispatcher::new(hooks.clone(), triggers);
        let n = dispatcher
            .run_write(WriteContext::Remove(records_ctx()), || async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn failed_execution_skips_after_phase() {
        let hooks = Arc::new(HookLog::default());
        let dispatcher = Dispatcher::new(hooks.clone(), TriggerTable::default());
        let result = dispatcher
            .run_write(WriteContext::Update(records_ctx()), || async {
                Err(Error::NoServer("Order".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(hooks.calls(), vec!["update:before"]);
    }

    #[tokio::test]
    async fn cached_query_skips_database() {
        let hooks = Arc::new(HookLog {
            cached: Some(vec![json!({"Id": 1}).as_object().cloned().unwrap()]),
            ..HookLog::default()
        });
        let dispatcher = Dispatcher::new(hooks.clone(), TriggerTable::default());
        let records = dispatcher
            .run_query(query_ctx(), || async { Err(Error::NoServer("Order".into())) })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(hooks.calls(), vec!["query:before"]);
    }

    #[tokio::test]
    async fn database_answer_is_handed_to_callback() {
        let hooks = Arc::new(HookLog::default());
        let dispatcher = Dispatcher::new(hooks.clone(), TriggerTable::default());
        dispatcher
            .run_query(query_ctx(), || async { Ok(Vec::new()) })
            .await
            .unwrap();
        assert_eq!(hooks.calls(), vec!["query:before", "query:after:deferred"]);

        let hooks = Arc::new(HookLog::default());
        let triggers = TriggerTable::default().with(CommandBehavior::Query, Trigger::sync(TriggerTiming::AFTER));
        let dispatcher = Dispatcher::new(hooks.clone(), triggers);
        dispatcher
            .run_query(query_ctx(), || async { Ok(Vec::new()) })
            .await
            .unwrap();
        assert_eq!(hooks.calls(), vec!["query:after"]);
    }

    // The only test in this crate touching the process-wide default.
    #[tokio::test]
    async fn process_wide_default_policy() {
        let record = || json!({"Id": 1}).as_object().cloned().unwrap();

        // Nothing installed: every read goes to the database.
        assert!(default_policy().on_query_starting(&query_ctx()).await.query_database);
        let records = Dispatcher::with_default_policy()
            .run_query(query_ctx(), || async move { Ok(vec![record()]) })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);

        let hooks = Arc::new(HookLog {
            cached: Some(vec![record()]),
            ..HookLog::default()
        });
        assert!(install_default(hooks.clone()));
        assert!(!install_default(Arc::new(NoCachePolicy)));

        let records = Dispatcher::with_default_policy()
            .run_query(query_ctx(), || async { Err(Error::NoServer("Order".into())) })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(hooks.calls(), vec!["query:before"]);
    }
}
