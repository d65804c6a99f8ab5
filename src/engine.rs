//! The default cache-aside policy.
//!
//! Reads try to answer a query from primary/secondary cache keys and report whether the database still has to be
//! consulted. Writes populate the cache with records (and, optionally, "confirmed absent" markers). Mutations
//! invalidate the keys of the touched records, or sweep the entity's whole namespace for unconditional predicates.
//!
//! Every backend failure is logged and swallowed here: a cache outage makes data access slower, never failing.

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::entity::EntityConfig;
use crate::error::Result;
use crate::key::segment;
use crate::key::CacheKey;
use crate::key::KeyBuilder;
use crate::key::KeyKind;
use crate::policy::CachePolicy;
use crate::policy::CacheQueryResult;
use crate::policy::PredicateContext;
use crate::policy::QueryCallbackContext;
use crate::policy::QueryContext;
use crate::policy::RecordsContext;
use crate::policy::StartingResult;
use crate::query::Condition;
use crate::query::Query;
use crate::query::Record;
use crate::queue::WriteQueue;
use crate::settings::CacheSettings;
use crate::store::CacheEntry;
use crate::store::CacheStore;
use crate::store::is_null_marker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered by the cache alone.
    pub hits:          u64,
    /// Reads that had to go to the database.
    pub misses:        u64,
    /// Entries written, null markers included.
    pub writes:        u64,
    /// Keys deleted by invalidation or sweeps.
    pub invalidations: u64,
    /// Backend operations that failed and were degraded.
    pub degraded:      u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits:          AtomicU64,
    misses:        AtomicU64,
    writes:        AtomicU64,
    invalidations: AtomicU64,
    degraded:      AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: usize) {
        counter.fetch_add(by as u64, Ordering::Relaxed);
    }
}

/// Keys a query resolves to, plus the conditions the keys do not cover.
#[derive(Debug, Default)]
struct KeyPlan {
    primary:   Vec<CacheKey>,
    secondary: Vec<CacheKey>,
    residual:  Vec<Condition>,
}

impl KeyPlan {
    /// `None` means the cache cannot represent the query and the database must answer it.
    fn build(entity: &EntityConfig, query: &Query, max_keys: usize) -> Option<Self> {
        let conditions = query.conditions();
        let mut used = vec![false; conditions.len()];

        let mut prefix = Vec::with_capacity(entity.prefix_fields().len());
        for field in entity.prefix_fields() {
            let (idx, seg) = conditions.iter().enumerate().find_map(|(idx, c)| {
                (c.field == *field && c.is_equality())
                    .then(|| segment(&c.value))
                    .flatten()
                    .map(|seg| (idx, seg))
            })?;
            used[idx] = true;
            prefix.push(seg);
        }
        let builder = KeyBuilder::new(entity, prefix);

        let mut plan = Self::default();

        let mut bound = Vec::with_capacity(entity.primary_fields().len());
        for field in entity.primary_fields() {
            match bound_segments(conditions, &used, field) {
                Some(found) => bound.push((field.as_str(), found)),
                None => break,
            }
        }

        if bound.len() == entity.primary_fields().len() {
            let combinations = bound
                .iter()
                .try_fold(1usize, |acc, (_, (_, values))| acc.checked_mul(values.len()))?;
            if combinations == 0 || combinations > max_keys {
                return None;
            }
            for (_, (idx, _)) in &bound {
                used[*idx] = true;
            }
            for combo in cartesian(&bound.iter().map(|(_, (_, v))| v.as_slice()).collect::<Vec<_>>()) {
                plan.primary.push(
                    builder.primary_from(
                        bound
                            .iter()
                            .zip(combo)
                            .map(|((field, _), value)| (field.to_string(), value)),
                    ),
                );
            }
        }
        else {
            let secondary = entity
                .secondary_fields()
                .into_iter()
                .find_map(|field| bound_segments(conditions, &used, field).map(|b| (field, b)));
            if let Some((field, (idx, values))) = secondary {
                if values.is_empty() || values.len() > max_keys {
                    return None;
                }
                used[idx] = true;
                plan.secondary = values
                    .into_iter()
                    .map(|value| builder.secondary_from(field, value))
                    .collect();
            }
        }

        if plan.primary.is_empty() && plan.secondary.is_empty() {
            return None;
        }

        plan.residual = conditions
            .iter()
            .zip(used)
            .filter(|(_, used)| !used)
            .map(|(c, _)| c.clone())
            .collect();

        Some(plan)
    }
}

/// First unused Eq/In condition on `field` whose every value is a usable key segment.
fn bound_segments(conditions: &[Condition], used: &[bool], field: &str) -> Option<(usize, Vec<String>)> {
    conditions.iter().enumerate().find_map(|(idx, c)| {
        if used[idx] || c.field != field {
            return None;
        }
        let values = c.bound_values()?;
        let mut segments = Vec::with_capacity(values.len());
        for value in values {
            let seg = segment(value)?;
            if !segments.contains(&seg) {
                segments.push(seg);
            }
        }
        Some((idx, segments))
    })
}

fn cartesian(lists: &[&[String]]) -> Vec<Vec<String>> {
    lists.iter().fold(vec![Vec::new()], |acc, values| {
        acc.into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |v| {
                    let mut next = prefix.clone();
                    next.push(v.clone());
                    next
                })
            })
            .collect()
    })
}

fn decode(entity: &EntityConfig, key: &str, value: &str) -> Option<Record> {
    match serde_json::from_str::<Record>(value) {
        Ok(record) => Some(record),
        Err(err) => {
            log::warn!("[{}] undecodable cache entry '{key}': {err}", entity.name());
            None
        }
    }
}

struct EngineCore {
    store:    Arc<dyn CacheStore>,
    settings: CacheSettings,
    counters: Counters,
}

impl EngineCore {
    fn degraded(&self, entity: &EntityConfig, what: &str, err: impl std::fmt::Display) {
        Counters::bump(&self.counters.degraded, 1);
        log::warn!("[{}] cache {what} skipped: {err}", entity.name());
    }

    fn outcome(&self, result: CacheQueryResult) -> CacheQueryResult {
        if result.query_database {
            Counters::bump(&self.counters.misses, 1);
        }
        else {
            Counters::bump(&self.counters.hits, 1);
        }
        result
    }

    async fn get_cache_data(&self, entity: &EntityConfig, query: &Query) -> CacheQueryResult {
        if query.is_complex() {
            log::debug!("[{}] complex predicate, bypassing cache", entity.name());
            return self.outcome(CacheQueryResult::database());
        }

        // A page window is only meaningful over the full database answer.
        if query.paging().is_some() {
            log::debug!("[{}] paged query, bypassing cache", entity.name());
            return self.outcome(CacheQueryResult::database());
        }

        if query.conditions().is_empty() {
            return self.outcome(self.scan_namespace(entity, query).await);
        }

        let Some(plan) = KeyPlan::build(entity, query, self.settings.max_key_combinations())
        else {
            return self.outcome(CacheQueryResult::database());
        };

        if !plan.residual.is_empty() && query.is_sorted() {
            return self.outcome(CacheQueryResult::database());
        }

        self.outcome(self.read_plan(entity, query, plan).await)
    }

    async fn scan_namespace(&self, entity: &EntityConfig, query: &Query) -> CacheQueryResult {
        // A key scan can honor neither an order nor an unbounded request.
        if query.is_sorted() || query.size() == 0 {
            return CacheQueryResult::database();
        }

        let namespace = entity.object().kind_namespace(KeyKind::Primary);
        let keys = match self.store.scan_keys(&namespace, 0, query.size()).await {
            Ok(keys) => keys,
            Err(err) => {
                self.degraded(entity, "scan", err);
                return CacheQueryResult::database();
            }
        };
        let values = match self.store.get(&keys).await {
            Ok(values) => values,
            Err(err) => {
                self.degraded(entity, "read", err);
                return CacheQueryResult::database();
            }
        };

        let records = keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| {
                let value = value?;
                if is_null_marker(&value) {
                    return None;
                }
                decode(entity, key, &value)
            })
            .collect::<Vec<_>>();

        CacheQueryResult {
            query_database: records.len() < query.size(),
            records,
            primary_keys: keys,
            secondary_keys: Vec::new(),
        }
    }

    async fn read_plan(&self, entity: &EntityConfig, query: &Query, plan: KeyPlan) -> CacheQueryResult {
        let null_caching = self.settings.null_caching();
        let mut absent = 0usize;
        let mut misses = 0usize;

        let mut primary_keys = plan.primary.iter().map(CacheKey::render).collect::<Vec<_>>();
        let secondary_keys = plan.secondary.iter().map(CacheKey::render).collect::<Vec<_>>();

        if !secondary_keys.is_empty() {
            let pointers = match self.store.get(&secondary_keys).await {
                Ok(values) => values,
                Err(err) => {
                    self.degraded(entity, "read", err);
                    return CacheQueryResult::database();
                }
            };
            for pointer in pointers {
                match pointer {
                    Some(marker) if is_null_marker(&marker) && null_caching => absent += 1,
                    Some(marker) if is_null_marker(&marker) => misses += 1,
                    Some(primary) => {
                        if !primary_keys.contains(&primary) {
                            primary_keys.push(primary);
                        }
                    }
                    None => misses += 1,
                }
            }
        }

        let values = if primary_keys.is_empty() {
            Vec::new()
        }
        else {
            match self.store.get(&primary_keys).await {
                Ok(values) => values,
                Err(err) => {
                    self.degraded(entity, "read", err);
                    return CacheQueryResult::database();
                }
            }
        };

        let mut records = Vec::with_capacity(values.len());
        for (key, value) in primary_keys.iter().zip(values) {
            match value {
                Some(marker) if is_null_marker(&marker) && null_caching => absent += 1,
                Some(marker) if is_null_marker(&marker) => misses += 1,
                Some(value) => match decode(entity, key, &value) {
                    Some(record) => records.push(record),
                    None => misses += 1,
                },
                None => misses += 1,
            }
        }

        let size = query.size();
        let query_database = if plan.residual.is_empty() {
            let complete = misses == 0;
            let size_met = size > 0 && records.len() >= size && !query.is_sorted();
            !(complete || size_met)
        }
        else {
            let before = records.len();
            records.retain(|r| plan.residual.iter().all(|c| c.matches(r)));
            log::trace!(
                "[{}] residual filter removed {} record(s), {absent} absent",
                entity.name(),
                before - records.len()
            );
            !(size > 0 && records.len() >= size)
        };

        if !query_database {
            query.sort_records(&mut records);
            if size > 0 {
                records.truncate(size);
            }
        }

        log::debug!(
            "[{}] cache read: {} record(s), {absent} absent, {misses} miss(es), database={query_database}",
            entity.name(),
            records.len()
        );

        CacheQueryResult {
            records,
            query_database,
            primary_keys,
            secondary_keys,
        }
    }

    async fn add_cache_data(&self, entity: &EntityConfig, records: &[Record], query: Option<&Query>) -> usize {
        let jitter = self.settings.expiration_jitter();
        let ttl = entity.record_ttl();
        let mut entries = Vec::new();
        let mut produced = HashSet::new();
        // A returned record without a primary key may sit under any requested key.
        let mut unidentified = false;

        for record in records {
            let Some(builder) = KeyBuilder::for_record(entity, record)
            else {
                unidentified = true;
                continue;
            };
            let Some(primary) = builder.primary(record)
            else {
                unidentified = true;
                continue;
            };
            // Keys of a record the database returned are never confirmed absent, cacheable or not.
            produced.insert(primary.render());
            produced.extend(Self::available_secondary(&builder, entity, record));

            let Some(secondary) = builder.secondary(record)
            else {
                continue;
            };
            let value = match serde_json::to_string(record) {
                Ok(value) => value,
                Err(err) => {
                    log::warn!("[{}] record not cached, serialization failed: {err}", entity.name());
                    continue;
                }
            };

            let primary = primary.render();
            for key in secondary {
                entries.push(CacheEntry::new(key.render(), primary.clone(), ttl, jitter));
            }
            entries.push(CacheEntry::new(primary, value, ttl, jitter));
        }

        if let Some(query) = query {
            if self.settings.null_caching() && Self::is_complete(query, records.len()) {
                if unidentified {
                    log::debug!("[{}] null markers skipped: a returned record has no primary key", entity.name());
                }
                else {
                    entries.extend(self.null_markers(entity, query, &produced));
                }
            }
        }

        if entries.is_empty() {
            return 0;
        }

        let count = entries.len();
        let markers = entries.iter().filter(|e| e.is_null_marker()).count();
        match self.store.set(entries).await {
            Ok(()) => {
                Counters::bump(&self.counters.writes, count);
                log::debug!("[{}] cached {count} entr(ies), {markers} null marker(s)", entity.name());
                count
            }
            Err(err) => {
                self.degraded(entity, "write", err);
                0
            }
        }
    }

    /// The database answer is complete if it is not a page and did not hit the requested size.
    fn is_complete(query: &Query, found: usize) -> bool {
        query.paging().is_none() && (query.size() == 0 || found < query.size())
    }

    fn null_markers(&self, entity: &EntityConfig, query: &Query, produced: &HashSet<String>) -> Vec<CacheEntry> {
        if query.is_complex() {
            return Vec::new();
        }
        let Some(plan) = KeyPlan::build(entity, query, self.settings.max_key_combinations())
        else {
            return Vec::new();
        };
        // A residual condition may have filtered out a record that does exist under the key.
        if !plan.residual.is_empty() {
            return Vec::new();
        }

        let ttl = entity.null_ttl();
        let jitter = self.settings.expiration_jitter();
        plan.primary
            .iter()
            .chain(plan.secondary.iter())
            .map(CacheKey::render)
            .filter(|key| !produced.contains(key))
            .map(|key| CacheEntry::null_marker(key, ttl, jitter))
            .collect()
    }

    async fn remove_cache_data(&self, entity: &EntityConfig, records: &[Record]) -> usize {
        let mut keys = Vec::new();
        let mut primaries = Vec::new();

        for record in records {
            let Some(builder) = KeyBuilder::for_record(entity, record)
            else {
                continue;
            };
            let Some(primary) = builder.primary(record)
            else {
                continue;
            };
            keys.extend(Self::available_secondary(&builder, entity, record));
            primaries.push(primary.render());
        }

        if primaries.is_empty() {
            return 0;
        }

        // The cached copy may carry alternate-lookup values the caller's record no longer has.
        match self.store.get(&primaries).await {
            Ok(values) => {
                for (key, value) in primaries.iter().zip(values) {
                    let Some(value) = value.filter(|v| !is_null_marker(v))
                    else {
                        continue;
                    };
                    if let Some(cached) = decode(entity, key, &value) {
                        if let Some(builder) = KeyBuilder::for_record(entity, &cached) {
                            keys.extend(Self::available_secondary(&builder, entity, &cached));
                        }
                    }
                }
            }
            Err(err) => self.degraded(entity, "read", err),
        }

        keys.extend(primaries);
        keys.sort_unstable();
        keys.dedup();

        self.delete_keys(entity, &keys).await
    }

    fn available_secondary(builder: &KeyBuilder<'_>, entity: &EntityConfig, record: &Record) -> Vec<String> {
        entity
            .secondary_fields()
            .into_iter()
            .filter_map(|field| {
                let seg = record.get(field).and_then(segment)?;
                Some(builder.secondary_from(field, seg).render())
            })
            .collect()
    }

    async fn delete_keys(&self, entity: &EntityConfig, keys: &[String]) -> usize {
        if keys.is_empty() {
            return 0;
        }
        match self.store.delete(keys).await {
            Ok(()) => {
                Counters::bump(&self.counters.invalidations, keys.len());
                log::debug!("[{}] invalidated {} key(s)", entity.name(), keys.len());
                keys.len()
            }
            Err(err) => {
                self.degraded(entity, "invalidation", err);
                0
            }
        }
    }

    async fn sweep(&self, entity: &EntityConfig) -> usize {
        let namespace = entity.object().namespace();
        let batch = self.settings.scan_batch();
        let mut removed = 0;
        let mut previous: Option<Vec<String>> = None;

        loop {
            let keys = match self.store.scan_keys(&namespace, 0, batch).await {
                Ok(keys) => keys,
                Err(err) => {
                    self.degraded(entity, "sweep", err);
                    break;
                }
            };
            if keys.is_empty() {
                break;
            }
            if previous.as_ref() == Some(&keys) {
                log::warn!("[{}] sweep stopped: scanned keys survived deletion", entity.name());
                break;
            }
            let deleted = self.delete_keys(entity, &keys).await;
            if deleted == 0 {
                break;
            }
            removed += deleted;
            previous = Some(keys);
        }

        log::debug!("[{}] namespace sweep removed {removed} key(s)", entity.name());
        removed
    }

    async fn invalidate_by_query(&self, ctx: &PredicateContext) -> usize {
        if ctx.query.is_match_all() {
            return self.sweep(&ctx.entity).await;
        }
        match ctx.source.fetch(&ctx.entity, &ctx.query).await {
            Ok(records) => self.remove_cache_data(&ctx.entity, &records).await,
            Err(err) => {
                log::warn!(
                    "[{}] cannot resolve records of a predicate ({err}); sweeping the namespace",
                    ctx.entity.name()
                );
                self.sweep(&ctx.entity).await
            }
        }
    }
}

/// Cache-aside policy over a [`CacheStore`].
pub struct CacheEngine {
    core:  Arc<EngineCore>,
    queue: WriteQueue,
}

impl CacheEngine {
    pub fn new(store: Arc<dyn CacheStore>, settings: CacheSettings) -> Result<Self> {
        let settings = settings.checked()?;
        Ok(Self {
            queue: WriteQueue::from_settings(&settings),
            core:  Arc::new(EngineCore {
                store,
                settings,
                counters: Counters::default(),
            }),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.core.settings
    }

    pub fn store(&self) -> Arc<dyn CacheStore> {
        Arc::clone(&self.core.store)
    }

    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.core.counters;
        CacheStats {
            hits:          c.hits.load(Ordering::Relaxed),
            misses:        c.misses.load(Ordering::Relaxed),
            writes:        c.writes.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            degraded:      c.degraded.load(Ordering::Relaxed),
        }
    }

    #[instrument(level = "trace", skip_all, fields(entity = entity.name()))]
    pub async fn get_cache_data(&self, entity: &EntityConfig, query: &Query) -> CacheQueryResult {
        self.core.get_cache_data(entity, query).await
    }

    /// Returns the number of entries written. `query` is the predicate the records answer, if any; it enables null
    /// markers.
    #[instrument(level = "trace", skip_all, fields(entity = entity.name(), records = records.len()))]
    pub async fn add_cache_data(&self, entity: &EntityConfig, records: &[Record], query: Option<&Query>) -> usize {
        self.core.add_cache_data(entity, records, query).await
    }

    /// Returns the number of keys deleted.
    #[instrument(level = "trace", skip_all, fields(entity = entity.name(), records = records.len()))]
    pub async fn remove_cache_data(&self, entity: &EntityConfig, records: &[Record]) -> usize {
        self.core.remove_cache_data(entity, records).await
    }

    #[instrument(level = "trace", skip_all, fields(entity = entity.name()))]
    pub async fn sweep(&self, entity: &EntityConfig) -> usize {
        self.core.sweep(entity).await
    }

    /// Wait for deferred cache writes queued so far.
    pub async fn flush(&self) {
        self.queue.flush().await
    }

    pub async fn close(&self) {
        self.queue.close().await
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("store", &self.core.store)
            .field("settings", &self.core.settings)
            .field("queue", &self.queue)
            .finish()
    }
}

#[async_trait]
impl CachePolicy for CacheEngine {
    async fn on_add_starting(&self, ctx: &RecordsContext) -> StartingResult {
        self.add_cache_data(&ctx.entity, &ctx.records, None).await;
        StartingResult::proceed()
    }

    async fn on_add_callback(&self, ctx: &RecordsContext) {
        self.add_cache_data(&ctx.entity, &ctx.records, None).await;
    }

    async fn on_update_starting(&self, ctx: &RecordsContext) -> StartingResult {
        self.remove_cache_data(&ctx.entity, &ctx.records).await;
        StartingResult::proceed()
    }

    async fn on_update_callback(&self, ctx: &RecordsContext) {
        self.remove_cache_data(&ctx.entity, &ctx.records).await;
    }

    async fn on_remove_starting(&self, ctx: &RecordsContext) -> StartingResult {
        self.remove_cache_data(&ctx.entity, &ctx.records).await;
        StartingResult::proceed()
    }

    async fn on_remove_callback(&self, ctx: &RecordsContext) {
        self.remove_cache_data(&ctx.entity, &ctx.records).await;
    }

    async fn on_update_by_query_starting(&self, ctx: &PredicateContext) -> StartingResult {
        self.core.invalidate_by_query(ctx).await;
        StartingResult::proceed()
    }

    async fn on_update_by_query_callback(&self, ctx: &PredicateContext) {
        self.core.invalidate_by_query(ctx).await;
    }

    async fn on_remove_by_query_starting(&self, ctx: &PredicateContext) -> StartingResult {
        self.core.invalidate_by_query(ctx).await;
        StartingResult::proceed()
    }

    async fn on_remove_by_query_callback(&self, ctx: &PredicateContext) {
        self.core.invalidate_by_query(ctx).await;
    }

    async fn on_query_starting(&self, ctx: &QueryContext) -> CacheQueryResult {
        self.get_cache_data(&ctx.entity, &ctx.query).await
    }

    async fn on_query_callback(&self, ctx: QueryCallbackContext) {
        if ctx.deferred {
            let core = Arc::clone(&self.core);
            self.queue
                .push(async move {
                    core.add_cache_data(&ctx.entity, &ctx.records, Some(&ctx.query)).await;
                })
                .await;
        }
        else {
            self.add_cache_data(&ctx.entity, &ctx.records, Some(&ctx.query)).await;
        }
    }
}
