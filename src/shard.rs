//! Multi-shard command execution.
//!
//! A [`ServerResolver`] maps every command to the database servers it targets. With one server the call goes straight
//! to its provider; with more, one task per server is spawned into a [`JoinSet`] and the results are merged here so
//! that callers never see the shard count. Dropping a pending coordinator future aborts every in-flight shard call.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Number;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::instrument;

use crate::entity::EntityConfig;
use crate::error::BoxError;
use crate::error::Error;
use crate::error::Result;
use crate::key::identity;
use crate::policy::RecordSource;
use crate::query::compare_values;
use crate::query::AggregateOp;
use crate::query::Paging;
use crate::query::Query;
use crate::query::Record;
use crate::settings::ShardSettings;

/// One physical database endpoint. Equal by kind and connection identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseServer {
    kind:       String,
    connection: String,
}

impl DatabaseServer {
    pub fn new<K: Into<String>, C: Into<String>>(kind: K, connection: C) -> Self {
        Self {
            kind:       kind.into(),
            connection: connection.into(),
        }
    }

    /// Selects the [`DatabaseProvider`] serving this server.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }
}

impl Display for DatabaseServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.kind, self.connection)
    }
}

#[derive(Debug, Clone)]
pub enum CommandKind {
    Insert(Vec<Record>),
    Update(Vec<Record>),
    Delete(Vec<Record>),
    UpdateByQuery { query: Query, values: Record },
    DeleteByQuery(Query),
    /// Plain, paged, aggregate and existence reads alike; the provider method tells them apart.
    Select(Query),
}

/// One data operation bound to an entity type. Shards receive independent clones.
#[derive(Debug, Clone)]
pub struct Command {
    entity: Arc<EntityConfig>,
    kind:   CommandKind,
}

impl Command {
    pub fn new(entity: Arc<EntityConfig>, kind: CommandKind) -> Self {
        Self { entity, kind }
    }

    pub fn select(entity: Arc<EntityConfig>, query: Query) -> Self {
        Self::new(entity, CommandKind::Select(query))
    }

    pub fn entity(&self) -> &EntityConfig {
        &self.entity
    }

    pub fn entity_config(&self) -> &Arc<EntityConfig> {
        &self.entity
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn query(&self) -> Option<&Query> {
        match &self.kind {
            CommandKind::UpdateByQuery { query, .. } | CommandKind::DeleteByQuery(query) | CommandKind::Select(query) => {
                Some(query)
            }
            _ => None,
        }
    }

    /// Records carried by record-based writes.
    pub fn records(&self) -> &[Record] {
        match &self.kind {
            CommandKind::Insert(records) | CommandKind::Update(records) | CommandKind::Delete(records) => records,
            _ => &[],
        }
    }

    /// A copy of this command with its query replaced. The command itself is left untouched.
    pub fn with_query(&self, query: Query) -> Self {
        let kind = match &self.kind {
            CommandKind::UpdateByQuery { values, .. } => CommandKind::UpdateByQuery {
                query,
                values: values.clone(),
            },
            CommandKind::DeleteByQuery(_) => CommandKind::DeleteByQuery(query),
            _ => CommandKind::Select(query),
        };
        Self {
            entity: Arc::clone(&self.entity),
            kind,
        }
    }

    fn expect_query(&self) -> Result<&Query> {
        self.query().ok_or_else(|| Error::NotQuery(self.entity.name().to_string()))
    }
}

/// A page of records plus the total number of matching records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Paged {
    pub records: Vec<Record>,
    pub total:   u64,
}

/// One shard's aggregate. `count` is the number of rows the value was computed over; required for weighted averages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardAggregate {
    pub value: Option<Value>,
    pub count: Option<u64>,
}

/// Executes commands against one kind of database server.
#[async_trait]
pub trait DatabaseProvider: Send + Sync + 'static {
    /// Returns the number of affected rows.
    async fn execute(&self, server: &DatabaseServer, commands: Vec<Command>) -> Result<u64, BoxError>;

    async fn query(&self, server: &DatabaseServer, command: &Command) -> Result<Vec<Record>, BoxError>;

    async fn query_paging(&self, server: &DatabaseServer, command: &Command) -> Result<Paged, BoxError>;

    async fn aggregate(&self, server: &DatabaseServer, command: &Command) -> Result<ShardAggregate, BoxError>;

    async fn exists(&self, server: &DatabaseServer, command: &Command) -> Result<bool, BoxError>;

    async fn bulk_insert(&self, server: &DatabaseServer, command: Command) -> Result<u64, BoxError> {
        self.execute(server, vec![command]).await
    }
}

pub trait ServerResolver: Send + Sync + 'static {
    fn resolve(&self, command: &Command) -> Vec<DatabaseServer>;
}

impl<F> ServerResolver for F
where
    F: Fn(&Command) -> Vec<DatabaseServer> + Send + Sync + 'static,
{
    fn resolve(&self, command: &Command) -> Vec<DatabaseServer> {
        self(command)
    }
}

/// Resolves every command to the same list of servers.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    servers: Vec<DatabaseServer>,
}

impl StaticResolver {
    pub fn new<I: IntoIterator<Item = DatabaseServer>>(servers: I) -> Self {
        Self {
            servers: servers.into_iter().collect(),
        }
    }
}

impl ServerResolver for StaticResolver {
    fn resolve(&self, _command: &Command) -> Vec<DatabaseServer> {
        self.servers.clone()
    }
}

type Provider = Arc<dyn DatabaseProvider>;

pub struct Coordinator {
    providers: HashMap<String, Provider>,
    resolver:  Arc<dyn ServerResolver>,
    settings:  ShardSettings,
}

impl Coordinator {
    pub fn new(resolver: Arc<dyn ServerResolver>, settings: ShardSettings) -> Result<Self> {
        Ok(Self {
            providers: HashMap::new(),
            resolver,
            settings: settings.checked()?,
        })
    }

    pub fn with_provider<K: Into<String>>(mut self, kind: K, provider: Provider) -> Self {
        self.register_provider(kind, provider);
        self
    }

    pub fn register_provider<K: Into<String>>(&mut self, kind: K, provider: Provider) {
        self.providers.insert(kind.into(), provider);
    }

    pub fn settings(&self) -> &ShardSettings {
        &self.settings
    }

    fn provider(&self, server: &DatabaseServer) -> Result<Provider> {
        self.providers
            .get(server.kind())
            .cloned()
            .ok_or_else(|| Error::MissingProvider {
                kind: server.kind().to_string(),
            })
    }

    fn servers(&self, command: &Command) -> Result<Vec<DatabaseServer>> {
        let mut seen = HashSet::new();
        let servers = self
            .resolver
            .resolve(command)
            .into_iter()
            .filter(|s| seen.insert(s.clone()))
            .collect::<Vec<_>>();
        if servers.is_empty() {
            return Err(Error::NoServer(command.entity().name().to_string()));
        }
        log::debug!(
            "[{}] routed to {} server(s): {}",
            command.entity().name(),
            servers.len(),
            servers.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ")
        );
        Ok(servers)
    }

    /// Spawns one task per job. Every provider is looked up before the first task starts, so a configuration error
    /// never leaves half of the shards executed.
    fn spawn_all<I, T, F, Fut>(&self, jobs: Vec<(DatabaseServer, I)>, call: F) -> Result<JoinSet<(usize, Result<T>)>>
    where
        F: Fn(Provider, DatabaseServer, I) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let jobs = jobs
            .into_iter()
            .map(|(server, input)| Ok((self.provider(&server)?, server, input)))
            .collect::<Result<Vec<_>>>()?;

        let mut set = JoinSet::new();
        for (idx, (provider, server, input)) in jobs.into_iter().enumerate() {
            let fut = call(provider, server, input);
            set.spawn(async move { (idx, fut.await) });
        }
        Ok(set)
    }

    /// Waits for every task. Results come back in job order; the first failure aborts the rest.
    async fn join_all<T: Send + 'static>(mut set: JoinSet<(usize, Result<T>)>) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            let (idx, result) = joined?;
            match result {
                Ok(value) => results.push((idx, value)),
                Err(err) => {
                    set.abort_all();
                    return Err(err);
                }
            }
        }
        results.sort_by_key(|(idx, _)| *idx);
        Ok(results.into_iter().map(|(_, value)| value).collect())
    }

    async fn fan_out<I, T, F, Fut>(&self, jobs: Vec<(DatabaseServer, I)>, call: F) -> Result<Vec<T>>
    where
        F: Fn(Provider, DatabaseServer, I) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        Self::join_all(self.spawn_all(jobs, call)?).await
    }

    /// Executes write commands; returns the total number of affected rows.
    #[instrument(level = "trace", skip_all, fields(commands = commands.len()))]
    pub async fn execute(&self, commands: Vec<Command>) -> Result<u64> {
        let mut groups: Vec<(DatabaseServer, Vec<Command>)> = Vec::new();
        let mut index: HashMap<DatabaseServer, usize> = HashMap::new();

        for command in commands {
            for server in self.servers(&command)? {
                let idx = *index.entry(server.clone()).or_insert_with(|| {
                    groups.push((server, Vec::new()));
                    groups.len() - 1
                });
                groups[idx].1.push(command.clone());
            }
        }

        if groups.len() == 1 {
            if let Some((server, commands)) = groups.pop() {
                let provider = self.provider(&server)?;
                return provider
                    .execute(&server, commands)
                    .await
                    .map_err(|err| Error::provider(&server, err));
            }
        }

        let counts = self
            .fan_out(groups, |provider, server, commands| async move {
                provider
                    .execute(&server, commands)
                    .await
                    .map_err(|err| Error::provider(&server, err))
            })
            .await?;
        Ok(counts.into_iter().sum())
    }

    #[instrument(level = "trace", skip_all, fields(entity = command.entity().name()))]
    pub async fn query(&self, command: &Command) -> Result<Vec<Record>> {
        let mut servers = self.servers(command)?;
        if servers.len() == 1 {
            let server = servers.remove(0);
            return self
                .provider(&server)?
                .query(&server, command)
                .await
                .map_err(|err| Error::provider(&server, err));
        }

        let shards = self
            .fan_out(for_each(servers), |provider, server, ()| {
                let command = command.clone();
                async move {
                    provider
                        .query(&server, &command)
                        .await
                        .map_err(|err| Error::provider(&server, err))
                }
            })
            .await?;

        let query = command.query().cloned().unwrap_or_default();
        let mut records = shards.into_iter().flatten().collect::<Vec<_>>();
        if self.settings.dedupe_list() {
            dedupe(command.entity(), &mut records);
        }
        query.sort_records(&mut records);
        if query.size() > 0 {
            records.truncate(query.size());
        }
        Ok(records)
    }

    #[instrument(level = "trace", skip_all, fields(entity = command.entity().name()))]
    pub async fn query_paging(&self, command: &Command) -> Result<Paged> {
        let query = command.expect_query()?;
        let paging = query
            .paging()
            .ok_or_else(|| Error::NotPaged(command.entity().name().to_string()))?;
        let paging = Paging {
            page:      paging.page.max(1),
            page_size: if paging.page_size == 0 {
                self.settings.default_page_size()
            }
            else {
                paging.page_size
            },
        };
        let request = command.with_query(query.with_paging(paging.page, paging.page_size));

        let mut servers = self.servers(command)?;
        if servers.len() == 1 {
            let server = servers.remove(0);
            return self
                .provider(&server)?
                .query_paging(&server, &request)
                .await
                .map_err(|err| Error::provider(&server, err));
        }

        // Any shard may hold any part of the globally ordered result, so each one is asked for everything up to
        // the end of the requested page.
        let window = command.with_query(query.with_paging(1, paging.fetch_window()));
        let shards = self
            .fan_out(for_each(servers), |provider, server, ()| {
                let window = window.clone();
                async move {
                    provider
                        .query_paging(&server, &window)
                        .await
                        .map_err(|err| Error::provider(&server, err))
                }
            })
            .await?;

        let total = shards.iter().map(|p| p.total).sum();
        let mut records = shards.into_iter().flat_map(|p| p.records).collect::<Vec<_>>();
        if self.settings.dedupe_paging() {
            dedupe(command.entity(), &mut records);
        }
        query.sort_records(&mut records);
        let records = records
            .into_iter()
            .skip(paging.offset())
            .take(paging.page_size)
            .collect();

        Ok(Paged { records, total })
    }

    /// Scalar aggregate over all shards. `None` when no shard had anything to aggregate.
    #[instrument(level = "trace", skip_all, fields(entity = command.entity().name()))]
    pub async fn aggregate(&self, command: &Command) -> Result<Option<Value>> {
        let op = command
            .query()
            .and_then(Query::aggregate_spec)
            .map(|spec| spec.op)
            .ok_or_else(|| Error::NotAggregate(command.entity().name().to_string()))?;

        let mut servers = self.servers(command)?;
        if servers.len() == 1 {
            let server = servers.remove(0);
            let shard = self
                .provider(&server)?
                .aggregate(&server, command)
                .await
                .map_err(|err| Error::provider(&server, err))?;
            return Ok(combine_aggregates(command.entity().name(), op, &[shard]));
        }

        let shards = self
            .fan_out(for_each(servers), |provider, server, ()| {
                let command = command.clone();
                async move {
                    provider
                        .aggregate(&server, &command)
                        .await
                        .map_err(|err| Error::provider(&server, err))
                }
            })
            .await?;

        Ok(combine_aggregates(command.entity().name(), op, &shards))
    }

    /// `true` as soon as any shard reports a match; the remaining shard calls are aborted.
    #[instrument(level = "trace", skip_all, fields(entity = command.entity().name()))]
    pub async fn exists(&self, command: &Command) -> Result<bool> {
        let mut servers = self.servers(command)?;
        if servers.len() == 1 {
            let server = servers.remove(0);
            return self
                .provider(&server)?
                .exists(&server, command)
                .await
                .map_err(|err| Error::provider(&server, err));
        }

        let mut set = self.spawn_all(for_each(servers), |provider, server, ()| {
            let command = command.clone();
            async move {
                provider
                    .exists(&server, &command)
                    .await
                    .map_err(|err| Error::provider(&server, err))
            }
        })?;

        while let Some(joined) = set.join_next().await {
            let (_, found) = joined?;
            if found? {
                set.abort_all();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Bulk insert into exactly one, explicitly named server.
    #[instrument(level = "trace", skip_all, fields(entity = command.entity().name(), server = %server))]
    pub async fn bulk_insert(&self, server: &DatabaseServer, command: Command) -> Result<u64> {
        self.provider(server)?
            .bulk_insert(server, command)
            .await
            .map_err(|err| Error::provider(server, err))
    }
}

/// Resolves the records a by-predicate command touches straight from the shards, never from the cache.
#[async_trait]
impl RecordSource for Coordinator {
    async fn fetch(&self, entity: &Arc<EntityConfig>, query: &Query) -> Result<Vec<Record>> {
        self.query(&Command::select(Arc::clone(entity), query.clone())).await
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds = self.providers.keys().collect::<Vec<_>>();
        kinds.sort();
        f.debug_struct("Coordinator")
            .field("providers", &kinds)
            .field("settings", &self.settings)
            .finish()
    }
}

fn for_each(servers: Vec<DatabaseServer>) -> Vec<(DatabaseServer, ())> {
    servers.into_iter().map(|s| (s, ())).collect()
}

/// Keeps the first record of every entity identity. Records without a complete identity are kept as they are.
fn dedupe(entity: &EntityConfig, records: &mut Vec<Record>) {
    let mut seen = HashSet::new();
    records.retain(|record| match identity(entity, record) {
        Some(id) => seen.insert(id),
        None => true,
    });
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn sum_values<'a, I: IntoIterator<Item = &'a Value>>(values: I) -> Option<Value> {
    let mut int_sum: Option<i64> = Some(0);
    let mut float_sum = 0f64;
    let mut any = false;
    for value in values {
        any = true;
        int_sum = int_sum.and_then(|acc| value.as_i64().and_then(|v| acc.checked_add(v)));
        float_sum += as_f64(value).unwrap_or(0.0);
    }
    if !any {
        return None;
    }
    match int_sum {
        Some(sum) => Some(Value::from(sum)),
        None => Number::from_f64(float_sum).map(Value::Number),
    }
}

/// Recombines per-shard aggregates. Averages are weighted by per-shard row counts.
pub fn combine_aggregates(entity: &str, op: AggregateOp, shards: &[ShardAggregate]) -> Option<Value> {
    let present = shards
        .iter()
        .filter_map(|s| s.value.as_ref().filter(|v| !v.is_null()).map(|v| (v, s.count)))
        .collect::<Vec<_>>();

    match op {
        AggregateOp::Max => present
            .iter()
            .map(|(v, _)| *v)
            .max_by(|a, b| compare_values(a, b))
            .cloned(),
        AggregateOp::Min => present
            .iter()
            .map(|(v, _)| *v)
            .min_by(|a, b| compare_values(a, b))
            .cloned(),
        AggregateOp::Sum => sum_values(present.iter().map(|(v, _)| *v)),
        AggregateOp::Count => Some(sum_values(present.iter().map(|(v, _)| *v)).unwrap_or_else(|| Value::from(0))),
        AggregateOp::Avg => {
            match present.as_slice() {
                [] => return None,
                [(value, _)] => return Some((*value).clone()),
                _ => (),
            }
            if present.iter().all(|(_, count)| count.is_some()) {
                let (weighted, rows) = present.iter().fold((0f64, 0u64), |(acc, rows), (v, count)| {
                    let count = count.unwrap_or(0);
                    (acc + as_f64(v).unwrap_or(0.0) * count as f64, rows + count)
                });
                if rows == 0 {
                    return None;
                }
                Number::from_f64(weighted / rows as f64).map(Value::Number)
            }
            else {
                log::warn!(
                    "[{entity}] a shard reported no row count; cross-shard average is an unweighted mean of shard \
                     averages"
                );
                let values = present.iter().filter_map(|(v, _)| as_f64(v)).collect::<Vec<_>>();
                if values.is_empty() {
                    return None;
                }
                Number::from_f64(values.iter().sum::<f64>() / values.len() as f64).map(Value::Number)
            }
        }
    }
}
