use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Number;
use serde_json::Value;

use crate::entity::EntityConfig;
use crate::error::BoxError;
use crate::key::identity;
use crate::query::compare_values;
use crate::query::AggregateOp;
use crate::query::Query;
use crate::query::Record;
use crate::shard::Command;
use crate::shard::CommandKind;
use crate::shard::DatabaseProvider;
use crate::shard::DatabaseServer;
use crate::shard::Paged;
use crate::shard::ShardAggregate;

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    pub server: DatabaseServer,
    pub method: &'static str,
    pub query:  Option<Query>,
}

type Table = Vec<Record>;

/// A [`DatabaseProvider`] keeping one set of tables per server.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables:      Mutex<HashMap<DatabaseServer, HashMap<String, Table>>>,
    calls:       Mutex<Vec<ProviderCall>>,
    failing:     Mutex<HashSet<DatabaseServer>>,
    delays:      Mutex<HashMap<DatabaseServer, Duration>>,
    finished:    Mutex<Vec<ProviderCall>>,
    omit_counts: AtomicBool,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed<I: IntoIterator<Item = Record>>(&self, server: &DatabaseServer, entity: &str, records: I) {
        self.tables
            .lock()
            .entry(server.clone())
            .or_default()
            .entry(entity.to_string())
            .or_default()
            .extend(records);
    }

    pub fn records(&self, server: &DatabaseServer, entity: &str) -> Vec<Record> {
        self.tables
            .lock()
            .get(server)
            .and_then(|t| t.get(entity))
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, method: &str) -> Vec<ProviderCall> {
        self.calls.lock().iter().filter(|c| c.method == method).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn fail_on(&self, server: &DatabaseServer) {
        self.failing.lock().insert(server.clone());
    }

    pub fn recover(&self) {
        self.failing.lock().clear();
    }

    /// Every call to `server` sleeps for `delay` before answering.
    pub fn delay_on(&self, server: &DatabaseServer, delay: Duration) {
        self.delays.lock().insert(server.clone(), delay);
    }

    /// Calls of `method` that ran to completion, as opposed to merely started.
    pub fn finished_of(&self, method: &str) -> Vec<ProviderCall> {
        self.finished.lock().iter().filter(|c| c.method == method).cloned().collect()
    }

    /// Make aggregates come back without per-shard row counts.
    pub fn omit_counts(&self, omit: bool) {
        self.omit_counts.store(omit, Ordering::SeqCst);
    }

    async fn enter(
        &self,
        server: &DatabaseServer,
        method: &'static str,
        command: Option<&Command>,
    ) -> Result<(), BoxError> {
        let call = ProviderCall {
            server: server.clone(),
            method,
            query: command.and_then(Command::query).cloned(),
        };
        self.calls.lock().push(call.clone());
        let delay = self.delays.lock().get(server).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(server) {
            return Err(format!("{server} is unavailable").into());
        }
        self.finished.lock().push(call);
        Ok(())
    }

    /// Matching records in the requested order. Size and paging are left to the caller.
    fn select(&self, server: &DatabaseServer, command: &Command) -> Vec<Record> {
        let query = command.query().cloned().unwrap_or_default();
        let mut records = self
            .records(server, command.entity().name())
            .into_iter()
            .filter(|r| query.matches(r))
            .collect::<Vec<_>>();
        query.sort_records(&mut records);
        records
    }

    fn apply(table: &mut Table, entity: &EntityConfig, command: &Command) -> u64 {
        let same = |a: &Record, b: &Record| identity(entity, a).is_some() && identity(entity, a) == identity(entity, b);
        match command.kind() {
            CommandKind::Insert(records) => {
                for record in records {
                    table.retain(|r| !same(r, record));
                    table.push(record.clone());
                }
                records.len() as u64
            }
            CommandKind::Update(records) => {
                let mut affected = 0;
                for record in records {
                    for row in table.iter_mut().filter(|r| same(r, record)) {
                        *row = record.clone();
                        affected += 1;
                    }
                }
                affected
            }
            CommandKind::Delete(records) => {
                let before = table.len();
                table.retain(|r| !records.iter().any(|d| same(r, d)));
                (before - table.len()) as u64
            }
            CommandKind::UpdateByQuery { query, values } => {
                let mut affected = 0;
                for row in table.iter_mut().filter(|r| query.matches(r)) {
                    row.extend(values.clone());
                    affected += 1;
                }
                affected
            }
            CommandKind::DeleteByQuery(query) => {
                let before = table.len();
                table.retain(|r| !query.matches(r));
                (before - table.len()) as u64
            }
            CommandKind::Select(_) => 0,
        }
    }
}

fn number(value: f64) -> Option<Value> {
    Number::from_f64(value).map(Value::Number)
}

#[async_trait]
impl DatabaseProvider for MemoryDatabase {
    async fn execute(&self, server: &DatabaseServer, commands: Vec<Command>) -> Result<u64, BoxError> {
        self.enter(server, "execute", commands.first()).await?;
        let mut tables = self.tables.lock();
        let tables = tables.entry(server.clone()).or_default();
        let mut affected = 0;
        for command in &commands {
            let table = tables.entry(command.entity().name().to_string()).or_default();
            affected += Self::apply(table, command.entity(), command);
        }
        Ok(affected)
    }

    async fn query(&self, server: &DatabaseServer, command: &Command) -> Result<Vec<Record>, BoxError> {
        self.enter(server, "query", Some(command)).await?;
        let mut records = self.select(server, command);
        let size = command.query().map_or(0, Query::size);
        if size > 0 {
            records.truncate(size);
        }
        Ok(records)
    }

    async fn query_paging(&self, server: &DatabaseServer, command: &Command) -> Result<Paged, BoxError> {
        self.enter(server, "query_paging", Some(command)).await?;
        let paging = command
            .query()
            .and_then(Query::paging)
            .ok_or("paged query without paging")?;
        let records = self.select(server, command);
        let total = records.len() as u64;
        Ok(Paged {
            records: records
                .into_iter()
                .skip(paging.offset())
                .take(paging.page_size)
                .collect(),
            total,
        })
    }

    async fn aggregate(&self, server: &DatabaseServer, command: &Command) -> Result<ShardAggregate, BoxError> {
        self.enter(server, "aggregate", Some(command)).await?;
        let spec = command
            .query()
            .and_then(Query::aggregate_spec)
            .cloned()
            .ok_or("aggregate query without an aggregate")?;
        let values = self
            .select(server, command)
            .into_iter()
            .filter_map(|r| r.get(&spec.field).filter(|v| !v.is_null()).cloned())
            .collect::<Vec<_>>();
        let count = values.len() as u64;
        let floats = values.iter().filter_map(Value::as_f64);

        let value = match spec.op {
            AggregateOp::Max => values.iter().max_by(|a, b| compare_values(a, b)).cloned(),
            AggregateOp::Min => values.iter().min_by(|a, b| compare_values(a, b)).cloned(),
            AggregateOp::Count => Some(Value::from(count)),
            AggregateOp::Sum if values.is_empty() => None,
            AggregateOp::Sum => number(floats.sum()),
            AggregateOp::Avg if values.is_empty() => None,
            AggregateOp::Avg => number(floats.sum::<f64>() / count as f64),
        };

        Ok(ShardAggregate {
            value,
            count: (!self.omit_counts.load(Ordering::SeqCst)).then_some(count),
        })
    }

    async fn exists(&self, server: &DatabaseServer, command: &Command) -> Result<bool, BoxError> {
        self.enter(server, "exists", Some(command)).await?;
        Ok(!self.select(server, command).is_empty())
    }
}
