//! Typed data access: the composition of entity metadata, the command lifecycle dispatcher and the shard coordinator.

use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use crate::dispatcher::Dispatcher;
use crate::dispatcher::WriteContext;
use crate::entity::from_record;
use crate::entity::to_record;
use crate::entity::Entity;
use crate::entity::EntityConfig;
use crate::entity::MetadataProvider;
use crate::error::Result;
use crate::policy::PredicateContext;
use crate::policy::QueryContext;
use crate::policy::RecordSource;
use crate::policy::RecordsContext;
use crate::query::Query;
use crate::query::Record;
use crate::shard::Command;
use crate::shard::CommandKind;
use crate::shard::Coordinator;
use crate::shard::DatabaseServer;

/// One page of typed results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of matching records across all shards.
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct DataAccess {
    metadata:    Arc<dyn MetadataProvider>,
    dispatcher:  Dispatcher,
    coordinator: Arc<Coordinator>,
}

impl DataAccess {
    pub fn new(metadata: Arc<dyn MetadataProvider>, dispatcher: Dispatcher, coordinator: Coordinator) -> Self {
        Self {
            metadata,
            dispatcher,
            coordinator: Arc::new(coordinator),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn config<T: Entity>(&self) -> Result<Arc<EntityConfig>> {
        self.metadata.entity_config(T::NAME)
    }

    fn records<T: Entity>(items: &[T]) -> Result<Vec<Record>> {
        items.iter().map(to_record).collect()
    }

    fn typed<T: Entity>(records: Vec<Record>) -> Result<Vec<T>> {
        records.into_iter().map(from_record).collect()
    }

    fn source(&self) -> Arc<dyn RecordSource> {
        self.coordinator.clone()
    }

    async fn write_records(
        &self,
        entity: Arc<EntityConfig>,
        records: Vec<Record>,
        wrap: fn(RecordsContext) -> WriteContext,
        kind: fn(Vec<Record>) -> CommandKind,
    ) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let command = Command::new(Arc::clone(&entity), kind(records.clone()));
        let ctx = wrap(RecordsContext {
            entity,
            records: Arc::new(records),
        });
        let coordinator = &self.coordinator;
        self.dispatcher
            .run_write(ctx, || async move { coordinator.execute(vec![command]).await })
            .await
    }

    #[instrument(level = "trace", skip_all, fields(entity = T::NAME, count = items.len()))]
    pub async fn insert<T: Entity>(&self, items: &[T]) -> Result<u64> {
        self.write_records(self.config::<T>()?, Self::records(items)?, WriteContext::Add, CommandKind::Insert)
            .await
    }

    #[instrument(level = "trace", skip_all, fields(entity = T::NAME, count = items.len()))]
    pub async fn update<T: Entity>(&self, items: &[T]) -> Result<u64> {
        self.write_records(self.config::<T>()?, Self::records(items)?, WriteContext::Update, CommandKind::Update)
            .await
    }

    #[instrument(level = "trace", skip_all, fields(entity = T::NAME, count = items.len()))]
    pub async fn delete<T: Entity>(&self, items: &[T]) -> Result<u64> {
        self.write_records(self.config::<T>()?, Self::records(items)?, WriteContext::Remove, CommandKind::Delete)
            .await
    }

    /// Sets `values` on every record matching `query`.
    #[instrument(level = "trace", skip_all, fields(entity = T::NAME))]
    pub async fn update_by_query<T: Entity>(&self, query: Query, values: Record) -> Result<u64> {
        let entity = self.config::<T>()?;
        let ctx = PredicateContext {
            entity: Arc::clone(&entity),
            query:  Arc::new(query.clone()),
            source: self.source(),
        };
        let command = Command::new(entity, CommandKind::UpdateByQuery { query, values });
        let coordinator = &self.coordinator;
        self.dispatcher
            .run_write(WriteContext::UpdateByQuery(ctx), || async move {
                coordinator.execute(vec![command]).await
            })
            .await
    }

    #[instrument(level = "trace", skip_all, fields(entity = T::NAME))]
    pub async fn delete_by_query<T: Entity>(&self, query: Query) -> Result<u64> {
        let entity = self.config::<T>()?;
        let ctx = PredicateContext {
            entity: Arc::clone(&entity),
            query:  Arc::new(query.clone()),
            source: self.source(),
        };
        let command = Command::new(entity, CommandKind::DeleteByQuery(query));
        let coordinator = &self.coordinator;
        self.dispatcher
            .run_write(WriteContext::RemoveByQuery(ctx), || async move {
                coordinator.execute(vec![command]).await
            })
            .await
    }

    /// Plain query, answered from the cache whenever the cache can prove the answer complete.
    #[instrument(level = "trace", skip_all, fields(entity = T::NAME))]
    pub async fn query<T: Entity>(&self, query: Query) -> Result<Vec<T>> {
        let records = self.query_records(self.config::<T>()?, query).await?;
        Self::typed(records)
    }

    pub async fn query_records(&self, entity: Arc<EntityConfig>, query: Query) -> Result<Vec<Record>> {
        let command = Command::select(Arc::clone(&entity), query.clone());
        let ctx = QueryContext {
            entity,
            query: Arc::new(query),
        };
        let coordinator = &self.coordinator;
        self.dispatcher
            .run_query(ctx, || async move { coordinator.query(&command).await })
            .await
    }

    /// Paged reads bypass the cache.
    #[instrument(level = "trace", skip_all, fields(entity = T::NAME))]
    pub async fn query_paging<T: Entity>(&self, query: Query) -> Result<Page<T>> {
        let paged = self
            .coordinator
            .query_paging(&Command::select(self.config::<T>()?, query))
            .await?;
        Ok(Page {
            items: Self::typed(paged.records)?,
            total: paged.total,
        })
    }

    /// Scalar aggregate described by [`Query::aggregate`]. Bypasses the cache.
    #[instrument(level = "trace", skip_all, fields(entity = T::NAME))]
    pub async fn aggregate<T: Entity>(&self, query: Query) -> Result<Option<Value>> {
        self.coordinator
            .aggregate(&Command::select(self.config::<T>()?, query))
            .await
    }

    #[instrument(level = "trace", skip_all, fields(entity = T::NAME))]
    pub async fn exists<T: Entity>(&self, query: Query) -> Result<bool> {
        self.coordinator
            .exists(&Command::select(self.config::<T>()?, query))
            .await
    }

    /// Inserts into one explicitly chosen server. The cache is not populated; records show up there on first read.
    #[instrument(level = "trace", skip_all, fields(entity = T::NAME, server = %server))]
    pub async fn bulk_insert<T: Entity>(&self, server: &DatabaseServer, items: &[T]) -> Result<u64> {
        let command = Command::new(self.config::<T>()?, CommandKind::Insert(Self::records(items)?));
        self.coordinator.bulk_insert(server, command).await
    }
}
