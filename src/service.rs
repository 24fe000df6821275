use crate::cache::build_store;
use crate::cache::key::{CacheKeyBuilder, KeyContext};
use crate::cache::store::CacheStore;
use crate::cache::{CacheError, CacheMetrics, CacheStats, decode, encode};
use crate::catalog::Catalog;
use crate::catalog::schema::{FieldType, KindSchema};
use crate::catalog::types::{Record, ScalarType, Value};
use crate::config::ServiceConfig;
use crate::error::Error;
use crate::permission::{
    FieldOwnershipResolver, PermissionError, RelationshipResolver, RequesterContext, can_read,
    model_writable,
};
use crate::query::filter::{compile_fields, compile_query};
use crate::query::plan::CompiledQuery;
use crate::query::projection::{check_write, project_read, project_rows};
use crate::storage::{RecordExecutor, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub use crate::query::QueryParams;

/// One page of a list read, already redacted for the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<Record>,
    /// One-based page number.
    pub page: usize,
    pub size: usize,
    pub offset: usize,
}

impl Page {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "page": self.page,
            "size": self.size,
            "offset": self.offset,
            "items": self.items.iter().map(Record::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Permission-aware, cached read/write front for one catalog.
///
/// Reads compile the untrusted parameters, consult the cache, fall through to
/// the executor on a miss and redact the rows for the requester. The cache
/// holds unprojected rows, so one entry serves every requester. Writes load
/// the record from storage, check the payload, execute and then invalidate
/// before returning.
pub struct QueryService {
    catalog: Arc<Catalog>,
    executor: Arc<dyn RecordExecutor>,
    cache: Arc<dyn CacheStore>,
    keys: CacheKeyBuilder,
    config: ServiceConfig,
    default_resolver: Arc<dyn RelationshipResolver>,
    resolvers: HashMap<String, Arc<dyn RelationshipResolver>>,
    stats: CacheStats,
}

impl QueryService {
    pub fn new(
        catalog: Arc<Catalog>,
        executor: Arc<dyn RecordExecutor>,
        cache: Arc<dyn CacheStore>,
        config: ServiceConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            catalog,
            executor,
            cache,
            keys: CacheKeyBuilder::new(config.cache.namespace.clone()),
            config,
            default_resolver: Arc::new(FieldOwnershipResolver),
            resolvers: HashMap::new(),
            stats: CacheStats::default(),
        })
    }

    /// Like [`QueryService::new`], with the store chosen by `config.cache`.
    pub fn from_config(
        catalog: Arc<Catalog>,
        executor: Arc<dyn RecordExecutor>,
        config: ServiceConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        let cache = build_store(&config.cache)?;
        Self::new(catalog, executor, cache, config)
    }

    /// Overrides how requesters are classified against records of `kind`.
    pub fn with_resolver(
        mut self,
        kind: impl Into<String>,
        resolver: Arc<dyn RelationshipResolver>,
    ) -> Self {
        self.resolvers.insert(kind.into(), resolver);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn keys(&self) -> &CacheKeyBuilder {
        &self.keys
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.stats.snapshot()
    }

    fn resolver(&self, kind: &str) -> &dyn RelationshipResolver {
        self.resolvers
            .get(kind)
            .unwrap_or(&self.default_resolver)
            .as_ref()
    }

    /// Parses a path segment into an id of `kind`'s primary-key type. Text
    /// that cannot be such an id cannot name a record either.
    pub fn parse_id(&self, kind: &str, text: &str) -> Result<Value, Error> {
        let schema = self.catalog.require(kind)?;
        let not_found = || Error::NotFound {
            kind: kind.to_string(),
            id: text.to_string(),
        };
        let scalar = match schema.stored_field(&schema.primary_key).map(|f| &f.field_type) {
            Some(FieldType::Scalar(scalar)) => *scalar,
            _ => ScalarType::Text,
        };
        match scalar {
            ScalarType::Integer => text.parse().map(Value::Integer).map_err(|_| not_found()),
            ScalarType::Float => text.parse().map(Value::Float).map_err(|_| not_found()),
            ScalarType::Boolean => text.parse().map(Value::Boolean).map_err(|_| not_found()),
            ScalarType::Text => Ok(Value::from(text)),
        }
    }

    pub async fn get(
        &self,
        kind: &str,
        id: &Value,
        params: &QueryParams,
        requester: &RequesterContext,
    ) -> Result<Record, Error> {
        let schema = self.catalog.require(kind)?;
        let fields = compile_fields(schema, params.fields.as_deref().unwrap_or_default())?;
        let record = self.load(schema, id).await?;
        let rel = self.resolver(kind).relationship(schema, requester, &record);
        Ok(project_read(schema, &record, &fields, rel))
    }

    pub async fn list(
        &self,
        kind: &str,
        params: &QueryParams,
        requester: &RequesterContext,
    ) -> Result<Page, Error> {
        let schema = self.catalog.require(kind)?;
        let query = self.compile(schema, params, requester)?;
        self.run_list(schema, query, requester).await
    }

    /// Lists the records on the far side of back-reference `edge` of record
    /// `id`, e.g. the orders of one customer.
    pub async fn list_edge(
        &self,
        kind: &str,
        id: &Value,
        edge: &str,
        params: &QueryParams,
        requester: &RequesterContext,
    ) -> Result<Page, Error> {
        let schema = self.catalog.require(kind)?;
        let (target, link_field) = schema.edge(edge).ok_or_else(|| Error::UnknownEdge {
            kind: kind.to_string(),
            edge: edge.to_string(),
        })?;
        self.load(schema, id).await?;
        let target_schema = self.catalog.require(target)?;
        let query = self
            .compile(target_schema, params, requester)?
            .restrict_to(link_field, id.clone());
        self.run_list(target_schema, query, requester).await
    }

    pub async fn update(
        &self,
        kind: &str,
        id: &Value,
        payload: &Record,
        requester: &RequesterContext,
    ) -> Result<Record, Error> {
        let schema = self.catalog.require(kind)?;
        let current = self.fetch_authoritative(schema, id).await?;
        let resolver = self.resolver(kind);
        check_write(schema, payload, resolver.relationship(schema, requester, &current))?;

        let updated = self
            .storage("update", self.executor.update(kind, id, payload))
            .await?
            .ok_or_else(|| not_found(kind, id))?;
        info!(kind, id = %id, fields = payload.len(), "record updated");
        self.invalidate(kind, id).await;

        let rel = resolver.relationship(schema, requester, &updated);
        Ok(project_read(schema, &updated, &[], rel))
    }

    pub async fn delete(
        &self,
        kind: &str,
        id: &Value,
        requester: &RequesterContext,
    ) -> Result<(), Error> {
        let schema = self.catalog.require(kind)?;
        let current = self.fetch_authoritative(schema, id).await?;
        let rel = self.resolver(kind).relationship(schema, requester, &current);
        if !model_writable(schema, rel) {
            return Err(PermissionError::ModelNotWritable {
                kind: kind.to_string(),
                relationship: rel,
            }
            .into());
        }
        if !self.storage("delete", self.executor.delete(kind, id)).await? {
            return Err(not_found(kind, id));
        }
        info!(kind, id = %id, "record deleted");
        self.invalidate(kind, id).await;
        Ok(())
    }

    /// Filter and sort may only name fields readable without knowing the row,
    /// so list queries are checked against the requester's static relationship.
    fn compile(
        &self,
        schema: &KindSchema,
        params: &QueryParams,
        requester: &RequesterContext,
    ) -> Result<CompiledQuery, Error> {
        let rel = requester.static_relationship();
        let readable = |field: &str| can_read(schema, field, rel);
        Ok(compile_query(schema, params, readable, &self.config.limits())?)
    }

    async fn run_list(
        &self,
        schema: &KindSchema,
        query: CompiledQuery,
        requester: &RequesterContext,
    ) -> Result<Page, Error> {
        let rows = self.select(schema, &query).await?;
        let items = project_rows(
            schema,
            &rows,
            &query.fields,
            self.resolver(&schema.name),
            requester,
        );
        let page = query.selection.page;
        Ok(Page {
            items,
            page: page.page_number(),
            size: page.limit,
            offset: page.offset,
        })
    }

    async fn select(&self, schema: &KindSchema, query: &CompiledQuery) -> Result<Vec<Record>, Error> {
        let kind = schema.name.as_str();
        let key = match self.keys.list_key(kind, query, &KeyContext::Shared) {
            Ok(key) => Some(key),
            Err(e) => {
                self.stats.record_error();
                warn!(kind, error = %e, "cache key unavailable; reading from storage");
                None
            }
        };
        if let Some(key) = key.as_deref() {
            if let Some(rows) = self.cache_get::<Vec<Record>>(key).await {
                return Ok(rows);
            }
        }
        let rows = self
            .storage("select", self.executor.select(kind, &query.selection))
            .await?;
        if let Some(key) = key.as_deref() {
            self.cache_set(key, &rows).await;
        }
        Ok(rows)
    }

    /// Cache-aware point read of the unprojected record.
    async fn load(&self, schema: &KindSchema, id: &Value) -> Result<Record, Error> {
        let key = self.keys.point_key(&schema.name, id);
        if let Some(record) = self.cache_get::<Record>(&key).await {
            return Ok(record);
        }
        let record = self.fetch_authoritative(schema, id).await?;
        self.cache_set(&key, &record).await;
        Ok(record)
    }

    async fn fetch_authoritative(&self, schema: &KindSchema, id: &Value) -> Result<Record, Error> {
        self.storage("fetch", self.executor.fetch(&schema.name, id))
            .await?
            .ok_or_else(|| not_found(&schema.name, id))
    }

    async fn storage<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.config.storage_timeout(), call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout { operation }),
        }
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.config.cache.op_timeout(), op)
            .await
            .unwrap_or(Err(CacheError::Timeout))
    }

    async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.bounded(self.cache.get(key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.stats.record_miss();
                debug!(key, "cache miss");
                return None;
            }
            Err(e) => {
                self.stats.record_error();
                self.stats.record_miss();
                warn!(key, error = %e, "cache read failed; reading from storage");
                return None;
            }
        };
        match decode(&bytes) {
            Ok(value) => {
                self.stats.record_hit();
                debug!(key, "cache hit");
                Some(value)
            }
            Err(e) => {
                self.stats.record_error();
                self.stats.record_miss();
                warn!(key, error = %e, "undecodable cache entry; reading from storage");
                None
            }
        }
    }

    async fn cache_set<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let outcome = match encode(value) {
            Ok(bytes) => self.bounded(self.cache.set(key, bytes, self.config.cache.ttl())).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                self.stats.record_store();
                debug!(key, "cache store");
            }
            Err(e) => {
                self.stats.record_error();
                warn!(key, error = %e, "cache write failed");
            }
        }
    }

    /// Drops the point entry of `id` and every list entry of `kind`. If that
    /// fails the whole namespace is cleared; the write itself has already
    /// committed, so a failed clear is only logged.
    async fn invalidate(&self, kind: &str, id: &Value) {
        let point = self.keys.point_key(kind, id);
        let lists = self.keys.list_pattern(kind);
        let outcome = self
            .bounded(async {
                let removed = self.cache.invalidate(&point).await?;
                Ok::<_, CacheError>(removed + self.cache.invalidate(&lists).await?)
            })
            .await;
        let e = match outcome {
            Ok(removed) => {
                self.stats.record_invalidation();
                info!(kind, id = %id, removed, "cache invalidated");
                return;
            }
            Err(e) => e,
        };
        self.stats.record_error();
        warn!(kind, id = %id, error = %e, "targeted invalidation failed; clearing cache");
        match self.bounded(self.cache.clear()).await {
            Ok(()) => {
                self.stats.record_invalidation();
                info!(namespace = self.keys.namespace(), "cache cleared");
            }
            Err(clear_err) => {
                self.stats.record_error();
                error!(
                    kind,
                    id = %id,
                    error = %clear_err,
                    "cache clear failed; stale entries may be served until they expire"
                );
            }
        }
    }
}

fn not_found(kind: &str, id: &Value) -> Error {
    Error::NotFound {
        kind: kind.to_string(),
        id: id.to_string(),
    }
}
