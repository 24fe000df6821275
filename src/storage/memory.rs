use crate::catalog::Catalog;
use crate::catalog::types::{Record, Value};
use crate::query::plan::{CmpOp, Expr, Order, Selection, SortKey};
use crate::storage::{RecordExecutor, StorageError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

type Table = BTreeMap<Value, Record>;

/// Call counts, used to observe whether a read reached storage.
#[derive(Debug, Default)]
pub struct ExecutorCalls {
    pub fetches: AtomicU64,
    pub selects: AtomicU64,
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
}

impl ExecutorCalls {
    pub fn reads(&self) -> u64 {
        self.fetches.load(AtomicOrdering::Relaxed) + self.selects.load(AtomicOrdering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.updates.load(AtomicOrdering::Relaxed) + self.deletes.load(AtomicOrdering::Relaxed)
    }
}

/// In-process executor keyed by each kind's primary key. Rows are kept in
/// primary-key order, which is also the order of unsorted selections.
pub struct MemoryExecutor {
    catalog: Arc<Catalog>,
    tables: RwLock<BTreeMap<String, Table>>,
    latency: Option<Duration>,
    calls: ExecutorCalls,
}

impl MemoryExecutor {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            tables: RwLock::new(BTreeMap::new()),
            latency: None,
            calls: ExecutorCalls::default(),
        }
    }

    /// Delays every call, to exercise timeouts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> &ExecutorCalls {
        &self.calls
    }

    pub fn insert(&self, kind: &str, record: Record) -> Result<(), StorageError> {
        let schema = self
            .catalog
            .kind(kind)
            .ok_or_else(|| StorageError::Execution(format!("unknown kind '{kind}'")))?;
        let id = record.get(&schema.primary_key).cloned().ok_or_else(|| {
            StorageError::Execution(format!(
                "{kind} record is missing primary key '{}'",
                schema.primary_key
            ))
        })?;
        self.tables
            .write()
            .entry(kind.to_string())
            .or_default()
            .insert(id, record);
        Ok(())
    }

    /// Direct read that bypasses counters, for assertions in tests.
    pub fn peek(&self, kind: &str, id: &Value) -> Option<Record> {
        self.tables.read().get(kind)?.get(id).cloned()
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RecordExecutor for MemoryExecutor {
    async fn fetch(&self, kind: &str, id: &Value) -> Result<Option<Record>, StorageError> {
        self.calls.fetches.fetch_add(1, AtomicOrdering::Relaxed);
        self.pause().await;
        Ok(self.peek(kind, id))
    }

    async fn select(&self, kind: &str, selection: &Selection) -> Result<Vec<Record>, StorageError> {
        self.calls.selects.fetch_add(1, AtomicOrdering::Relaxed);
        self.pause().await;
        let mut rows: Vec<Record> = {
            let tables = self.tables.read();
            let Some(table) = tables.get(kind) else {
                return Ok(Vec::new());
            };
            table
                .values()
                .filter(|row| selection.predicate.as_ref().is_none_or(|p| eval_expr(p, row)))
                .cloned()
                .collect()
        };
        if !selection.sort.is_empty() {
            rows.sort_by(|a, b| compare_rows(&selection.sort, a, b));
        }
        Ok(rows
            .into_iter()
            .skip(selection.page.offset)
            .take(selection.page.limit)
            .collect())
    }

    async fn update(
        &self,
        kind: &str,
        id: &Value,
        changes: &Record,
    ) -> Result<Option<Record>, StorageError> {
        self.calls.updates.fetch_add(1, AtomicOrdering::Relaxed);
        self.pause().await;
        if let Some(schema) = self.catalog.kind(kind) {
            if changes.get(&schema.primary_key).is_some_and(|v| v != id) {
                return Err(StorageError::Execution(format!(
                    "{kind} primary key '{}' cannot change",
                    schema.primary_key
                )));
            }
        }
        let mut tables = self.tables.write();
        let Some(record) = tables.get_mut(kind).and_then(|t| t.get_mut(id)) else {
            return Ok(None);
        };
        for (name, value) in &changes.fields {
            record.insert(name.clone(), value.clone());
        }
        Ok(Some(record.clone()))
    }

    async fn delete(&self, kind: &str, id: &Value) -> Result<bool, StorageError> {
        self.calls.deletes.fetch_add(1, AtomicOrdering::Relaxed);
        self.pause().await;
        Ok(self
            .tables
            .write()
            .get_mut(kind)
            .is_some_and(|t| t.remove(id).is_some()))
    }
}

/// Evaluates a predicate against one row. A comparison with `null` tests for
/// absence (`==`) or presence (`!=`); other comparisons involving null, or
/// across incompatible types, are false.
pub fn eval_expr(expr: &Expr, row: &Record) -> bool {
    match expr {
        Expr::Cmp { field, op, value } => {
            let stored = row.get(field).filter(|v| !v.is_null());
            match (op, value) {
                (CmpOp::Eq, Value::Null) => stored.is_none(),
                (CmpOp::Ne, Value::Null) => stored.is_some(),
                _ => stored
                    .and_then(|rv| rv.compare(value))
                    .is_some_and(|ord| match op {
                        CmpOp::Eq => ord.is_eq(),
                        CmpOp::Ne => !ord.is_eq(),
                        CmpOp::Lt => ord.is_lt(),
                        CmpOp::Lte => ord.is_le(),
                        CmpOp::Gt => ord.is_gt(),
                        CmpOp::Gte => ord.is_ge(),
                    }),
            }
        }
        Expr::And(children) => children.iter().all(|c| eval_expr(c, row)),
        Expr::Or(children) => children.iter().any(|c| eval_expr(c, row)),
        Expr::Not(inner) => !eval_expr(inner, row),
    }
}

fn compare_rows(keys: &[SortKey], a: &Record, b: &Record) -> Ordering {
    for key in keys {
        let cmp = a
            .get(&key.field)
            .unwrap_or(&Value::Null)
            .cmp(b.get(&key.field).unwrap_or(&Value::Null));
        let ord = match key.order {
            Order::Asc => cmp,
            Order::Desc => cmp.reverse(),
        };
        if !ord.is_eq() {
            return ord;
        }
    }
    Ordering::Equal
}
