pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod permission;
pub mod query;
pub mod service;
pub mod storage;

pub use crate::cache::key::{CacheKeyBuilder, KeyContext};
pub use crate::cache::store::{CacheStore, MemoryStore};
pub use crate::cache::{CacheError, CacheMetrics, build_store};
pub use crate::catalog::Catalog;
pub use crate::catalog::schema::{KindSchema, KindSpec};
pub use crate::catalog::types::{Record, ScalarType, Value};
pub use crate::config::{CacheConfig, ServiceConfig, StoreKind};
pub use crate::error::{Error, ErrorCode, Status};
pub use crate::permission::{Mask, Relationship, RelationshipResolver, RequesterContext};
pub use crate::query::QueryParams;
pub use crate::service::{Page, QueryService};
pub use crate::storage::memory::MemoryExecutor;
pub use crate::storage::{RecordExecutor, StorageError};
