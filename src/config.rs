use crate::error::Error;
use crate::query::QueryLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    /// Shared Redis-compatible store.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub store: StoreKind,
    pub ttl_ms: u64,
    pub max_entries: usize,
    /// Prefix of every key this service writes, so a shared store can be
    /// cleared without touching other tenants.
    pub namespace: String,
    pub redis_url: Option<String>,
    pub op_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            ttl_ms: 5 * 60 * 1000,
            max_entries: 10_000,
            namespace: "Cache".into(),
            redis_url: None,
            op_timeout_ms: 250,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Runtime configuration of a [`crate::service::QueryService`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub cache: CacheConfig,
    pub storage_timeout_ms: u64,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub max_page: usize,
    pub max_filter_len: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let limits = QueryLimits::default();
        Self {
            cache: CacheConfig::default(),
            storage_timeout_ms: 5_000,
            default_page_size: limits.default_page_size,
            max_page_size: limits.max_page_size,
            max_page: limits.max_page,
            max_filter_len: limits.max_filter_len,
        }
    }
}

impl ServiceConfig {
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::InvalidConfig {
            message: format!("service config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn limits(&self) -> QueryLimits {
        QueryLimits {
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
            max_page: self.max_page,
            max_filter_len: self.max_filter_len,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: &str| {
            Err(Error::InvalidConfig {
                message: message.into(),
            })
        };
        if self.storage_timeout_ms == 0 {
            return invalid("storage_timeout_ms must be > 0");
        }
        if self.max_page_size == 0 {
            return invalid("max_page_size must be > 0");
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return invalid("default_page_size must be > 0 and <= max_page_size");
        }
        if self.max_page == 0 {
            return invalid("max_page must be > 0");
        }
        if self.max_filter_len == 0 {
            return invalid("max_filter_len must be > 0");
        }
        let cache = &self.cache;
        if cache.ttl_ms == 0 {
            return invalid("cache.ttl_ms must be > 0");
        }
        if cache.op_timeout_ms == 0 {
            return invalid("cache.op_timeout_ms must be > 0");
        }
        if cache.namespace.is_empty()
            || cache
                .namespace
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '*' | '?' | '[' | ']' | ':'))
        {
            return invalid("cache.namespace must be non-empty and free of ':' and glob characters");
        }
        match cache.store {
            StoreKind::Memory if cache.max_entries == 0 => {
                invalid("cache.max_entries must be > 0 for the memory store")
            }
            StoreKind::External if cache.redis_url.as_deref().is_none_or(str::is_empty) => {
                invalid("cache.redis_url is required for the external store")
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ServiceConfig, StoreKind};
    use crate::error::ErrorCode;

    #[test]
    fn defaults_are_valid() {
        let config = ServiceConfig::default();
        config.validate().expect("default config");
        assert_eq!(config.default_page_size, 5);
        assert_eq!(config.max_page_size, 100);
    }

    #[test]
    fn json_overrides_merge_with_defaults() {
        let config = ServiceConfig::from_json_str(
            r#"{ "cache": { "store": "external", "redis_url": "redis://127.0.0.1/", "ttl_ms": 1000 },
                 "max_page_size": 50 }"#,
        )
        .expect("config");
        assert_eq!(config.cache.store, StoreKind::External);
        assert_eq!(config.cache.ttl_ms, 1000);
        assert_eq!(config.cache.namespace, "Cache");
        assert_eq!(config.max_page_size, 50);
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        for json in [
            r#"{ "cache": { "store": "external" } }"#,
            r#"{ "cache": { "namespace": "a:b" } }"#,
            r#"{ "default_page_size": 200 }"#,
            r#"{ "storage_timeout_ms": 0 }"#,
            r#"{ "cache": { "store": "disk" } }"#,
        ] {
            let err = ServiceConfig::from_json_str(json).expect_err(json);
            assert_eq!(err.code(), ErrorCode::InvalidConfig, "{json}");
        }
    }
}
