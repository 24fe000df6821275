use crate::cache::{CacheError, encode};
use crate::catalog::types::Value;
use crate::permission::{Relationship, RequesterContext};
use crate::query::plan::{CompiledQuery, Expr, Pagination, SortKey};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Whose view a cached list payload represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum KeyContext {
    /// Unprojected rows, valid for every requester.
    Shared,
    /// A payload already redacted for one requester.
    Requester {
        caller: Option<Value>,
        relationship: Relationship,
    },
}

impl KeyContext {
    pub fn for_requester(requester: &RequesterContext, relationship: Relationship) -> Self {
        KeyContext::Requester {
            caller: requester.caller_id.clone(),
            relationship,
        }
    }
}

#[derive(Serialize)]
struct Fingerprint<'a> {
    kind: &'a str,
    predicate: Option<Expr>,
    sort: &'a [SortKey],
    page: Pagination,
    fields: Vec<&'a str>,
    context: &'a KeyContext,
}

/// Derives deterministic cache keys.
///
/// Layout: `{ns}:{kind}:id:{tagged id}` for point reads and
/// `{ns}:{kind}:list:{sha256}` for list reads, so a kind's list entries can
/// be dropped with one prefix pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyBuilder {
    namespace: String,
}

impl CacheKeyBuilder {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn point_key(&self, kind: &str, id: &Value) -> String {
        format!("{}:{kind}:id:{}", self.namespace, tagged_id(id))
    }

    /// Keys a list read. Clause order, duplicate clauses and field order in
    /// the request do not change the key.
    pub fn list_key(
        &self,
        kind: &str,
        query: &CompiledQuery,
        context: &KeyContext,
    ) -> Result<String, CacheError> {
        let mut fields: Vec<&str> = query.fields.iter().map(String::as_str).collect();
        fields.sort_unstable();
        fields.dedup();
        let fingerprint = Fingerprint {
            kind,
            predicate: query.selection.predicate.as_ref().map(Expr::canonical),
            sort: &query.selection.sort,
            page: query.selection.page,
            fields,
            context,
        };
        let digest = Sha256::digest(encode(&fingerprint)?);
        Ok(format!("{}:{kind}:list:{}", self.namespace, hex::encode(digest)))
    }

    pub fn list_pattern(&self, kind: &str) -> String {
        format!("{}:{kind}:list:*", self.namespace)
    }

    pub fn kind_pattern(&self, kind: &str) -> String {
        format!("{}:{kind}:*", self.namespace)
    }
}

/// Type-tagged rendering, so `1` and `'1'` never share a key.
fn tagged_id(id: &Value) -> String {
    match id {
        Value::Integer(v) => format!("i:{v}"),
        Value::Text(v) => format!("s:{v}"),
        Value::Float(v) => format!("f:{v:?}"),
        Value::Boolean(v) => format!("b:{v}"),
        Value::Null => "n".to_string(),
    }
}
