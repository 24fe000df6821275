pub mod error;
pub mod filter;
pub mod plan;
pub mod projection;

use serde::{Deserialize, Serialize};

/// Raw, untrusted query-string parameters of a read request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub fields: Option<String>,
    pub page: Option<String>,
    pub size: Option<String>,
    pub offset: Option<String>,
    pub limit: Option<String>,
}

impl QueryParams {
    /// Collects recognised parameters from URL-decoded pairs. Unknown keys are
    /// ignored and a repeated key keeps its last value.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        pairs
            .into_iter()
            .fold(Self::default(), |params, (key, value)| params.with(key.as_ref(), value))
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        let slot = match key {
            "filter" => &mut self.filter,
            "sort" => &mut self.sort,
            "fields" => &mut self.fields,
            "page" => &mut self.page,
            "size" => &mut self.size,
            "offset" => &mut self.offset,
            "limit" => &mut self.limit,
            _ => return self,
        };
        *slot = Some(value.into());
        self
    }

    pub fn filter(self, text: impl Into<String>) -> Self {
        self.with("filter", text)
    }

    pub fn fields(self, text: impl Into<String>) -> Self {
        self.with("fields", text)
    }

    pub fn sort(self, text: impl Into<String>) -> Self {
        self.with("sort", text)
    }
}

/// Bounds applied while compiling untrusted parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub max_page: usize,
    pub max_filter_len: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_page_size: 5,
            max_page_size: 100,
            max_page: 10_000,
            max_filter_len: 4096,
        }
    }
}
