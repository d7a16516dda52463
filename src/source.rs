//! Interfaces to the upstream data source.
//!
//! The engine only needs two things from upstream: the complete set of
//! records matching a dataset query, and the block history of a partition. Both are
//! traits so the runner can be driven by in-process fakes in tests.

use crate::block::Block;
use crate::record::Record;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    /// The upstream answered with query errors (retryable)
    Query(String),
    /// Network or HTTP failure
    Transport(String),
    /// The upstream answer could not be understood
    Decode(String),
}

impl SourceError {
    /// Only well-formed query errors are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Query(_))
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Query(e) => write!(f, "query error: {}", e),
            SourceError::Transport(e) => write!(f, "transport error: {}", e),
            SourceError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for SourceError {}

/// Field selection for one dataset. Nested fields are written as dotted
/// paths (`dao.id`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetQuery {
    pub entity: String,
    pub fields: Vec<String>,
    /// Static filters added to every request
    pub filters: BTreeMap<String, serde_json::Value>,
}

impl DatasetQuery {
    pub fn new(entity: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            entity: entity.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.filters.insert(key.to_string(), value);
        self
    }

    /// A query can be built when it names an entity and selects its id
    pub fn validate(&self) -> Result<(), String> {
        if self.entity.trim().is_empty() {
            return Err("query has no entity".to_string());
        }
        if !self.fields.iter().any(|f| f == "id") {
            return Err(format!("query on {} does not select id", self.entity));
        }
        if let Some(bad) = self.fields.iter().find(|f| f.split('.').any(str::is_empty)) {
            return Err(format!("query on {} has malformed field {:?}", self.entity, bad));
        }
        Ok(())
    }
}

/// One dataset fetch, optionally pinned to a block and narrowed to records
/// changed since a previous block
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub query: &'a DatasetQuery,
    pub partition: &'a str,
    pub at_block: Option<&'a Block>,
    pub changed_since: Option<&'a Block>,
}

pub trait RecordSource {
    /// Fetch every matching record; pagination is the source's concern
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<Vec<Record>, SourceError>;

    /// Whether the source has the credentials it needs
    fn has_credentials(&self) -> bool {
        true
    }
}

/// Block lookup, newest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockQuery {
    pub first: usize,
    pub skip: Option<usize>,
    pub number_gte: Option<u64>,
    pub timestamp_lte: Option<DateTime<Utc>>,
}

pub trait BlockSource {
    fn query_blocks(&self, partition: &str, query: &BlockQuery) -> Result<Vec<Block>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_query_errors_are_retryable() {
        assert!(SourceError::Query("timeout".into()).is_retryable());
        assert!(!SourceError::Transport("refused".into()).is_retryable());
        assert!(!SourceError::Decode("bad json".into()).is_retryable());
    }

    #[test]
    fn test_query_validation() {
        assert!(DatasetQuery::new("daos", &["id", "name", "nativeToken.id"]).validate().is_ok());
        assert!(DatasetQuery::new("", &["id"]).validate().is_err());
        assert!(DatasetQuery::new("daos", &["name"]).validate().is_err());
        assert!(DatasetQuery::new("daos", &["id", "dao..id"]).validate().is_err());
    }
}
