//! Domain layer for GraphStore
//!
//! # Domain Models
//!
//! - `GraphNode`: labelled node keyed by a stable identifier
//! - `GraphRelationship`: typed edge keyed by `(from, type, to)`
//! - `QueryPattern` / `Row`: the minimal read surface the pipeline needs
//!
//! # Port Trait
//!
//! - `GraphStore`: upsert-only property-graph abstraction
//!
//! # Examples
//!
//! ```rust,ignore
//! use repograph_store::domain::{GraphStore, Properties, QueryPattern};
//!
//! async fn example(store: impl GraphStore) -> Result<()> {
//!     store.upsert_node("repo:demo", &["Repository"], Properties::new()).await?;
//!     store.upsert_node("dir:demo/src", &["Directory"], Properties::new()).await?;
//!     store
//!         .upsert_relationship("repo:demo", "dir:demo/src", "CONTAINS", Properties::new())
//!         .await?;
//!
//!     let rows = store.query(&QueryPattern::RelationshipsByType("CONTAINS".into())).await?;
//!     assert_eq!(rows.len(), 1);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::Result;

/// Node labels written by the ingestion stages
pub mod labels {
    pub const REPOSITORY: &str = "Repository";
    pub const DIRECTORY: &str = "Directory";
    pub const FILE: &str = "File";
    pub const SYMBOL: &str = "Symbol";
    pub const SUMMARY: &str = "Summary";
}

/// Relationship types written by the ingestion stages
pub mod relationships {
    /// Parent → child containment (repository → directory → file → symbol)
    pub const CONTAINS: &str = "CONTAINS";
    /// Summary → summarized node
    pub const DESCRIBES: &str = "DESCRIBES";
}

/// Property bag attached to nodes and relationships
pub type Properties = BTreeMap<String, Value>;

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// Graph node identified by its merge key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Merge key (stable across runs)
    pub id: String,
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, labels: &[&str]) -> Self {
        Self {
            id: id.into(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            properties: Properties::new(),
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Merge labels and properties into this node (upsert semantics)
    ///
    /// Labels are unioned; properties present in `properties` overwrite existing values,
    /// properties absent from it are kept.
    pub fn merge(&mut self, labels: &[&str], properties: Properties) {
        self.labels.extend(labels.iter().map(|l| l.to_string()));
        self.properties.extend(properties);
    }
}

/// Typed relationship, unique per `(from, rel_type, to)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub from: String,
    pub to: String,
    pub rel_type: String,
    #[serde(default)]
    pub properties: Properties,
}

impl GraphRelationship {
    pub fn new(from: impl Into<String>, to: impl Into<String>, rel_type: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            rel_type: rel_type.into(),
            properties: Properties::new(),
        }
    }

    /// Merge key of this relationship
    pub fn key(&self) -> (String, String, String) {
        (self.from.clone(), self.rel_type.clone(), self.to.clone())
    }
}

/// Read patterns supported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum QueryPattern {
    /// Single node by merge key (0 or 1 rows)
    NodeById(String),
    /// All nodes carrying a label
    NodesByLabel(String),
    /// All relationships of a type
    RelationshipsByType(String),
}

/// One query result row
///
/// Node rows carry `id`, `labels` and `properties`; relationship rows carry
/// `from`, `to`, `type` and `properties`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub columns: BTreeMap<String, Value>,
}

impl Row {
    pub fn from_node(node: &GraphNode) -> Self {
        let mut columns = BTreeMap::new();
        columns.insert("id".to_string(), Value::String(node.id.clone()));
        columns.insert(
            "labels".to_string(),
            Value::Array(node.labels.iter().cloned().map(Value::String).collect()),
        );
        columns.insert(
            "properties".to_string(),
            Value::Object(node.properties.clone().into_iter().collect()),
        );
        Self { columns }
    }

    pub fn from_relationship(rel: &GraphRelationship) -> Self {
        let mut columns = BTreeMap::new();
        columns.insert("from".to_string(), Value::String(rel.from.clone()));
        columns.insert("to".to_string(), Value::String(rel.to.clone()));
        columns.insert("type".to_string(), Value::String(rel.rel_type.clone()));
        columns.insert(
            "properties".to_string(),
            Value::Object(rel.properties.clone().into_iter().collect()),
        );
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.columns.get(column).and_then(Value::as_str)
    }

    /// Property of the node/relationship this row describes
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.columns
            .get("properties")
            .and_then(Value::as_object)
            .and_then(|props| props.get(key))
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.property(key).and_then(Value::as_str)
    }

    /// Owned copy of the property bag
    pub fn properties(&self) -> Properties {
        self.columns
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.columns
            .get("labels")
            .and_then(Value::as_array)
            .map_or(false, |labels| labels.iter().any(|l| l.as_str() == Some(label)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Property-graph store with merge-by-identifier writes
///
/// Every write must be an upsert: repeating a write with the same key updates the
/// existing record in place. Callers rely on this to make retried stages and
/// repeated incremental updates idempotent.
///
/// # Implementations
///
/// - `InMemoryGraphStore`: process-local backend (tests, single-node runs)
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create the node if absent, otherwise merge labels and properties into it
    async fn upsert_node(&self, node_id: &str, labels: &[&str], properties: Properties)
        -> Result<()>;

    /// Create the relationship if absent, otherwise merge its properties
    ///
    /// # Errors
    ///
    /// Returns `DanglingRelationship` if either endpoint does not exist
    async fn upsert_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        rel_type: &str,
        properties: Properties,
    ) -> Result<()>;

    /// Run a read pattern
    async fn query(&self, pattern: &QueryPattern) -> Result<Vec<Row>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
