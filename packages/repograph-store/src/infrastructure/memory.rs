//! In-memory adapter for GraphStore
//!
//! Nodes and relationships live in ordered maps keyed by their merge keys, so a
//! repeated upsert can never produce a second record. Every accepted write is also
//! appended to a write log that tests use to compare upsert keys across runs.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;

use crate::domain::{GraphNode, GraphRelationship, GraphStore, Properties, QueryPattern, Row};
use crate::error::{ErrorKind, Result, StorageError};

/// One accepted write
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteRecord {
    Node(String),
    Relationship {
        from: String,
        rel_type: String,
        to: String,
    },
}

#[derive(Default)]
struct GraphData {
    nodes: BTreeMap<String, GraphNode>,
    relationships: BTreeMap<(String, String, String), GraphRelationship>,
}

/// Process-local GraphStore
#[derive(Default)]
pub struct InMemoryGraphStore {
    data: RwLock<GraphData>,
    write_log: Mutex<Vec<WriteRecord>>,
    /// Remaining writes to reject, with the kind to reject them with
    injected_failures: Mutex<Option<(usize, ErrorKind)>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.data.read().nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.data.read().relationships.len()
    }

    pub fn node(&self, node_id: &str) -> Option<GraphNode> {
        self.data.read().nodes.get(node_id).cloned()
    }

    pub fn relationship(&self, from: &str, rel_type: &str, to: &str) -> Option<GraphRelationship> {
        self.data
            .read()
            .relationships
            .get(&(from.to_string(), rel_type.to_string(), to.to_string()))
            .cloned()
    }

    pub fn nodes_with_label(&self, label: &str) -> Vec<GraphNode> {
        self.data
            .read()
            .nodes
            .values()
            .filter(|n| n.has_label(label))
            .cloned()
            .collect()
    }

    /// Total accepted writes (nodes + relationships)
    pub fn upsert_count(&self) -> usize {
        self.write_log.lock().len()
    }

    /// Accepted writes in arrival order
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.write_log.lock().clone()
    }

    /// Sorted, deduplicated keys written so far
    pub fn written_keys(&self) -> Vec<WriteRecord> {
        let mut keys = self.write_log();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn clear_write_log(&self) {
        self.write_log.lock().clear();
    }

    /// Reject the next `count` writes with `kind`
    pub fn fail_next_writes(&self, count: usize, kind: ErrorKind) {
        *self.injected_failures.lock() = Some((count, kind));
    }

    fn check_injected_failure(&self) -> Result<()> {
        let mut injected = self.injected_failures.lock();
        match injected.take() {
            Some((remaining, kind)) if remaining > 0 => {
                if remaining > 1 {
                    *injected = Some((remaining - 1, kind));
                }
                Err(StorageError::new(kind, "injected write failure"))
            }
            _ => Ok(()),
        }
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(StorageError::invalid_query("identifier must not be empty"));
    }
    Ok(())
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_node(
        &self,
        node_id: &str,
        labels: &[&str],
        properties: Properties,
    ) -> Result<()> {
        validate_id(node_id)?;
        self.check_injected_failure()?;

        {
            let mut data = self.data.write();
            data.nodes
                .entry(node_id.to_string())
                .or_insert_with(|| GraphNode::new(node_id, &[]))
                .merge(labels, properties);
        }

        self.write_log
            .lock()
            .push(WriteRecord::Node(node_id.to_string()));
        Ok(())
    }

    async fn upsert_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        rel_type: &str,
        properties: Properties,
    ) -> Result<()> {
        validate_id(from_id)?;
        validate_id(to_id)?;
        if rel_type.is_empty() {
            return Err(StorageError::invalid_query("relationship type must not be empty"));
        }
        self.check_injected_failure()?;

        {
            let mut data = self.data.write();
            if !data.nodes.contains_key(from_id) || !data.nodes.contains_key(to_id) {
                return Err(StorageError::dangling_relationship(from_id, to_id, rel_type));
            }

            let key = (from_id.to_string(), rel_type.to_string(), to_id.to_string());
            data.relationships
                .entry(key)
                .or_insert_with(|| GraphRelationship::new(from_id, to_id, rel_type))
                .properties
                .extend(properties);
        }

        self.write_log.lock().push(WriteRecord::Relationship {
            from: from_id.to_string(),
            rel_type: rel_type.to_string(),
            to: to_id.to_string(),
        });
        Ok(())
    }

    async fn query(&self, pattern: &QueryPattern) -> Result<Vec<Row>> {
        let data = self.data.read();
        let rows = match pattern {
            QueryPattern::NodeById(id) => data.nodes.get(id).map(Row::from_node).into_iter().collect(),
            QueryPattern::NodesByLabel(label) => data
                .nodes
                .values()
                .filter(|n| n.has_label(label))
                .map(Row::from_node)
                .collect(),
            QueryPattern::RelationshipsByType(rel_type) => data
                .relationships
                .values()
                .filter(|r| &r.rel_type == rel_type)
                .map(Row::from_relationship)
                .collect(),
        };
        Ok(rows)
    }
}
