//! GraphStore - property-graph port consumed by the ingestion pipeline
//!
//! ## Core Principles
//!
//! 1. **Merge, never create**: every write is an upsert keyed by a stable identifier
//! 2. **Node identity**: `node_id` is the merge key shared by every stage that writes the node
//! 3. **Commutative writes**: concurrent or retried upserts of the same key converge
//!
//! ## Usage
//!
//! ```rust,ignore
//! use repograph_store::{GraphStore, InMemoryGraphStore, Properties, QueryPattern};
//!
//! let store = InMemoryGraphStore::new();
//!
//! // 1. Upsert nodes (idempotent)
//! store.upsert_node("file:src/lib.rs", &["File"], Properties::new()).await?;
//! store.upsert_node("dir:src", &["Directory"], Properties::new()).await?;
//!
//! // 2. Upsert relationships (idempotent)
//! store.upsert_relationship("dir:src", "file:src/lib.rs", "CONTAINS", Properties::new()).await?;
//!
//! // 3. Query
//! let rows = store.query(&QueryPattern::NodesByLabel("File".into())).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    labels, relationships, GraphNode, GraphRelationship, GraphStore, Properties, QueryPattern,
    Row,
};

#[cfg(feature = "memory")]
pub use infrastructure::{InMemoryGraphStore, WriteRecord};
