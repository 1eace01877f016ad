//! Infrastructure layer - Storage adapters
//!
//! - `memory`: process-local upsert backend

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{InMemoryGraphStore, WriteRecord};
