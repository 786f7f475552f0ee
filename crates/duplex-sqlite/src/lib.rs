//! SQLite-backed secondary store for Duplex
//!
//! Provides the relational side of the hybrid façade.
//!
//! Key features:
//! - One table per collection, created and widened on demand
//! - Values stored without type affinity so they read back unchanged
//! - Compiled predicates (`Eq`, raw SQL) for routed reads
//! - Durable reconciler checkpoints in the same database

pub mod checkpoint;
pub mod config;
pub mod schema;
pub mod store;

pub use checkpoint::SqliteCheckpointStore;
pub use config::{SqliteConfig, SynchronousMode};
pub use store::SqliteSecondaryStore;
