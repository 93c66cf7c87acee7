//! Local persistence for jobtrack.
//!
//! This module provides a trait-based key-value interface for the local
//! backends a context can write to (in-memory, per-key files, SQLite), a
//! registry for building backends from configuration, and the store chain
//! that writes records through the backends in priority order.
//!
//! # Design Principles
//! - Graceful degradation: a write falls through to the next tier when a
//!   backend is absent, over quota or failing
//! - One key per record: a status change is a single-key write
//! - Change detection: backends that can publish native change events do so;
//!   every write also bumps a last-write marker for polling contexts

pub mod backend;
pub mod chain;
pub mod local;
pub mod memory;
pub mod registry;
pub mod sqlite;

pub use backend::{ChangeEvent, KvBackend};
pub use chain::{
    kind_scope, record_key, LastWrite, StoreChain, WriteReceipt, LAST_WRITE_KEY, RECORD_PREFIX,
};
pub use local::FileBackend;
pub use memory::MemoryBackend;
pub use registry::{BackendFactory, BackendRegistry};
pub use sqlite::SqliteBackend;
