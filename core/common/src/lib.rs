//! Common utilities and types shared across the jobtrack crates.
//!
//! This module provides the error taxonomy and the record data model that
//! the storage chain and the sync engine agree on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Record, RecordId, RecordKind, SyncStatus};
