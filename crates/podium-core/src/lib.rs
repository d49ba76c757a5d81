//! # podium-core
//!
//! Core abstractions for the Podium faceted leaderboard store.
//!
//! This crate provides the foundational types and traits used across all Podium components:
//!
//! - **Facets**: Time windows and categorical dimensions of a score
//! - **Canonical Keys**: Deterministic partition identity of a facet combination
//! - **Score Blocks**: Logarithmic buckets backing the top-N secondary index
//! - **Table Backend**: Abstract key-value store contract with conditional writes
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use chrono::Utc;
//! use podium_core::prelude::*;
//!
//! let facets = FacetSet::new()
//!     .with_time(TimeGranularity::AllTime, Utc::now())
//!     .with_generic("organisation", "acme");
//!
//! let key = facets.canonical_key();
//! assert_eq!(key, "_(allTime-AT)_(organisation-acme)");
//! assert_eq!(score_block_key(&key, 1000), "_(allTime-AT)_(organisation-acme)_6");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod facet;
pub mod keys;
pub mod observability;
pub mod table;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use podium_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::facet::{canonical_key, time_facet_value, Facet, FacetSet, TimeGranularity};
    pub use crate::keys::{block_index_key, score_block, score_block_key};
    pub use crate::table::{
        Item, ItemKey, MemoryTableBackend, ProvisionedCapacity, ReadConsistency, TableBackend,
        WriteCondition, WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use facet::{canonical_key, time_facet_value, Facet, FacetSet, TimeGranularity};
pub use keys::{
    block_index_key, score_block, score_block_key, DEFAULT_MAX_RECOGNIZABLE_SCORE,
};
pub use observability::{init_logging, LogFormat};
pub use table::{
    BatchGetOutput, BatchPutOutput, Item, ItemKey, MemoryTableBackend, ProvisionedCapacity,
    ReadConsistency, TableBackend, WriteCondition, WriteResult,
};
