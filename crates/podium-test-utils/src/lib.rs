//! Shared test utilities for Podium integration tests.
//!
//! This crate provides:
//! - [`TracingTableBackend`]: In-memory table backend with operation recording
//!   and fault injection
//! - [`TestContext`]: Pre-wired backend, queue and invoker
//! - Factory functions for score events
//!
//! # Example
//!
//! ```rust,ignore
//! use podium_test_utils::{tagged_event, TestContext};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::new();
//!     let outcome = ctx.pipeline().update_scores(&[tagged_event("u1", 50)]).await;
//!     assert!(outcome.all_committed());
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod storage;

pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("podium=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
