//! Shared test utilities for docflow integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a store, an in-memory broker and the pipeline
//!   stages so tests can step deliveries by hand
//! - Scripted capabilities whose behavior is driven by the page bytes

pub mod capabilities;
pub mod harness;

pub use capabilities::*;
pub use harness::TestHarness;
