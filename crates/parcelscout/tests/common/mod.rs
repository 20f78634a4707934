//! Shared test utilities for parcelscout integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against a temporary database
//! - Scripted fakes for the data API, the browser capturer and the result sink
//! - Builders for raw source rows

pub mod builders;
pub mod fakes;
pub mod harness;

pub use builders::*;
pub use fakes::*;
pub use harness::{engine, TestHarness};
