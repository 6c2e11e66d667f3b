//! Test utilities for the benchmark harness.
//!
//! This crate provides a mock function server standing in for the processing functions, and a
//! tracing initializer for tests. See the modules for all available utilities.

pub mod server;
pub mod tracing;
