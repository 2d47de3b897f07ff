//! Concprobe workspace-level test utilities.
//!
//! This crate exists solely to support workspace-level integration tests,
//! particularly the BDD/cucumber tests in `tests/cucumber.rs`.
//!
//! The actual concprobe functionality is in the workspace member crates:
//! - `concprobe-types`: Shared types, the stats artifact, and JSON schemas
//! - `concprobe-domain`: Pure search logic
//! - `concprobe-adapters`: Process execution and cluster capabilities
//! - `concprobe-config`: Config file loading and resolution
//! - `concprobe-fake`: In-memory cluster and workload for tests
//! - `concprobe-app`: Crash monitor, prober, and the search use case
//! - `concprobe` (concprobe-cli): CLI interface
