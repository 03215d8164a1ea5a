//! Dependency graph resolution
//!
//! Builds the `DependsOn` graph once before scheduling, fails the tests
//! taking part in cycles, and answers "is this test unblocked yet" for the
//! scheduler.

mod analysis;
mod builder;

pub use analysis::{execution_levels, find_cycles, Cycle};
pub use builder::{DependencyEdge, DependencyGraph, Readiness};
