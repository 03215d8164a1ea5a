//! Data models for test execution
//!
//! Descriptors come from discovery, nodes are owned by the scheduler, and
//! results flow out to the reporting collaborator.

mod descriptor;
mod node;
mod result;
mod suite;

pub use descriptor::{
    Dependency, DependencyTarget, ExclusionKey, ParallelConstraint, ParallelLimit,
    TestDescriptor, DEFAULT_ASSEMBLY,
};
pub use node::{ExecutionNode, NodeState};
pub use result::{SkipReason, TestOutcome, TestResult};
pub(crate) use result::duration_ms;
pub use suite::{TestFilter, TestSuite};
