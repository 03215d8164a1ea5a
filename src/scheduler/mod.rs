//! Dependency- and constraint-aware parallel scheduler
//!
//! A single coordinator task owns admission. It walks nodes in declaration
//! order, moves them through `Pending -> Blocked -> Runnable -> Running`,
//! and hands admitted nodes to a [`NodeRunner`]. Every completion triggers a
//! rescan, so no wakeup can be lost between a predecessor finishing and its
//! dependents being considered.

mod constraints;
mod coordinator;

pub use constraints::{ConstraintTracker, Lease};
pub use coordinator::Coordinator;

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::invoke::CancellationToken;
use crate::models::{ExecutionNode, TestResult};

/// What an admitted node's attempt produced
#[derive(Clone, Debug)]
pub enum Verdict {
    /// The attempt failed retryably; re-admit the node
    Retry,
    /// The node reached a terminal outcome
    Finished(TestResult),
}

/// Executes admitted nodes on behalf of the coordinator
pub trait NodeRunner: Send + Sync + 'static {
    /// Run one attempt of an admitted node
    fn run(&self, node: Arc<ExecutionNode>, session: CancellationToken) -> BoxFuture<'static, Verdict>;

    /// Release whatever a node still holds once it is terminal
    ///
    /// Called exactly once per node, whether or not it ever ran.
    fn settle(&self, node: Arc<ExecutionNode>, session: CancellationToken) -> BoxFuture<'static, ()>;

    /// Publish a terminal result
    fn report(&self, result: TestResult);
}
