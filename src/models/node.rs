//! Execution nodes and their state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use super::descriptor::TestDescriptor;
use crate::utils::lock;

/// Scheduling state of a node
///
/// `Pending -> Blocked -> Runnable -> Running -> {Passed, Failed, Skipped, Cancelled}`,
/// plus `Running -> Pending` on retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum NodeState {
    Pending = 0,
    Blocked = 1,
    Runnable = 2,
    Running = 3,
    Passed = 4,
    Failed = 5,
    Skipped = 6,
    Cancelled = 7,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeState::Pending,
            1 => NodeState::Blocked,
            2 => NodeState::Runnable,
            3 => NodeState::Running,
            4 => NodeState::Passed,
            5 => NodeState::Failed,
            6 => NodeState::Skipped,
            _ => NodeState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Passed | NodeState::Failed | NodeState::Skipped | NodeState::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (Pending, Blocked | Runnable | Failed | Skipped | Cancelled) => true,
            (Blocked, Runnable | Skipped | Cancelled) => true,
            (Runnable, Running | Skipped | Cancelled) => true,
            (Running, Pending | Passed | Failed | Skipped | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Pending => "pending",
            NodeState::Blocked => "blocked",
            NodeState::Runnable => "runnable",
            NodeState::Running => "running",
            NodeState::Passed => "passed",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
            NodeState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct Timestamps {
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

/// Mutable scheduling wrapper around a [`TestDescriptor`]
///
/// State changes go through compare-and-swap so only the holder of the
/// current state may move the node forward.
pub struct ExecutionNode {
    pub index: usize,
    pub descriptor: Arc<TestDescriptor>,
    state: AtomicU8,
    attempts: AtomicU32,
    timestamps: Mutex<Timestamps>,
}

impl ExecutionNode {
    pub fn new(index: usize, descriptor: Arc<TestDescriptor>) -> Self {
        Self {
            index,
            descriptor,
            state: AtomicU8::new(NodeState::Pending as u8),
            attempts: AtomicU32::new(0),
            timestamps: Mutex::new(Timestamps::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `from -> to`; fails if the node is no longer in `from` or the
    /// transition is illegal
    pub fn transition(&self, from: NodeState, to: NodeState) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if swapped {
            let mut ts = lock(&self.timestamps);
            if to == NodeState::Running && ts.started_at.is_none() {
                ts.started_at = Some(Utc::now());
            }
            if to.is_terminal() {
                ts.ended_at = Some(Utc::now());
            }
        }
        swapped
    }

    /// Move from the current state to `to`, whatever it is
    pub fn advance(&self, to: NodeState) -> bool {
        let from = self.state();
        self.transition(from, to)
    }

    /// Record the start of a new attempt, returning its 1-based number
    pub fn begin_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.timestamps).started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.timestamps).ended_at
    }
}

impl fmt::Debug for ExecutionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionNode")
            .field("index", &self.index)
            .field("id", &self.descriptor.id)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ExecutionNode {
        let desc = TestDescriptor::new("t", "C", |_ctx, _cancel| async { Ok(()) });
        ExecutionNode::new(0, Arc::new(desc))
    }

    #[test]
    fn test_forward_transitions() {
        let node = node();
        assert_eq!(node.state(), NodeState::Pending);
        assert!(node.transition(NodeState::Pending, NodeState::Blocked));
        assert!(node.transition(NodeState::Blocked, NodeState::Runnable));
        assert!(node.transition(NodeState::Runnable, NodeState::Running));
        assert!(node.started_at().is_some());
        assert!(node.transition(NodeState::Running, NodeState::Passed));
        assert!(node.ended_at().is_some());
    }

    #[test]
    fn test_no_backward_transitions() {
        let node = node();
        assert!(node.transition(NodeState::Pending, NodeState::Runnable));
        assert!(!node.transition(NodeState::Runnable, NodeState::Blocked));
        assert!(!node.transition(NodeState::Runnable, NodeState::Pending));
        assert_eq!(node.state(), NodeState::Runnable);
    }

    #[test]
    fn test_retry_returns_to_pending() {
        let node = node();
        assert!(node.advance(NodeState::Runnable));
        assert!(node.advance(NodeState::Running));
        assert_eq!(node.begin_attempt(), 1);
        assert!(node.transition(NodeState::Running, NodeState::Pending));
        assert!(node.advance(NodeState::Runnable));
        assert!(node.advance(NodeState::Running));
        assert_eq!(node.begin_attempt(), 2);
    }

    #[test]
    fn test_terminal_is_final() {
        let node = node();
        assert!(node.advance(NodeState::Skipped));
        for next in [
            NodeState::Pending,
            NodeState::Running,
            NodeState::Passed,
            NodeState::Cancelled,
        ] {
            assert!(!node.advance(next));
        }
    }

    #[test]
    fn test_stale_compare_and_swap_fails() {
        let node = node();
        assert!(node.transition(NodeState::Pending, NodeState::Runnable));
        assert!(!node.transition(NodeState::Pending, NodeState::Skipped));
    }
}
