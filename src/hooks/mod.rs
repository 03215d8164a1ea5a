//! Hook registration and scope orchestration
//!
//! Hooks run before and after tests at four granularities. The
//! [`HookOrchestrator`] guarantees that each scope's before hooks complete
//! exactly once before any test in it starts, and that its after hooks run
//! exactly once after the last test in it finishes.

mod orchestrator;
mod registry;

pub use orchestrator::HookOrchestrator;
pub use registry::{Hook, HookRegistry};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Granularity a hook runs at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookScopeKind {
    Session,
    Assembly,
    Class,
    Test,
}

impl fmt::Display for HookScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookScopeKind::Session => write!(f, "Session"),
            HookScopeKind::Assembly => write!(f, "Assembly"),
            HookScopeKind::Class => write!(f, "Class"),
            HookScopeKind::Test => write!(f, "Test"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    Before,
    After,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Before => write!(f, "before"),
            HookPhase::After => write!(f, "after"),
        }
    }
}

/// Which scope instances a hook applies to
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTarget {
    /// Every instance of the hook's scope kind
    #[default]
    Everywhere,
    Assembly(String),
    Class(String),
}

impl HookTarget {
    /// Nesting depth used to order test-level hooks, or `None` if the target
    /// does not cover the given class and assembly
    pub(crate) fn tier(&self, class: &str, assembly: &str) -> Option<u8> {
        match self {
            HookTarget::Everywhere => Some(0),
            HookTarget::Assembly(a) if a == assembly => Some(1),
            HookTarget::Class(c) if c == class => Some(2),
            _ => None,
        }
    }
}
