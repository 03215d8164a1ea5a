//! Test execution
//!
//! [`TestEngine`] runs a whole session; [`RetrySupervisor`] runs single
//! attempts under their deadline and decides whether to retry.

mod engine;
mod supervisor;

pub use engine::TestEngine;
pub use supervisor::RetrySupervisor;
