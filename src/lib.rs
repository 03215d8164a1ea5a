//! Trellis - dependency- and constraint-aware parallel test execution
//!
//! Given discovered test descriptors, the engine runs each test's setup
//! hooks, body and teardown hooks while honoring concurrency constraints,
//! cross-test dependencies, shared fixture lifecycles, retries and timeouts.
//!
//! ## Example
//!
//! ```no_run
//! use trellis::{EngineConfig, TestDescriptor, TestEngine, TestSuite};
//!
//! # async fn demo() -> trellis::Result<()> {
//! let suite = TestSuite::new()
//!     .test(TestDescriptor::new("connects", "Db", |_ctx, _cancel| async { Ok(()) }))
//!     .test(
//!         TestDescriptor::new("migrates", "Db", |_ctx, _cancel| async { Ok(()) })
//!             .depends_on(trellis::models::Dependency::on_test("connects"))
//!             .not_in_parallel("db"),
//!     );
//!
//! let summary = TestEngine::new(EngineConfig::default()).run(suite).await?;
//! assert!(summary.is_success());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod fixtures;
pub mod graph;
pub mod hooks;
pub mod invoke;
pub mod manifest;
pub mod models;
pub mod output;
pub mod reporting;
pub mod scheduler;
pub mod utils;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use executor::TestEngine;
pub use invoke::{CancellationToken, CapturedError, InvokeContext};
pub use models::{TestDescriptor, TestFilter, TestOutcome, TestResult, TestSuite};
pub use reporting::{EventSink, ReportEvent, RunSummary};
