//! Output formatting module
//!
//! Renders run summaries as a table, JSON, or a one-line summary.

mod formatter;

pub use formatter::{write_summary_to_file, OutputFormat, ResultFormatter};
