//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Dependency- and constraint-aware parallel test runner
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(version)]
#[command(about = "Run test manifests with dependencies, fixtures, hooks and retries")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (default: ./trellis.yaml, then ~/.config/trellis/config.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a test manifest
    Run(RunArgs),

    /// Show the dependency plan of a manifest without running it
    Plan(PlanArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Manifest file (YAML or JSON)
    pub manifest: PathBuf,

    /// Maximum number of tests in flight
    #[arg(short = 'j', long)]
    pub parallelism: Option<usize>,

    /// Attempt timeout in milliseconds for tests that declare none
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Retry limit for tests that declare none
    #[arg(long)]
    pub retries: Option<u32>,

    /// Cancel the run on the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Only run tests whose id contains this (repeatable)
    #[arg(long = "id")]
    pub ids: Vec<String>,

    /// Only run tests whose class contains this (repeatable)
    #[arg(long = "class")]
    pub classes: Vec<String>,

    /// Only run tests in this category (repeatable)
    #[arg(long = "category")]
    pub categories: Vec<String>,

    /// Output format (table, json, json-pretty, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Save results to file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for plan command
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Manifest file (YAML or JSON)
    pub manifest: PathBuf,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Show environment overrides instead
        #[arg(long)]
        env: bool,

        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Write a configuration file with default settings
    Init {
        /// Output file path
        #[arg(short, long, default_value = "./trellis.yaml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}
