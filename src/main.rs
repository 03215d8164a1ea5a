//! Trellis CLI
//!
//! Runs declarative test manifests through the execution engine.
//!
//! ## Usage
//!
//! ```bash
//! # Run a manifest with at most 4 tests in flight
//! trellis run suite.yaml -j 4
//!
//! # Only the Cart class (plus whatever it depends on), as JSON
//! trellis run suite.yaml --class Cart --format json
//!
//! # Show dependency levels and cycles
//! trellis plan suite.yaml
//!
//! # Print or create configuration
//! trellis config show
//! trellis config init
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use trellis::cli::{self, Args};
use trellis::config::{ConfigFile, EngineConfig, EnvConfig};
use trellis::graph::{execution_levels, find_cycles, DependencyGraph};
use trellis::manifest::Manifest;
use trellis::output::{write_summary_to_file, OutputFormat, ResultFormatter};
use trellis::utils::{init_logger, LogLevel};
use trellis::{CancellationToken, TestEngine, TestFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env = EnvConfig::load();
    let mut config = ConfigFile::resolve(args.config.as_deref(), &env)?;
    if let Some(level) = &args.log_level {
        config.log_level = level
            .parse::<LogLevel>()
            .map_err(anyhow::Error::msg)?;
    }
    init_logger(config.log_level);

    match args.command {
        cli::Command::Run(run_args) => {
            let success = run_manifest(run_args, config).await?;
            if !success {
                std::process::exit(1);
            }
        }
        cli::Command::Plan(plan_args) => {
            show_plan(plan_args)?;
        }
        cli::Command::Config(config_args) => {
            manage_config(config_args, &config, &env)?;
        }
    }

    Ok(())
}

async fn run_manifest(args: cli::RunArgs, mut config: EngineConfig) -> Result<bool> {
    if let Some(parallelism) = args.parallelism {
        config.max_parallelism = parallelism;
    }
    if let Some(timeout) = args.timeout_ms {
        config.default_timeout_ms = Some(timeout);
    }
    if let Some(retries) = args.retries {
        config.default_retry_limit = retries;
    }
    if args.fail_fast {
        config.fail_fast = true;
    }

    let format: OutputFormat = args.format.parse().map_err(anyhow::Error::msg)?;
    let manifest = Manifest::load(&args.manifest)?;
    let name = manifest
        .name
        .clone()
        .unwrap_or_else(|| args.manifest.display().to_string());
    let suite = manifest.into_suite()?;

    let mut filter = TestFilter::new();
    for id in args.ids {
        filter = filter.id(id);
    }
    for class in args.classes {
        filter = filter.class(class);
    }
    for category in args.categories {
        filter = filter.category(category);
    }

    info!(
        "Running {} ({} tests, max parallelism {})",
        name,
        suite.len(),
        config.max_parallelism
    );

    let session = CancellationToken::new();
    let on_interrupt = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling session");
            on_interrupt.cancel();
        }
    });

    let engine = TestEngine::new(config).with_filter(filter);
    let summary = engine
        .run_with_cancel(suite, session)
        .await
        .with_context(|| format!("Failed to run {name}"))?;

    let mut formatter = ResultFormatter::new(format);
    if args.no_color {
        formatter = formatter.no_color();
    }
    println!("{}", formatter.format_summary(&summary));

    if let Some(path) = &args.output {
        write_summary_to_file(path, &summary, format)?;
        println!("Results saved to {}", path.display());
    }

    Ok(summary.is_success())
}

fn show_plan(args: cli::PlanArgs) -> Result<()> {
    let suite = Manifest::load(&args.manifest)?.into_suite()?;
    let tests: Vec<_> = suite.tests.into_iter().map(Arc::new).collect();
    let graph = DependencyGraph::build(&tests)?;

    println!("\nExecution Plan: {} tests, {} dependency edges", graph.len(), graph.edge_count());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let (levels, unschedulable) = execution_levels(&graph);
    for (level, members) in levels.iter().enumerate() {
        println!("\nLevel {level}:");
        for &index in members {
            let test = &tests[index];
            println!("  - {}::{}", test.class, test.id);
        }
    }

    if !unschedulable.is_empty() {
        println!("\nUnschedulable:");
        for index in unschedulable {
            let reason = graph
                .discovery_failure(index)
                .map(|e| e.to_string())
                .unwrap_or_else(|| "downstream of a failed dependency".to_string());
            println!("  - {} ({})", graph.id(index), reason);
        }
    }

    let cycles = find_cycles(&graph);
    if !cycles.is_empty() {
        println!("\nDependency Cycles:");
        for cycle in cycles {
            println!("  - {}", cycle.path.join(" -> "));
        }
    }

    let fixture_cycles: Vec<_> = suite
        .fixtures
        .ids()
        .into_iter()
        .filter_map(|id| suite.fixtures.find_cycle(id))
        .collect();
    if !fixture_cycles.is_empty() {
        println!("\nFixture Cycles:");
        for chain in fixture_cycles {
            println!("  - {}", chain.join(" -> "));
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
    Ok(())
}

fn manage_config(args: cli::ConfigArgs, effective: &EngineConfig, env: &EnvConfig) -> Result<()> {
    match args.action {
        cli::ConfigAction::Init { output, force } => {
            if output.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {}. Use --force to overwrite.",
                    output.display()
                );
            }

            ConfigFile::default().save(&output)?;
            println!("✓ Configuration file created: {}", output.display());
            print_location_hint(&output);
        }

        cli::ConfigAction::Show { env: show_env, format } => {
            if show_env {
                env.print_summary();
            } else {
                let config = ConfigFile {
                    engine: effective.clone(),
                    ..ConfigFile::default()
                };
                let output = if format == "json" {
                    serde_json::to_string_pretty(&config)?
                } else {
                    serde_yaml::to_string(&config)?
                };
                println!("{output}");
            }
        }
    }

    Ok(())
}

fn print_location_hint(path: &Path) {
    if ConfigFile::find().as_deref() != Some(path) {
        println!("\nPass it with --config {} or move it to ./trellis.yaml.", path.display());
    }
}
