//! Atelier CLI Binary
//!
//! Drives the generation orchestrator from a terminal.

use anyhow::Context;
use atelier::cli::{map_error, Cli, RunContext};
use atelier::logging::{init_logging, LoggingConfig};
use clap::Parser;
use std::process;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (logging_config, log_file) = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config), log_file) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!("Atelier CLI starting");

    let context = match RunContext::new(cli.config.clone(), cli.cache_root.clone()) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Error opening orchestrator: {}", e);
            eprintln!("{}", map_error(&e));
            process::exit(1);
        }
    };

    match context.execute(&cli.command).await {
        Ok(output) => {
            info!("Command completed successfully");
            println!("{}", output);
        }
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("{}", map_error(&e));
            process::exit(1);
        }
    }
}

/// Logging settings from the config file with CLI flags layered on top.
fn build_logging_config(cli: &Cli) -> (LoggingConfig, Option<std::path::PathBuf>) {
    let loaded = RunContext::load_config(cli.config.as_deref(), cli.cache_root.clone())
        .context("loading configuration for logging");
    let (mut config, log_file) = match loaded {
        Ok(c) => {
            let log_file = c.log_file();
            (c.logging, Some(log_file))
        }
        Err(e) => {
            eprintln!("warning: {:#}; using default logging", e);
            (LoggingConfig::default(), None)
        }
    };

    if cli.verbose {
        config.level = "debug".to_string();
    }
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    if let Some(ref output) = cli.log_output {
        config.output = output.clone();
    }
    (config, log_file)
}
