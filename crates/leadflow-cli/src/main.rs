//! LeadFlow CLI - Main entry point

use clap::Parser;
use leadflow_cli::{commands, Cli, Commands};
use leadflow_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use leadflow_pipeline::PipelineContext;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Verbose mode logs debug to the console, otherwise warnings only
    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        })
        .output(LogOutput::Console)
        .log_file_prefix("leadflow")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The CLI works without logging
    let guard = init_logging(&log_config).ok();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let result = execute_command(&cli, &cancel).await;

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        // Flush file logs before exiting
        drop(guard);
        process::exit(1);
    }
}

/// Execute the CLI command
async fn execute_command(cli: &Cli, cancel: &CancellationToken) -> leadflow_cli::Result<()> {
    let ctx = PipelineContext::new(cli.pipeline_config()?);

    match &cli.command {
        Commands::Run => commands::run::run(ctx, cli.json, cancel).await,
        Commands::Status => commands::status::run(ctx, cli.json, cancel).await,
        Commands::Clean { dataset } => {
            commands::clean::run(ctx, dataset.clone(), cli.json, cancel).await
        },
        Commands::Indicators => commands::indicators::run(ctx, cli.json).await,
        Commands::Query { sql, label } => {
            commands::query::run(ctx, sql, label, cli.json, cancel).await
        },
        Commands::VerifyDb => commands::db::verify(ctx, cli.json, cancel).await,
        Commands::Tables => commands::db::tables(ctx, cli.json, cancel).await,
        Commands::Reset { purge } => commands::reset::run(ctx, *purge, cli.json).await,
    }
}
