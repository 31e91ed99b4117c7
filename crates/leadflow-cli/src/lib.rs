//! LeadFlow CLI Library
//!
//! Command-line front end for the lead pipeline.
//!
//! # Overview
//!
//! - **Full runs**: load, clean and push both datasets to SQL (`leadflow run`)
//! - **Status**: dataset availability, cache, pools and health (`leadflow status`)
//! - **Cleaning**: clean every dataset or just one (`leadflow clean`)
//! - **Indicators**: key business indicators from the cleaned data (`leadflow indicators`)
//! - **Queries**: run ad-hoc SQL against the configured database (`leadflow query`)
//! - **Database checks**: connectivity and table listing (`leadflow verify-db`, `leadflow tables`)
//! - **Reset**: drop cached datasets and recorded metrics (`leadflow reset`)
//!
//! Every command prints a table by default and JSON with `--json`.

pub mod commands;
pub mod error;
pub mod output;
pub mod progress;

pub use error::{CliError, Result};

use clap::{Parser, Subcommand};
use leadflow_pipeline::{PipelineConfig, SuccessPolicy};

/// LeadFlow - real-estate lead pipeline
#[derive(Parser, Debug)]
#[command(name = "leadflow")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Worker count for parallel cleaning (overrides LEADFLOW_MAX_WORKERS)
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Database connection string (overrides DATABASE_URL)
    #[arg(long, global = true, conflicts_with = "no_database")]
    pub database_url: Option<String>,

    /// Skip the database even if DATABASE_URL is set
    #[arg(long, global = true)]
    pub no_database: bool,

    /// Cleaning success policy: lenient, require_all, require_any or min_rows:N
    #[arg(long, global = true)]
    pub policy: Option<String>,
}

impl Cli {
    /// Environment configuration with the command-line overrides applied.
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::load()?;

        if let Some(workers) = self.workers {
            config = config.with_max_workers(workers);
        }
        if let Some(url) = &self.database_url {
            config = config.with_database_url(url.clone());
        }
        if self.no_database {
            config = config.without_database();
        }
        if let Some(policy) = &self.policy {
            let policy: SuccessPolicy = policy.parse()?;
            config = config.with_success_policy(policy);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the whole pipeline: load, clean, SQL load
    Run,

    /// Show dataset, cache, pool and database status
    Status,

    /// Clean datasets without loading them into SQL
    Clean {
        /// Clean only this dataset (sample or status)
        #[arg(short, long)]
        dataset: Option<String>,
    },

    /// Show key business indicators computed from the cleaned datasets
    Indicators,

    /// Run a SQL query against the configured database
    Query {
        /// SQL statement
        sql: String,

        /// Label used for timing and logs
        #[arg(short, long, default_value = "cli_query")]
        label: String,
    },

    /// Check that the configured database is reachable
    VerifyDb,

    /// List tables in the configured database
    Tables,

    /// Clear cached datasets and recorded metrics
    Reset {
        /// Also delete the cleaned CSV outputs
        #[arg(long)]
        purge: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["leadflow", "run", "--json", "-w", "3", "--no-database"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Run));
        assert!(cli.json);
        assert_eq!(cli.workers, Some(3));
        assert!(cli.no_database);
    }

    #[test]
    fn test_parse_query_with_label() {
        let cli =
            Cli::try_parse_from(["leadflow", "query", "SELECT 1", "--label", "ping"]).unwrap();
        match cli.command {
            Commands::Query { sql, label } => {
                assert_eq!(sql, "SELECT 1");
                assert_eq!(label, "ping");
            },
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_indicators() {
        let cli = Cli::try_parse_from(["leadflow", "indicators", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Indicators));
        assert!(cli.json);
    }

    #[test]
    fn test_database_flags_conflict() {
        let parsed = Cli::try_parse_from([
            "leadflow",
            "status",
            "--database-url",
            "sqlite://x.db",
            "--no-database",
        ]);
        assert!(parsed.is_err());
    }
}
