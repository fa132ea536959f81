//! Wharf ETL - load one table from MySQL into BigQuery

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use wharf_common::logging::{init_logging, LogConfig, LogLevel};
use wharf_etl::config::EtlConfig;
use wharf_etl::descriptor::TableRegistry;
use wharf_etl::pipeline::{Collaborators, Pipeline};
use wharf_etl::replay::replay;
use wharf_etl::request::{Environment, RunMode, RunRequest, TimeWindow};
use wharf_etl::source::MySqlSource;
use wharf_etl::staging::Stager;

#[derive(Parser, Debug)]
#[command(name = "wharf-etl")]
#[command(author, version, about = "Load tables from MySQL into BigQuery")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract, stage, load and reconcile one table
    Run {
        /// Target environment (dev or prod)
        #[arg(short, long)]
        env: Environment,

        /// Registered table id
        #[arg(short, long)]
        table: String,

        /// Replace the destination table and load everything
        #[arg(long)]
        snapshot: bool,

        /// Window start date, YYYY-MM-DD (default: yesterday)
        #[arg(long)]
        start: Option<String>,

        /// Window end date, YYYY-MM-DD, exclusive (default: today)
        #[arg(long)]
        end: Option<String>,

        /// Maximum rows to extract
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Load a staged object back into the sink
    Replay {
        /// Target environment (dev or prod)
        #[arg(short, long)]
        env: Environment,

        /// Registered table id
        #[arg(short, long)]
        table: String,

        /// Object key, e.g. dev/table_one/year=2023/month=8/day=28/table_one_<token>.csv
        #[arg(short, long)]
        key: String,
    },

    /// List registered tables
    Tables,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("wharf-etl".to_string())
        .build();

    // Environment variables take precedence
    let log_config = match log_config.clone().merge_env() {
        Ok(merged) => merged,
        Err(e) => {
            eprintln!("Warning: ignoring invalid logging environment: {:#}", e);
            log_config
        },
    };

    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    if let Err(e) = execute(cli.command).await {
        error!(error = %format!("{:#}", e), "Command failed");
        eprintln!("Error: {:#}", e);
        drop(guard);
        process::exit(1);
    }
}

async fn execute(command: Command) -> Result<()> {
    let registry = TableRegistry::builtin();

    match command {
        Command::Tables => {
            for table in registry.iter() {
                println!(
                    "{:<10} {}.{} -> {}_<env>.{} (watermark: {}, primary key: {})",
                    table.id,
                    table.source_database,
                    table.source_table,
                    table.sink_dataset_prefix,
                    table.sink_table,
                    table.watermark_column.as_deref().unwrap_or("-"),
                    table.primary_key.as_deref().unwrap_or("-"),
                );
            }
        },
        Command::Run {
            env,
            table,
            snapshot,
            start,
            end,
            limit,
        } => {
            let config = EtlConfig::load().context("Failed to load configuration")?;
            let table = registry.get(&table)?.clone();
            let window = TimeWindow::resolve(
                start.as_deref(),
                end.as_deref(),
                chrono::Local::now().date_naive(),
            )?;
            let mode = if snapshot {
                RunMode::Snapshot
            } else {
                RunMode::Incremental
            };
            let request = RunRequest::new(env, table, window, mode, limit)?;

            let credentials = config
                .secret_store()
                .source_credentials(&config.secrets.secret_id)
                .await?;
            let source = MySqlSource::connect(&credentials, config.connect_timeout()).await?;
            let sink = Arc::new(config.bigquery_client().await?);
            let stager = Arc::new(Stager::new(config.object_store()));

            let pipeline = Pipeline::new(
                Collaborators::with_sink(Arc::new(source), sink, stager),
                config.pipeline_settings(),
            );

            let report = pipeline.run(&request).await?;
            info!(
                chunks = report.chunks.len(),
                rows_loaded = report.rows_loaded,
                "Load of {} finished",
                report.table
            );
            println!(
                "{}: {} rows in {} chunk(s), {}",
                report.table,
                report.rows_loaded,
                report.chunks.len(),
                report.reconciliation
            );
        },
        Command::Replay { env, table, key } => {
            let config = EtlConfig::load().context("Failed to load configuration")?;
            let table = registry.get(&table)?.clone();
            let store = config.object_store();
            let sink = config.bigquery_client().await?;

            let report = replay(store.as_ref(), &sink, env, &table, &key).await?;
            println!("{}: {} rows replayed", report.locator, report.rows_loaded);
        },
    }

    Ok(())
}
