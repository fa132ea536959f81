//! Wharf ETL
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Moves one table at a time from a MySQL source into BigQuery, either as a
//! full snapshot or incrementally over a watermark window.
//!
//! # Flow
//!
//! 1. Snapshot runs replace the destination table first ([`table_init`])
//! 2. The extraction query is built ([`query`]) and the source rows counted ([`counter`])
//! 3. Large results are split into chunks ([`extract`])
//! 4. Each chunk is staged as CSV in object storage ([`staging`]), then appended
//!    by a warehouse load job ([`load`])
//! 5. The sink is counted by distinct primary key and compared ([`reconcile`])
//!
//! [`pipeline::Pipeline`] drives these steps and records the states a run
//! passes through. External systems sit behind traits so they can be
//! swapped: [`source::SourceConnection`], [`sink::SinkAdmin`],
//! [`sink::SinkLoader`], [`sink::SinkQuery`], [`storage::ObjectStore`],
//! [`secrets::SecretStore`] and [`auth::AccessTokenProvider`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wharf_etl::config::EtlConfig;
//! use wharf_etl::descriptor::TableRegistry;
//! use wharf_etl::pipeline::{Collaborators, Pipeline};
//! use wharf_etl::request::{Environment, RunMode, RunRequest, TimeWindow};
//! use wharf_etl::source::MySqlSource;
//! use wharf_etl::staging::Stager;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = EtlConfig::load()?;
//! let table = TableRegistry::builtin().get("table1")?.clone();
//! let window = TimeWindow::resolve(None, None, chrono::Local::now().date_naive())?;
//! let request = RunRequest::new(Environment::Dev, table, window, RunMode::Incremental, None)?;
//!
//! let credentials = config
//!     .secret_store()
//!     .source_credentials(&config.secrets.secret_id)
//!     .await?;
//! let source = MySqlSource::connect(&credentials, config.connect_timeout()).await?;
//! let sink = Arc::new(config.bigquery_client().await?);
//! let stager = Arc::new(Stager::new(config.object_store()));
//!
//! let pipeline = Pipeline::new(
//!     Collaborators::with_sink(Arc::new(source), sink, stager),
//!     config.pipeline_settings(),
//! );
//! let report = pipeline.run(&request).await?;
//! println!("{}", report.reconciliation);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod chunk;
pub mod config;
pub mod counter;
pub mod descriptor;
pub mod error;
pub mod extract;
pub mod load;
pub mod pipeline;
pub mod query;
pub mod reconcile;
pub mod replay;
pub mod request;
pub mod secrets;
pub mod sink;
pub mod source;
pub mod staging;
pub mod storage;
pub mod table_init;

pub use error::{EtlError, Result};
