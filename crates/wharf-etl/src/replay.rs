//! Load a previously staged object into the sink
//!
//! Used to recover a chunk whose load failed after it was staged. The
//! object key must be one the stager produced for the same table and
//! environment.

use tracing::{info, instrument};

use crate::descriptor::TableDescriptor;
use crate::error::{EtlError, Result};
use crate::load::{load, with_staged};
use crate::request::Environment;
use crate::sink::SinkLoader;
use crate::staging::{decode_csv, StagingLocator};
use crate::storage::ObjectStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub locator: StagingLocator,
    pub rows_loaded: u64,
}

#[instrument(skip(store, loader, table), fields(table = %table.id))]
pub async fn replay(
    store: &dyn ObjectStore,
    loader: &dyn SinkLoader,
    environment: Environment,
    table: &TableDescriptor,
    key: &str,
) -> Result<ReplayReport> {
    let locator = StagingLocator::parse_key(store.bucket(), key)?;
    if locator.environment != environment || locator.table != table.sink_table {
        return Err(EtlError::Config(format!(
            "object '{}' belongs to {}/{}, not {}/{}",
            key, locator.environment, locator.table, environment, table.sink_table
        )));
    }

    let data = store.get(key).await.map_err(|e| EtlError::StagingRead {
        locator: locator.to_string(),
        message: format!("{:#}", e),
    })?;
    let chunk = decode_csv(&data, table, 0)?;
    info!("Replaying {} rows from {}", chunk.len(), locator);

    let namespace = table.namespace(environment);
    let rows_loaded = load(loader, &chunk, table, &namespace)
        .await
        .map_err(|e| with_staged(e, &locator))?;

    info!(rows_loaded, "Replay of {} completed", locator);
    Ok(ReplayReport {
        locator,
        rows_loaded,
    })
}
