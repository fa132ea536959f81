//! Append a chunk to the destination table

use tracing::debug;

use crate::chunk::Chunk;
use crate::descriptor::{SinkNamespace, TableDescriptor};
use crate::error::{EtlError, Result};
use crate::sink::SinkLoader;
use crate::staging::StagingLocator;

/// Append `chunk` to the table's sink table, returning rows appended.
///
/// Empty chunks never reach the sink.
pub async fn load(
    loader: &dyn SinkLoader,
    chunk: &Chunk,
    table: &TableDescriptor,
    namespace: &SinkNamespace,
) -> Result<u64> {
    if chunk.is_empty() {
        debug!(chunk = chunk.index, "Skipping load of empty chunk");
        return Ok(0);
    }

    loader
        .append(namespace, &table.sink_table, chunk)
        .await
        .map_err(|err| match err {
            EtlError::Load { .. } => err,
            other => EtlError::Load {
                chunk: chunk.index,
                table: format!("{}.{}", namespace, table.sink_table),
                staged: None,
                message: other.to_string(),
            },
        })
}

/// Attach the staged copy of a chunk to a load failure
pub fn with_staged(err: EtlError, locator: &StagingLocator) -> EtlError {
    match err {
        EtlError::Load {
            chunk,
            table,
            message,
            ..
        } => EtlError::Load {
            chunk,
            table,
            staged: Some(locator.to_string()),
            message,
        },
        other => other,
    }
}
