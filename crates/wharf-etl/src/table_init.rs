//! Destination table (re)creation for snapshot runs

use tracing::info;

use crate::descriptor::{SinkNamespace, TableDescriptor};
use crate::error::{EtlError, Result};
use crate::query::create_table_sql;
use crate::sink::SinkAdmin;

/// Replace the sink table with an empty one carrying the descriptor's schema.
///
/// Replace semantics make this idempotent. Any failure is returned; callers
/// must not start extraction after an error here.
pub async fn initialize(
    admin: &dyn SinkAdmin,
    table: &TableDescriptor,
    namespace: &SinkNamespace,
) -> Result<()> {
    let ddl = create_table_sql(table, namespace)?;
    let target = format!("{}.{}", namespace, table.sink_table);

    admin.execute_ddl(&ddl).await.map_err(|e| EtlError::TableInit {
        table: target.clone(),
        message: e.to_string(),
    })?;

    info!("Initialized destination table {}", target);
    Ok(())
}
