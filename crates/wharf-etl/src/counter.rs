//! Row counts on either side of the pipeline

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, System};
use crate::query::{build_query, QueryShape, Target};
use crate::request::RunRequest;
use crate::sink::SinkQuery;
use crate::source::SourceConnection;

/// Runs count queries against the source or the sink
#[derive(Clone)]
pub struct RowCounter {
    source: Arc<dyn SourceConnection>,
    sink: Arc<dyn SinkQuery>,
}

impl RowCounter {
    pub fn new(source: Arc<dyn SourceConnection>, sink: Arc<dyn SinkQuery>) -> Self {
        Self { source, sink }
    }

    /// Count rows of the request's table using the same predicate as extraction.
    ///
    /// `distinct` counts distinct primary keys instead of rows.
    pub async fn count_rows(&self, system: System, request: &RunRequest, distinct: bool) -> Result<u64> {
        let namespace = request.namespace();
        let target = match system {
            System::Source => Target::Source,
            System::Sink => Target::Sink(&namespace),
        };

        let sql = build_query(
            request.table(),
            target,
            request.mode(),
            request.window(),
            None,
            QueryShape::count(distinct),
        )?;
        debug!(%system, "Count query:\n{}", sql);

        let count = match system {
            System::Source => self.source.fetch_scalar(&sql).await?,
            System::Sink => self.sink.query_scalar(&sql).await?,
        };

        info!(%system, table = %request.table().id, distinct, count, "Counted rows");
        Ok(count)
    }
}
