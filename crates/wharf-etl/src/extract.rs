//! Chunked extraction from the source
//!
//! An [`Extraction`] wraps the source row stream and hands out [`Chunk`]s.
//! Chunked extraction yields chunks of at most `chunk_size` rows and nothing
//! at all for an empty result. Unchunked extraction yields exactly one chunk
//! holding the whole result set, even when that set is empty.

use futures::StreamExt;
use tracing::debug;

use crate::chunk::{Chunk, Row};
use crate::error::Result;
use crate::source::{RowStream, SourceConnection};

/// Open a data query and return its chunk sequence
pub fn extract<'a>(
    source: &'a dyn SourceConnection,
    sql: &'a str,
    columns: Vec<String>,
    chunk_size: Option<usize>,
) -> Extraction<'a> {
    Extraction {
        rows: source.fetch(sql),
        columns,
        chunk_size: chunk_size.map(|n| n.max(1)),
        buffer: Vec::new(),
        next_index: 0,
        finished: false,
    }
}

/// Forward-only, non-restartable sequence of chunks
pub struct Extraction<'a> {
    rows: RowStream<'a>,
    columns: Vec<String>,
    chunk_size: Option<usize>,
    /// Rows of the chunk being filled; survives a dropped `next_chunk` call
    buffer: Vec<Row>,
    next_index: u64,
    finished: bool,
}

impl Extraction<'_> {
    /// Next chunk in source order, or `None` once the result is exhausted.
    ///
    /// Cancel safe: rows read by a call that is dropped before completing
    /// are kept and returned by the next call.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.finished {
            return Ok(None);
        }

        while self.chunk_size.map_or(true, |size| self.buffer.len() < size) {
            match self.rows.next().await {
                Some(row) => self.buffer.push(row?),
                None => {
                    self.finished = true;
                    break;
                },
            }
        }

        let rows = std::mem::take(&mut self.buffer);

        if rows.is_empty() && self.chunk_size.is_some() {
            return Ok(None);
        }

        let chunk = Chunk::new(self.next_index, self.columns.clone(), rows);
        self.next_index += 1;
        // the unchunked form has exactly one chunk
        if self.chunk_size.is_none() {
            self.finished = true;
        }

        debug!(chunk = chunk.index, rows = chunk.len(), "Extracted chunk");
        Ok(Some(chunk))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::chunk::Cell;
    use crate::error::{EtlError, QueryKind, System};
    use async_trait::async_trait;
    use futures::stream;

    struct VecSource {
        rows: usize,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl SourceConnection for VecSource {
        fn fetch<'a>(&'a self, _sql: &'a str) -> RowStream<'a> {
            let fail_at = self.fail_at;
            stream::iter((0..self.rows).map(move |i| {
                if Some(i) == fail_at {
                    Err(EtlError::query(System::Source, QueryKind::Extract, "lost row"))
                } else {
                    Ok(vec![Cell::Int(i as i64)])
                }
            }))
            .boxed()
        }

        async fn fetch_scalar(&self, _sql: &str) -> Result<u64> {
            Ok(self.rows as u64)
        }
    }

    async fn drain(source: &VecSource, chunk_size: Option<usize>) -> Vec<Chunk> {
        let mut extraction = extract(source, "SELECT", vec!["n".into()], chunk_size);
        let mut chunks = Vec::new();
        while let Some(chunk) = extraction.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_chunked_preserves_order_and_bounds() {
        let source = VecSource { rows: 7, fail_at: None };
        let chunks = drain(&source, Some(3)).await;

        assert_eq!(chunks.iter().map(Chunk::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);

        let flat: Vec<Cell> = chunks.into_iter().flat_map(|c| c.rows).flatten().collect();
        assert_eq!(flat, (0..7).map(Cell::Int).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_trailing_empty_chunk() {
        let source = VecSource { rows: 6, fail_at: None };
        assert_eq!(drain(&source, Some(3)).await.len(), 2);
    }

    #[tokio::test]
    async fn test_chunked_empty_result_yields_nothing() {
        let source = VecSource { rows: 0, fail_at: None };
        assert!(drain(&source, Some(3)).await.is_empty());
    }

    #[tokio::test]
    async fn test_unchunked_yields_exactly_one_chunk() {
        let source = VecSource { rows: 5, fail_at: None };
        let chunks = drain(&source, None).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 5);

        let empty = VecSource { rows: 0, fail_at: None };
        let chunks = drain(&empty, None).await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    #[tokio::test]
    async fn test_row_error_surfaces_from_next_chunk() {
        let source = VecSource { rows: 5, fail_at: Some(4) };
        let mut extraction = extract(&source, "SELECT", vec!["n".into()], Some(2));
        assert_eq!(extraction.next_chunk().await.unwrap().unwrap().len(), 2);
        assert_eq!(extraction.next_chunk().await.unwrap().unwrap().len(), 2);
        assert!(extraction.next_chunk().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_call_keeps_rows_already_read() {
        let row = |i: i64| Ok::<Row, EtlError>(vec![Cell::Int(i)]);
        // row 0 is ready at once; every later row first yields to the runtime
        let rows = stream::iter(vec![row(0)])
            .chain(stream::iter((1..4).map(row)).then(|r| async move {
                tokio::task::yield_now().await;
                r
            }))
            .boxed();
        let mut extraction = Extraction {
            rows,
            columns: vec!["n".into()],
            chunk_size: Some(3),
            buffer: Vec::new(),
            next_index: 0,
            finished: false,
        };

        let first = futures::poll!(Box::pin(extraction.next_chunk()));
        assert!(first.is_pending());
        assert_eq!(extraction.buffer.len(), 1);

        let chunk = extraction.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.index, 0);
        assert_eq!(chunk.rows, (0..3).map(|i| vec![Cell::Int(i)]).collect::<Vec<_>>());
        assert_eq!(extraction.next_chunk().await.unwrap().unwrap().len(), 1);
        assert!(extraction.next_chunk().await.unwrap().is_none());
    }
}
