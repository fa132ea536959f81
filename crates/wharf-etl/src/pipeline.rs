//! Pipeline orchestrator
//!
//! Drives one run through the state machine:
//!
//! ```text
//! Init -> (SnapshotInit) -> QueryBuilt -> SourceCounted -> ChunkingDecided
//!      -> Extracting -> StagingLoading* -> SinkCounted -> Reconciled -> Done
//! ```
//!
//! Any error ends the run in `Failed`. Chunks already staged or loaded are
//! left in place and named in the [`RunFailure`] for manual replay.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::chunk::Chunk;
use crate::counter::RowCounter;
use crate::descriptor::SinkNamespace;
use crate::error::{EtlError, Result, System};
use crate::extract::{extract, Extraction};
use crate::load::{load, with_staged};
use crate::query::{build_query, QueryShape, Target};
use crate::reconcile::ReconciliationResult;
use crate::request::{RunMode, RunRequest};
use crate::sink::{SinkAdmin, SinkLoader, SinkQuery};
use crate::source::SourceConnection;
use crate::staging::{ChunkStager, StagingLocator};
use crate::table_init::initialize;

// ============================================================================
// Pipeline Constants
// ============================================================================

/// Row count above which extraction is chunked; also the chunk size
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 50_000;
pub const DEFAULT_CHUNK_CONCURRENCY: usize = 1;
pub const DEFAULT_CHUNK_ATTEMPTS: usize = 1;

/// Tunables threaded into the orchestrator at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub chunk_threshold: u64,
    /// Chunk units in flight at once
    pub chunk_concurrency: usize,
    /// Stage-then-load attempts per chunk unit
    pub chunk_attempts: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            chunk_concurrency: DEFAULT_CHUNK_CONCURRENCY,
            chunk_attempts: DEFAULT_CHUNK_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Init,
    SnapshotInit,
    QueryBuilt,
    SourceCounted,
    ChunkingDecided,
    Extracting,
    StagingLoading,
    SinkCounted,
    Reconciled,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of the chunking decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChunkPlan {
    /// One chunk holding the whole result set
    Single,
    Chunked { chunk_size: usize },
}

impl ChunkPlan {
    pub fn chunk_size(&self) -> Option<usize> {
        match self {
            ChunkPlan::Single => None,
            ChunkPlan::Chunked { chunk_size } => Some(*chunk_size),
        }
    }
}

/// Chunk when the source count exceeds the threshold, using the threshold
/// as the chunk size
pub fn decide_chunking(source_count: u64, threshold: u64) -> ChunkPlan {
    if source_count > threshold {
        ChunkPlan::Chunked {
            chunk_size: usize::try_from(threshold.max(1)).unwrap_or(usize::MAX),
        }
    } else {
        ChunkPlan::Single
    }
}

/// One staged and loaded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub index: u64,
    pub rows_loaded: u64,
    pub locator: StagingLocator,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub table: String,
    pub mode: RunMode,
    /// States in the order they were entered
    pub states: Vec<PipelineState>,
    pub plan: ChunkPlan,
    /// Chunk outcomes ordered by chunk index
    pub chunks: Vec<ChunkOutcome>,
    pub rows_loaded: u64,
    pub staged: Vec<StagingLocator>,
    pub reconciliation: ReconciliationResult,
}

/// A run that ended in `Failed`
#[derive(Debug, Error)]
#[error("run failed during {failed_in}: {error}")]
pub struct RunFailure {
    /// Step that was executing when the error occurred
    pub failed_in: PipelineState,
    pub states: Vec<PipelineState>,
    #[source]
    pub error: EtlError,
    /// Objects staged before the failure, kept for replay
    pub staged: Vec<StagingLocator>,
}

/// The external systems a pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceConnection>,
    pub admin: Arc<dyn SinkAdmin>,
    pub loader: Arc<dyn SinkLoader>,
    pub sink_query: Arc<dyn SinkQuery>,
    pub stager: Arc<dyn ChunkStager>,
}

impl Collaborators {
    /// Use one sink value for admin, load and query
    pub fn with_sink<S>(
        source: Arc<dyn SourceConnection>,
        sink: Arc<S>,
        stager: Arc<dyn ChunkStager>,
    ) -> Self
    where
        S: SinkAdmin + SinkLoader + SinkQuery + 'static,
    {
        Self {
            source,
            admin: sink.clone(),
            loader: sink.clone(),
            sink_query: sink,
            stager,
        }
    }
}

#[derive(Debug)]
struct Progress {
    states: Vec<PipelineState>,
    staged: Vec<StagingLocator>,
}

impl Progress {
    fn new() -> Self {
        Self {
            states: vec![PipelineState::Init],
            staged: Vec::new(),
        }
    }

    fn enter(&mut self, state: PipelineState) {
        self.states.push(state);
    }

    fn current(&self) -> PipelineState {
        self.states.last().copied().unwrap_or(PipelineState::Init)
    }
}

pub struct Pipeline {
    collaborators: Collaborators,
    counter: RowCounter,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, settings: PipelineSettings) -> Self {
        let counter = RowCounter::new(
            collaborators.source.clone(),
            collaborators.sink_query.clone(),
        );
        Self {
            collaborators,
            counter,
            settings,
        }
    }

    /// Execute one run to `Done` or `Failed`
    #[instrument(skip(self, request), fields(table = %request.table().id, env = %request.environment(), mode = %request.mode()))]
    pub async fn run(&self, request: &RunRequest) -> std::result::Result<RunReport, RunFailure> {
        let mut progress = Progress::new();

        match self.execute(request, &mut progress).await {
            Ok(report) => Ok(report),
            Err(err) => {
                let failed_in = progress.current();
                progress.enter(PipelineState::Failed);
                error!(
                    state = %failed_in,
                    staged = progress.staged.len(),
                    "Run failed: {}",
                    err
                );
                for locator in &progress.staged {
                    warn!(locator = %locator, "Staged object retained for replay");
                }
                Err(RunFailure {
                    failed_in,
                    states: progress.states,
                    error: err,
                    staged: progress.staged,
                })
            },
        }
    }

    async fn execute(&self, request: &RunRequest, progress: &mut Progress) -> Result<RunReport> {
        let table = request.table();
        let namespace = request.namespace();

        info!(
            "Starting {} load of {} into {}.{} for window {}",
            request.mode(),
            table.source_table,
            namespace,
            table.sink_table,
            request.window()
        );

        if request.mode() == RunMode::Snapshot {
            progress.enter(PipelineState::SnapshotInit);
            info!("Step 1/6: Initializing destination table...");
            initialize(self.collaborators.admin.as_ref(), table, &namespace).await?;
        } else {
            info!("Step 1/6: Skipping table initialization for incremental run");
        }

        progress.enter(PipelineState::QueryBuilt);
        info!("Step 2/6: Building extraction query...");
        let sql = build_query(
            table,
            Target::Source,
            request.mode(),
            request.window(),
            request.row_limit(),
            QueryShape::Select,
        )?;

        progress.enter(PipelineState::SourceCounted);
        info!("Step 3/6: Counting source rows...");
        let source_count = self.counter.count_rows(System::Source, request, false).await?;

        progress.enter(PipelineState::ChunkingDecided);
        let plan = decide_chunking(source_count, self.settings.chunk_threshold);
        info!(?plan, source_count, "Chunking decided");

        progress.enter(PipelineState::Extracting);
        info!("Step 4/6: Extracting, staging and loading...");
        let mut extraction = extract(
            self.collaborators.source.as_ref(),
            &sql,
            table.source_columns.clone(),
            plan.chunk_size(),
        );
        let mut chunks = self
            .process_chunks(request, &namespace, &mut extraction, progress)
            .await?;
        chunks.sort_by_key(|c| c.index);

        progress.enter(PipelineState::SinkCounted);
        info!("Step 5/6: Counting sink rows...");
        let sink_count = self.counter.count_rows(System::Sink, request, true).await?;

        progress.enter(PipelineState::Reconciled);
        info!("Step 6/6: Reconciling...");
        let reconciliation = ReconciliationResult::new(source_count, sink_count);
        reconciliation.report(&table.id);

        progress.enter(PipelineState::Done);
        let rows_loaded: u64 = chunks.iter().map(|c| c.rows_loaded).sum();
        info!(
            chunks = chunks.len(),
            rows_loaded,
            "Run completed: {}",
            reconciliation
        );

        Ok(RunReport {
            table: table.id.clone(),
            mode: request.mode(),
            states: progress.states.clone(),
            plan,
            chunks,
            rows_loaded,
            staged: progress.staged.clone(),
            reconciliation,
        })
    }

    /// Pull chunks and run their units, at most `chunk_concurrency` at a time.
    ///
    /// The source is read while units are in flight. After the first failure
    /// no further chunks are pulled; units already in flight are awaited so
    /// their staged objects are accounted for.
    async fn process_chunks(
        &self,
        request: &RunRequest,
        namespace: &SinkNamespace,
        extraction: &mut Extraction<'_>,
        progress: &mut Progress,
    ) -> Result<Vec<ChunkOutcome>> {
        let limit = self.settings.chunk_concurrency.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut outcomes = Vec::new();
        let mut first_error: Option<EtlError> = None;
        let mut exhausted = false;

        loop {
            let can_pull = !exhausted && in_flight.len() < limit;
            if !can_pull && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                pulled = extraction.next_chunk(), if can_pull => match pulled {
                    Ok(Some(chunk)) => {
                        progress.enter(PipelineState::StagingLoading);
                        in_flight.push(self.process_chunk(chunk, request, namespace));
                    },
                    Ok(None) => exhausted = true,
                    Err(err) => {
                        if progress.current() != PipelineState::Extracting {
                            progress.enter(PipelineState::Extracting);
                        }
                        first_error.get_or_insert(err);
                        exhausted = true;
                    },
                },
                Some((staged, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    progress.staged.extend(staged);
                    match result {
                        Ok(outcome) => outcomes.push(outcome),
                        Err(err) => {
                            first_error.get_or_insert(err);
                            exhausted = true;
                        },
                    }
                },
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    /// Stage then load one chunk, retrying the pair up to `chunk_attempts`
    /// times. Each attempt stages under a fresh token.
    async fn process_chunk(
        &self,
        chunk: Chunk,
        request: &RunRequest,
        namespace: &SinkNamespace,
    ) -> (Vec<StagingLocator>, Result<ChunkOutcome>) {
        let attempts = self.settings.chunk_attempts.max(1);
        let mut staged = Vec::new();
        let mut attempt = 1;

        loop {
            match self.stage_and_load(&chunk, request, namespace, &mut staged).await {
                Ok(outcome) => return (staged, Ok(outcome)),
                Err(err) if attempt < attempts && is_retryable(&err) => {
                    warn!(
                        chunk = chunk.index,
                        attempt,
                        attempts,
                        "Chunk unit failed, retrying: {}",
                        err
                    );
                    attempt += 1;
                },
                Err(err) => return (staged, Err(err)),
            }
        }
    }

    async fn stage_and_load(
        &self,
        chunk: &Chunk,
        request: &RunRequest,
        namespace: &SinkNamespace,
        staged: &mut Vec<StagingLocator>,
    ) -> Result<ChunkOutcome> {
        let locator = self.collaborators.stager.stage(chunk, request).await?;
        staged.push(locator.clone());

        let rows_loaded = load(
            self.collaborators.loader.as_ref(),
            chunk,
            request.table(),
            namespace,
        )
        .await
        .map_err(|e| with_staged(e, &locator))?;

        info!(
            chunk = chunk.index,
            rows_loaded,
            "Loaded chunk staged at {}",
            locator
        );

        Ok(ChunkOutcome {
            index: chunk.index,
            rows_loaded,
            locator,
        })
    }
}

fn is_retryable(err: &EtlError) -> bool {
    matches!(
        err,
        EtlError::StagingWrite { .. } | EtlError::Load { .. } | EtlError::Connection { .. }
    )
}
