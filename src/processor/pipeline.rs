//! Drives a batch source through one or more aggregations.
//!
//! A run moves through `Start -> Reading -> Aggregating -> Reading -> ... ->
//! Finalized`. The transition to `Finalized` happens on the first batch that
//! is shorter than the step; if the source still holds rows at that point the
//! run fails with [`ProcessorError::InconsistentStep`].

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use crate::processor::{
    ProcessorError,
    aggregator::{AggregateState, AggregationSpec, fold},
    chunk_reader::{Batch, ChunkReader},
    materializer::{AggregateTable, materialize},
    partition::{PartitionSet, PartitionWriter},
};

/// Anything that can hand out numbered batches of a fixed step
pub trait BatchSource {
    fn step(&self) -> usize;

    /// Reads batch `index`. A batch with fewer than `step()` rows ends the input.
    fn read_batch(&mut self, index: usize) -> Result<Batch, ProcessorError>;

    /// True if rows remain after the last batch read.
    fn has_remaining(&self) -> bool;
}

impl BatchSource for ChunkReader {
    fn step(&self) -> usize {
        ChunkReader::step(self)
    }

    fn read_batch(&mut self, index: usize) -> Result<Batch, ProcessorError> {
        ChunkReader::read_batch(self, index)
    }

    fn has_remaining(&self) -> bool {
        ChunkReader::has_remaining(self)
    }
}

impl BatchSource for PartitionSet {
    fn step(&self) -> usize {
        PartitionSet::step(self)
    }

    fn read_batch(&mut self, index: usize) -> Result<Batch, ProcessorError> {
        PartitionSet::read_batch(self, index)
    }

    fn has_remaining(&self) -> bool {
        !self.is_exhausted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Start,
    Reading { batch: usize },
    Aggregating { batch: usize },
    Finalized,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Start => write!(f, "START"),
            PipelineState::Reading { batch } => write!(f, "READING({batch})"),
            PipelineState::Aggregating { batch } => write!(f, "AGGREGATING({batch})"),
            PipelineState::Finalized => write!(f, "FINALIZED"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// First batch to read when ingesting; earlier partitions are assumed
    /// already written. Aggregating runs require 0.
    pub start_index: usize,
    /// Write every batch read as a partition file under this directory
    pub partition_dir: Option<PathBuf>,
}

/// Totals for one pass over a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub batches: usize,
    pub rows: usize,
    pub records: usize,
    pub skipped: usize,
}

impl RunSummary {
    fn add(&mut self, batch: &Batch) {
        self.batches += 1;
        self.rows += batch.rows;
        self.records += batch.len();
        self.skipped += batch.skipped.len();
    }
}

/// Single-pass driver for one source and any number of aggregations
///
/// # Example
/// ```no_run
/// # use chunked_aggregator::processor::aggregator::AggregationSpec;
/// # use chunked_aggregator::processor::chunk_reader::{ChunkReader, ReadOptions};
/// # use chunked_aggregator::processor::pipeline::{Pipeline, PipelineOptions};
/// let mut reader = ChunkReader::open("transactions.csv".as_ref(), 1_000_000, ReadOptions::default())?;
/// let mut pipeline = Pipeline::new(PipelineOptions::default());
/// let tables = pipeline.run(&mut reader, &[AggregationSpec::sum_by_year()])?;
/// for (key, values) in &tables[0].rows {
///     println!("{key}: {values:?}");
/// }
/// # Ok::<(), chunked_aggregator::processor::ProcessorError>(())
/// ```
#[derive(Debug)]
pub struct Pipeline {
    options: PipelineOptions,
    state: PipelineState,
    summary: RunSummary,
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Pipeline {
            options,
            state: PipelineState::Start,
            summary: RunSummary::default(),
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Current state. After a failed run this is the state the error was
    /// raised in.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Totals of the most recent run
    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::debug!(from = %self.state, to = %next, "pipeline transition");
        self.state = next;
    }

    fn reset(&mut self) {
        self.state = PipelineState::Start;
        self.summary = RunSummary::default();
    }

    fn partition_writer(&self, step: usize) -> Result<Option<PartitionWriter>, ProcessorError> {
        self.options
            .partition_dir
            .as_deref()
            .map(|dir| PartitionWriter::create(dir, step))
            .transpose()
    }

    /// Reads `source` from `start_index` until the terminating short batch,
    /// handing every batch to `on_batch`.
    fn drive<S, F>(&mut self, source: &mut S, mut on_batch: F) -> Result<(), ProcessorError>
    where
        S: BatchSource + ?Sized,
        F: FnMut(&Batch) -> Result<(), ProcessorError>,
    {
        self.reset();
        let step = source.step();
        let writer = self.partition_writer(step)?;
        let mut index = self.options.start_index;

        loop {
            self.transition(PipelineState::Reading { batch: index });
            let started = Instant::now();
            let batch = source.read_batch(index)?;
            tracing::info!(
                batch = index,
                rows = batch.rows,
                skipped = batch.skipped.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "read batch"
            );

            if let Some(writer) = &writer {
                let path = writer.write(&batch)?;
                tracing::debug!(batch = index, path = %path.display(), "wrote partition");
            }

            self.transition(PipelineState::Aggregating { batch: index });
            let started = Instant::now();
            on_batch(&batch)?;
            self.summary.add(&batch);
            tracing::debug!(
                batch = index,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "folded batch"
            );

            if batch.is_final(step) {
                if source.has_remaining() {
                    return Err(ProcessorError::InconsistentStep {
                        batch: index,
                        expected: step,
                        actual: batch.rows,
                    });
                }
                break;
            }
            index += 1;
        }

        self.transition(PipelineState::Finalized);
        tracing::info!(
            batches = self.summary.batches,
            rows = self.summary.rows,
            skipped = self.summary.skipped,
            "input exhausted"
        );
        Ok(())
    }

    /// Totals must cover the whole source, so aggregating runs always start
    /// at batch 0.
    fn require_full_pass(&self) -> Result<(), ProcessorError> {
        match self.options.start_index {
            0 => Ok(()),
            index => Err(ProcessorError::Config(format!(
                "start index {index} only applies to ingest; aggregation reads every batch"
            ))),
        }
    }

    /// Folds every batch of `source` into one state per spec and materializes
    /// the results, in the order of `specs`.
    ///
    /// # Errors
    /// [`ProcessorError::Config`] if `start_index` is not 0.
    pub fn run<S>(
        &mut self,
        source: &mut S,
        specs: &[AggregationSpec],
    ) -> Result<Vec<AggregateTable>, ProcessorError>
    where
        S: BatchSource + ?Sized,
    {
        self.require_full_pass()?;
        validate_specs(specs)?;
        let mut states = vec![AggregateState::new(); specs.len()];

        self.drive(source, |batch| {
            for (spec, state) in specs.iter().zip(states.iter_mut()) {
                state.fold_batch(spec, batch);
            }
            Ok(())
        })?;

        finish(specs, &states)
    }

    /// Copies `source` into partition files without aggregating.
    ///
    /// # Errors
    /// [`ProcessorError::Config`] if no partition directory is configured.
    pub fn ingest<S>(&mut self, source: &mut S) -> Result<RunSummary, ProcessorError>
    where
        S: BatchSource + ?Sized,
    {
        if self.options.partition_dir.is_none() {
            return Err(ProcessorError::Config(
                "ingest requires a partition directory".into(),
            ));
        }
        self.drive(source, |_| Ok(()))?;
        Ok(self.summary)
    }

    /// Parses and folds batches on the rayon pool.
    ///
    /// Every span is folded into fresh partial states, which are then merged
    /// into the shared states under one lock. Results equal [`Pipeline::run`]
    /// up to floating point summation order.
    pub fn run_parallel(
        &mut self,
        reader: &ChunkReader,
        specs: &[AggregationSpec],
    ) -> Result<Vec<AggregateTable>, ProcessorError> {
        self.require_full_pass()?;
        validate_specs(specs)?;
        self.reset();
        let writer = self.partition_writer(reader.step())?;

        let spans = reader.batch_spans();
        self.transition(PipelineState::Reading { batch: 0 });

        let started = Instant::now();
        let shared = Mutex::new((vec![AggregateState::new(); specs.len()], RunSummary::default()));

        spans.par_iter().try_for_each(|span| -> Result<(), ProcessorError> {
            let batch = reader.read_span(span)?;
            if let Some(writer) = &writer {
                writer.write(&batch)?;
            }
            let partials: Vec<AggregateState> = specs
                .iter()
                .map(|spec| fold(spec, &batch, AggregateState::new()))
                .collect();

            let mut guard = shared.lock();
            let (states, summary) = &mut *guard;
            for (state, partial) in states.iter_mut().zip(partials) {
                state.merge(partial);
            }
            summary.add(&batch);
            Ok(())
        })?;

        let (states, summary) = shared.into_inner();
        self.summary = summary;
        self.transition(PipelineState::Finalized);
        tracing::info!(
            batches = summary.batches,
            rows = summary.rows,
            threads = rayon::current_num_threads(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "parallel fold complete"
        );

        finish(specs, &states)
    }
}

fn validate_specs(specs: &[AggregationSpec]) -> Result<(), ProcessorError> {
    if specs.is_empty() {
        return Err(ProcessorError::Config("no aggregations requested".into()));
    }
    specs.iter().try_for_each(AggregationSpec::validate)
}

fn finish(
    specs: &[AggregationSpec],
    states: &[AggregateState],
) -> Result<Vec<AggregateTable>, ProcessorError> {
    specs
        .iter()
        .zip(states)
        .map(|(spec, state)| materialize(spec, state))
        .collect()
}

/// Folds batches with an explicit accumulator, for callers that drive
/// their own source.
pub fn fold_all<'a, I>(spec: &AggregationSpec, batches: I) -> AggregateState
where
    I: IntoIterator<Item = &'a Batch>,
{
    batches
        .into_iter()
        .fold(AggregateState::new(), |state, batch| fold(spec, batch, state))
}
