//! # ChunkedAggregator
//!
//! Out-of-core aggregation over a transactions CSV. The file is memory mapped
//! and read in fixed-size row batches; every batch is folded into a running
//! aggregate and dropped before the next one is parsed, so memory stays
//! bounded by the step rather than the file size.
//!
//! - Memory-mapped batch reading with `memchr` line scanning
//! - Typed records (`chrono` dates, SIMD integer parsing, fast float parsing)
//! - Associative sum/count/min/max accumulators grouped by any columns
//! - Filters: equals, greater-than, less-than, between
//! - Several aggregations per pass, optional parallel fold with Rayon
//! - Batches persisted as Arrow IPC partitions, resumable by batch index
//!
//! # Example
//!
//! ```no_run
//! use chunked_aggregator::{AggregationSpec, ChunkReader, Pipeline, PipelineOptions, ReadOptions};
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut reader = ChunkReader::open(Path::new("transactions.csv"), 5_000_000, ReadOptions::default())?;
//!     let mut pipeline = Pipeline::new(PipelineOptions::default());
//!
//!     let tables = pipeline.run(
//!         &mut reader,
//!         &[
//!             AggregationSpec::sum_by_year(),
//!             AggregationSpec::monthly_average(2020, "Entertainment"),
//!         ],
//!     )?;
//!
//!     for table in &tables {
//!         for (key, values) in &table.rows {
//!             println!("{} {} => {:?}", table.name, key, values);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
mod helpers;
pub mod processor;

pub use config::Config;
pub use processor::{
    AggregateOp, AggregateResult, ErrorKind, FilterPredicate, ProcessorError, Value,
    aggregator::{AggregateState, AggregationSpec, GroupKey, fold},
    chunk_reader::{Batch, ChunkReader, MalformedRows, ReadOptions},
    materializer::{AggregateTable, Series, materialize},
    partition::{PartitionSet, PartitionWriter},
    pipeline::{BatchSource, Pipeline, PipelineOptions, PipelineState, RunSummary},
    record::{Field, Record},
};

/// Where [`aggregate`] reads batches from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The CSV named by `input.path`
    Csv,
    /// Partitions previously written to `output.partition_dir`
    Partitions,
}

/// Runs `specs` over the whole configured input in one pass.
///
/// Parallel mode applies to CSV input only; partitions are always read in
/// order.
pub fn aggregate(
    config: &Config,
    source: Source,
    specs: &[AggregationSpec],
) -> Result<(Vec<AggregateTable>, RunSummary), ProcessorError> {
    let mut options = PipelineOptions::default();

    match source {
        Source::Csv => {
            options.partition_dir = config.output.partition_dir.clone();
            let mut reader =
                ChunkReader::open(&config.input.path, config.input.step, config.read_options())?;
            let mut pipeline = Pipeline::new(options);
            let tables = if config.processing.parallel {
                pipeline.run_parallel(&reader, specs)?
            } else {
                pipeline.run(&mut reader, specs)?
            };
            Ok((tables, pipeline.summary()))
        }
        Source::Partitions => {
            let dir = config.output.partition_dir.as_deref().ok_or_else(|| {
                ProcessorError::Config("output.partition_dir is required to read partitions".into())
            })?;
            let mut set = PartitionSet::open(dir)?;
            let mut pipeline = Pipeline::new(options);
            let tables = pipeline.run(&mut set, specs)?;
            Ok((tables, pipeline.summary()))
        }
    }
}

/// Configure the global Rayon thread pool. Leaves Rayon's default in place
/// when `threads` is `None`.
pub fn init_rayon(threads: Option<usize>) -> Result<(), rayon::ThreadPoolBuildError> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
