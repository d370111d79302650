//! ChunkedAggregator CLI
//!
//! Batch ingestion and yearly/monthly aggregation of a transactions CSV.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use chunked_aggregator::{
    AggregateTable, AggregationSpec, ChunkReader, Config, Pipeline, PipelineOptions,
    ProcessorError, RunSummary, Source, aggregate, init_rayon,
};

#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(name = "chunked-aggregator")]
#[command(about = "Aggregate a large transactions CSV in bounded batches", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or JSON)
    #[arg(short, long, global = true, env = "CHUNKED_AGGREGATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Override the input CSV
    #[arg(short, long, global = true, env = "CHUNKED_AGGREGATOR_INPUT")]
    input: Option<PathBuf>,

    /// Override rows per batch
    #[arg(long, global = true)]
    step: Option<usize>,

    /// Fold batches in parallel
    #[arg(long, global = true)]
    parallel: bool,

    /// Override Rayon thread count
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write every batch as an Arrow IPC partition without aggregating
    Ingest {
        /// Directory receiving `<index>.arrow` files
        #[arg(short, long)]
        partition_dir: Option<PathBuf>,

        /// Batch to resume from
        #[arg(long, default_value_t = 0)]
        start_index: usize,
    },

    /// Run one or more reports over the input
    Aggregate {
        /// Reports to compute in a single pass
        #[arg(short, long, value_enum, num_args = 1.., default_values_t = [Report::YearlySum])]
        report: Vec<Report>,

        /// Read previously written partitions instead of the CSV
        #[arg(long)]
        from_partitions: bool,

        /// Year for the monthly average report
        #[arg(long)]
        year: Option<i32>,

        /// Expense type for the monthly average report
        #[arg(long)]
        exp_type: Option<String>,

        /// Write the finalized tables as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate configuration and the input header
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Report {
    /// Total amount per year
    YearlySum,
    /// Total amount and transaction count per year
    YearlyAgg,
    /// Average monthly spend per customer for one year and expense type
    MonthlyAverage,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    input: &'a Path,
    step: usize,
    summary: RunSummary,
    tables: &'a [AggregateTable],
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Ingest {
            partition_dir,
            start_index,
        } => ingest_command(&cli, partition_dir.clone(), *start_index),

        Commands::Aggregate {
            report,
            from_partitions,
            year,
            exp_type,
            output,
        } => {
            let mut config = load_config(&cli)?;
            if let Some(year) = year {
                config.filter.year = *year;
            }
            if let Some(exp_type) = exp_type {
                config.filter.exp_type = exp_type.clone();
            }
            if let Some(output) = output {
                config.output.report_path = Some(output.clone());
            }
            config.validate()?;
            aggregate_command(&config, report, *from_partitions)
        }

        Commands::Validate => validate_command(&cli),

        Commands::GenerateConfig { output } => generate_config_command(output),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match (&cli.config, &cli.input) {
        (Some(path), _) => Config::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        (None, Some(input)) => Config::for_input(input),
        (None, None) => anyhow::bail!("either --config or --input is required"),
    };

    if let Some(input) = &cli.input {
        config.input.path = input.clone();
    }
    if let Some(step) = cli.step {
        config.input.step = step;
    }
    if cli.parallel {
        config.processing.parallel = true;
    }
    if let Some(threads) = cli.threads {
        config.processing.rayon_threads = Some(threads);
    }

    config.validate()?;
    init_rayon(config.processing.rayon_threads)?;
    Ok(config)
}

/// Logs where a failed ingest stopped so it can be resumed.
fn report_ingest_failure(err: ProcessorError) -> anyhow::Error {
    if let Some(batch) = err.batch() {
        tracing::error!(batch, kind = ?err.kind(), "ingest failed, resume with --start-index {batch}");
    }
    err.into()
}

fn ingest_command(cli: &Cli, partition_dir: Option<PathBuf>, start_index: usize) -> Result<()> {
    let mut config = load_config(cli)?;
    if partition_dir.is_some() {
        config.output.partition_dir = partition_dir;
    }
    let Some(dir) = config.output.partition_dir.clone() else {
        anyhow::bail!("ingest needs --partition-dir or output.partition_dir");
    };

    tracing::info!(
        input = %config.input.path.display(),
        partitions = %dir.display(),
        step = config.input.step,
        start_index,
        "starting ingest"
    );

    let mut reader = ChunkReader::open(&config.input.path, config.input.step, config.read_options())
        .map_err(report_ingest_failure)?;
    let mut pipeline = Pipeline::new(PipelineOptions {
        start_index,
        partition_dir: Some(dir),
    });
    let summary = pipeline.ingest(&mut reader).map_err(report_ingest_failure)?;

    println!(
        "Ingested {} rows in {} batches ({} skipped)",
        summary.rows, summary.batches, summary.skipped
    );
    Ok(())
}

fn aggregate_command(
    config: &Config,
    reports: &[Report],
    from_partitions: bool,
) -> Result<()> {
    let specs: Vec<AggregationSpec> = reports
        .iter()
        .map(|report| match report {
            Report::YearlySum => AggregationSpec::sum_by_year(),
            Report::YearlyAgg => AggregationSpec::agg_by_year(),
            Report::MonthlyAverage => {
                AggregationSpec::monthly_average(config.filter.year, &config.filter.exp_type)
            }
        })
        .collect();

    let source = if from_partitions {
        Source::Partitions
    } else {
        Source::Csv
    };
    let (tables, summary) = aggregate(config, source, &specs)?;

    for table in &tables {
        print_table(table);
    }

    if let Some(path) = &config.output.report_path {
        let report = JsonReport {
            input: &config.input.path,
            step: config.input.step,
            summary,
            tables: &tables,
        };
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &report)?;
        tracing::info!(path = %path.display(), "wrote report");
    }
    Ok(())
}

fn print_table(table: &AggregateTable) {
    let dims: Vec<&str> = table.dimensions.iter().map(|d| d.name()).collect();
    let measures: Vec<&str> = table.measures.iter().map(|m| m.name()).collect();

    println!("\n=== {} ===", table.name);
    println!("{}\t{}", dims.join(","), measures.join("\t"));
    for (key, values) in &table.rows {
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        println!("{}\t{}", key, values.join("\t"));
    }
    if table.is_empty() {
        println!("(no rows matched)");
    }
}

fn validate_command(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let reader = ChunkReader::open(&config.input.path, config.input.step, config.read_options())?;
    let spans = reader.batch_spans();
    let rows: usize = spans.iter().map(|s| s.rows).sum();

    println!("Configuration is valid");
    println!("Input: {}", config.input.path.display());
    println!("Rows: {} in {} batches of {}", rows, spans.len(), config.input.step);
    Ok(())
}

fn generate_config_command(output: &Path) -> Result<()> {
    let mut config = Config::for_input(Path::new("data/transactions.csv"));
    config.output.partition_dir = Some(PathBuf::from("data/partitions"));
    config.output.report_path = Some(PathBuf::from("report.json"));

    std::fs::write(output, config.to_yaml()?)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}
