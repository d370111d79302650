use chunked_aggregator::{
    AggregationSpec, ChunkReader, Field, Pipeline, PipelineOptions, ReadOptions,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rayon::ThreadPoolBuilder;
use std::io::{BufWriter, Write};
use tempfile::NamedTempFile;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

const ROWS: usize = 200_000;

fn synthetic_csv(rows: usize) -> NamedTempFile {
    let tmp = NamedTempFile::new().unwrap();
    let mut writer = BufWriter::new(tmp.reopen().unwrap());
    writeln!(writer, "{}", Field::header_line()).unwrap();
    let types = ["Entertainment", "Food", "Bills", "Fuel"];
    for i in 0..rows {
        let year = 2015 + i % 8;
        let month = i % 12 + 1;
        writeln!(
            writer,
            "CI{:05},2014-03-01,,T{:09},{}-{:02}-15,{},{},15,{},{}.{:02}",
            i % 5000,
            i,
            year,
            month,
            year,
            month,
            types[i % types.len()],
            i % 500,
            i % 100
        )
        .unwrap();
    }
    writer.flush().unwrap();
    tmp
}

fn specs() -> Vec<AggregationSpec> {
    vec![
        AggregationSpec::agg_by_year(),
        AggregationSpec::monthly_average(2020, "Entertainment"),
    ]
}

fn bench_pipeline(c: &mut Criterion) {
    let csv = synthetic_csv(ROWS);
    let path = csv.path();

    let mut group = c.benchmark_group("ChunkedAggregator");
    group.sample_size(10);
    group.throughput(Throughput::Elements(ROWS as u64));

    group.bench_function("read_batches", |b| {
        b.iter(|| {
            let mut reader = ChunkReader::open(path, 50_000, ReadOptions::default()).unwrap();
            reader.batches().map(|batch| batch.unwrap().len()).sum::<usize>()
        })
    });

    for step in [ROWS / 20, ROWS / 4, ROWS] {
        group.bench_with_input(BenchmarkId::new("sequential", step), &step, |b, &step| {
            b.iter(|| {
                let mut reader = ChunkReader::open(path, step, ReadOptions::default()).unwrap();
                Pipeline::new(PipelineOptions::default())
                    .run(&mut reader, &specs())
                    .unwrap()
            })
        });
    }

    for threads in [1, 4, 8] {
        let pool = ThreadPoolBuilder::new().num_threads(threads).build().unwrap();
        group.bench_with_input(BenchmarkId::new("parallel", threads), &threads, |b, _| {
            pool.install(|| {
                b.iter(|| {
                    let reader = ChunkReader::open(path, ROWS / 20, ReadOptions::default()).unwrap();
                    Pipeline::new(PipelineOptions::default())
                        .run_parallel(&reader, &specs())
                        .unwrap()
                })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
