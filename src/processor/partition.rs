//! Persisted batches.
//!
//! Each batch read from the source can be written as one Arrow IPC file,
//! `<dir>/<index>.arrow`, so an interrupted ingest can resume from the failing
//! batch and later runs can aggregate without re-parsing the CSV. The step and
//! the number of source rows consumed are kept in the schema metadata.

use arrow2::{
    array::{Array, Float64Array, Int32Array, MutableUtf8Array, UInt8Array, Utf8Array},
    chunk::Chunk,
    datatypes::{DataType, Field as ArrowField, Metadata, Schema},
    io::ipc::{
        read::{FileReader, read_file_metadata},
        write::{FileWriter, WriteOptions},
    },
};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use crate::processor::{
    ProcessorError,
    chunk_reader::Batch,
    record::{Field, Record, date_to_days, days_to_date},
};

const EXTENSION: &str = "arrow";
const STEP_KEY: &str = "step";
const INDEX_KEY: &str = "batch_index";
const ROWS_KEY: &str = "rows";

fn partition_schema(metadata: Metadata) -> Schema {
    let fields: Vec<ArrowField> = Field::ALL
        .iter()
        .map(|field| {
            let (dtype, nullable) = match field {
                Field::CustId | Field::TransId | Field::ExpType => (DataType::Utf8, false),
                Field::StartDate | Field::Date => (DataType::Date32, false),
                Field::EndDate => (DataType::Date32, true),
                Field::Year => (DataType::Int32, false),
                Field::Month | Field::Day => (DataType::UInt8, false),
                Field::Amount => (DataType::Float64, false),
            };
            ArrowField::new(field.name(), dtype, nullable)
        })
        .collect();
    Schema::from(fields).with_metadata(metadata)
}

fn utf8_column<'a>(values: impl Iterator<Item = &'a str>) -> Box<dyn Array> {
    let mut arr = MutableUtf8Array::<i32>::new();
    for v in values {
        arr.push(Some(v));
    }
    let array: Utf8Array<i32> = arr.into();
    array.boxed()
}

fn batch_to_chunk(batch: &Batch) -> Chunk<Box<dyn Array>> {
    let records = &batch.records;
    let dates = |f: fn(&Record) -> i32| -> Box<dyn Array> {
        Int32Array::from_vec(records.iter().map(f).collect())
            .to(DataType::Date32)
            .boxed()
    };

    Chunk::new(vec![
        utf8_column(records.iter().map(|r| r.cust_id.as_str())),
        dates(|r| date_to_days(r.start_date)),
        Int32Array::from(
            records
                .iter()
                .map(|r| r.end_date.map(date_to_days))
                .collect::<Vec<_>>(),
        )
        .to(DataType::Date32)
        .boxed(),
        utf8_column(records.iter().map(|r| r.trans_id.as_str())),
        dates(|r| date_to_days(r.date)),
        Int32Array::from_vec(records.iter().map(|r| r.year).collect()).boxed(),
        UInt8Array::from_vec(records.iter().map(|r| r.month).collect()).boxed(),
        UInt8Array::from_vec(records.iter().map(|r| r.day).collect()).boxed(),
        utf8_column(records.iter().map(|r| r.exp_type.as_str())),
        Float64Array::from_vec(records.iter().map(|r| r.amount).collect()).boxed(),
    ])
}

/// Writes batches into a partition directory
#[derive(Debug, Clone)]
pub struct PartitionWriter {
    dir: PathBuf,
    step: usize,
}

impl PartitionWriter {
    pub fn create(dir: &Path, step: usize) -> Result<Self, ProcessorError> {
        fs::create_dir_all(dir).map_err(|e| ProcessorError::io(dir, None, e))?;
        Ok(PartitionWriter {
            dir: dir.to_path_buf(),
            step,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(dir: &Path, index: usize) -> PathBuf {
        dir.join(format!("{index}.{EXTENSION}"))
    }

    /// Writes `batch` to `<dir>/<index>.arrow`, replacing any previous file
    /// for that index only once the new one is complete.
    pub fn write(&self, batch: &Batch) -> Result<PathBuf, ProcessorError> {
        let index = batch.index;
        let path = Self::path_for(&self.dir, index);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));

        let mut metadata = Metadata::new();
        metadata.insert(STEP_KEY.to_string(), self.step.to_string());
        metadata.insert(INDEX_KEY.to_string(), index.to_string());
        metadata.insert(ROWS_KEY.to_string(), batch.rows.to_string());

        let arrow_err = |source| ProcessorError::Partition {
            batch: Some(index),
            source,
        };

        let file = File::create(&tmp).map_err(|e| ProcessorError::io(&tmp, Some(index), e))?;
        let options = WriteOptions { compression: None };
        let mut writer = FileWriter::try_new(file, partition_schema(metadata), None, options)
            .map_err(arrow_err)?;
        writer.write(&batch_to_chunk(batch), None).map_err(arrow_err)?;
        writer.finish().map_err(arrow_err)?;
        drop(writer);

        fs::rename(&tmp, &path).map_err(|e| ProcessorError::io(&path, Some(index), e))?;
        Ok(path)
    }
}

/// A directory of partitions written by [`PartitionWriter`], readable as a
/// batch source in index order
#[derive(Debug)]
pub struct PartitionSet {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    step: usize,
    /// Rows consumed by the highest-numbered partition
    last_rows: usize,
    last_read: Option<usize>,
}

impl PartitionSet {
    /// Discovers `<index>.arrow` files under `dir`. Indices must be contiguous
    /// from 0 and share one step.
    ///
    /// A complete set ends with a partition shorter than the step. If the last
    /// partition is full, the set is still opened (an interrupted ingest can be
    /// inspected) but reading past it fails with
    /// [`ProcessorError::MissingPartition`].
    pub fn open(dir: &Path) -> Result<Self, ProcessorError> {
        let entries = fs::read_dir(dir).map_err(|e| ProcessorError::io(dir, None, e))?;

        let mut indexed = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| ProcessorError::io(dir, None, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(index) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<usize>().ok())
            else {
                continue;
            };
            indexed.push((index, path));
        }
        indexed.sort_by_key(|(index, _)| *index);

        for (expected, (index, _)) in indexed.iter().enumerate() {
            if *index != expected {
                return Err(ProcessorError::Config(format!(
                    "partition {} missing from {}",
                    expected,
                    dir.display()
                )));
            }
        }

        let paths: Vec<PathBuf> = indexed.into_iter().map(|(_, path)| path).collect();
        let first = paths.first().ok_or_else(|| {
            ProcessorError::Config(format!("no partitions found in {}", dir.display()))
        })?;
        let (step, _) = read_header(first, 0)?;
        let last_index = paths.len() - 1;
        let (last_step, last_rows) = read_header(&paths[last_index], last_index)?;
        if last_step != step {
            return Err(ProcessorError::Config(format!(
                "partition {} has step {} but the set uses {}",
                paths[last_index].display(),
                last_step,
                step
            )));
        }

        tracing::debug!(
            dir = %dir.display(),
            partitions = paths.len(),
            step,
            complete = last_rows < step,
            "opened partition set"
        );
        Ok(PartitionSet {
            dir: dir.to_path_buf(),
            paths,
            step,
            last_rows,
            last_read: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// True if the last partition is shorter than the step, i.e. the ingest
    /// that wrote the set ran to the end of its input.
    pub fn is_complete(&self) -> bool {
        self.last_rows < self.step
    }

    /// Reads partition `index`. Indices past the last partition read as empty
    /// when the set is complete.
    ///
    /// # Errors
    /// [`ProcessorError::MissingPartition`] for an index past the end of an
    /// incomplete set.
    pub fn read_batch(&mut self, index: usize) -> Result<Batch, ProcessorError> {
        self.last_read = Some(index);
        let Some(path) = self.paths.get(index) else {
            if !self.is_complete() {
                return Err(ProcessorError::MissingPartition {
                    batch: self.paths.len(),
                    dir: self.dir.clone(),
                });
            }
            return Ok(Batch::empty(index));
        };

        let mut file = File::open(path).map_err(|e| ProcessorError::io(path, Some(index), e))?;
        let metadata = read_file_metadata(&mut file).map_err(|source| ProcessorError::Partition {
            batch: Some(index),
            source,
        })?;
        let (step, rows) = header_values(&metadata.schema.metadata, path, index)?;
        if step != self.step {
            return Err(ProcessorError::Config(format!(
                "partition {} has step {} but the set uses {}",
                path.display(),
                step,
                self.step
            )));
        }

        let mut batch = Batch::empty(index);
        for chunk in FileReader::new(file, metadata, None, None) {
            let chunk = chunk.map_err(|source| ProcessorError::Partition {
                batch: Some(index),
                source,
            })?;
            append_records(&chunk, &mut batch.records, index)?;
        }
        batch.rows = rows;
        Ok(batch)
    }

    /// True once the last partition has been read.
    pub fn is_exhausted(&self) -> bool {
        self.last_read.is_some_and(|i| i + 1 >= self.paths.len())
    }
}

fn read_header(path: &Path, index: usize) -> Result<(usize, usize), ProcessorError> {
    let mut file = File::open(path).map_err(|e| ProcessorError::io(path, Some(index), e))?;
    let metadata = read_file_metadata(&mut file).map_err(|source| ProcessorError::Partition {
        batch: Some(index),
        source,
    })?;
    header_values(&metadata.schema.metadata, path, index)
}

fn header_values(
    metadata: &Metadata,
    path: &Path,
    index: usize,
) -> Result<(usize, usize), ProcessorError> {
    let value = |key: &str| {
        metadata
            .get(key)
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| {
                ProcessorError::Config(format!(
                    "partition {} (batch {}) has no {} metadata",
                    path.display(),
                    index,
                    key
                ))
            })
    };
    Ok((value(STEP_KEY)?, value(ROWS_KEY)?))
}

fn column<'a, T: 'static>(
    chunk: &'a Chunk<Box<dyn Array>>,
    field: Field,
    index: usize,
) -> Result<&'a T, ProcessorError> {
    chunk
        .arrays()
        .get(field.index())
        .and_then(|array| array.as_any().downcast_ref::<T>())
        .ok_or_else(|| {
            ProcessorError::Config(format!(
                "partition for batch {} has an unexpected type for column {}",
                index, field
            ))
        })
}

fn append_records(
    chunk: &Chunk<Box<dyn Array>>,
    out: &mut Vec<Record>,
    index: usize,
) -> Result<(), ProcessorError> {
    let cust_id = column::<Utf8Array<i32>>(chunk, Field::CustId, index)?;
    let start_date = column::<Int32Array>(chunk, Field::StartDate, index)?;
    let end_date = column::<Int32Array>(chunk, Field::EndDate, index)?;
    let trans_id = column::<Utf8Array<i32>>(chunk, Field::TransId, index)?;
    let date = column::<Int32Array>(chunk, Field::Date, index)?;
    let year = column::<Int32Array>(chunk, Field::Year, index)?;
    let month = column::<UInt8Array>(chunk, Field::Month, index)?;
    let day = column::<UInt8Array>(chunk, Field::Day, index)?;
    let exp_type = column::<Utf8Array<i32>>(chunk, Field::ExpType, index)?;
    let amount = column::<Float64Array>(chunk, Field::Amount, index)?;

    let to_date = |days: i32, field: Field| {
        days_to_date(days).ok_or_else(|| {
            ProcessorError::Config(format!(
                "partition for batch {} has an out of range {} value",
                index, field
            ))
        })
    };

    out.reserve(chunk.len());
    for i in 0..chunk.len() {
        out.push(Record {
            cust_id: cust_id.value(i).to_string(),
            start_date: to_date(start_date.value(i), Field::StartDate)?,
            end_date: if end_date.is_null(i) {
                None
            } else {
                Some(to_date(end_date.value(i), Field::EndDate)?)
            },
            trans_id: trans_id.value(i).to_string(),
            date: to_date(date.value(i), Field::Date)?,
            year: year.value(i),
            month: month.value(i),
            day: day.value(i),
            exp_type: exp_type.value(i).to_string(),
            amount: amount.value(i),
        });
    }
    Ok(())
}
