use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
};

use crate::{
    helpers::csv_helpers::{has_rows_after, is_blank, next_line, skip_rows, split_fields, strip_bom},
    processor::{
        ParseError, ProcessorError,
        record::{Field, Record},
    },
};

/// What to do with a row that does not parse into the declared column types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedRows {
    /// Abort the read with [`ProcessorError::Format`]
    #[default]
    Fail,
    /// Drop the row, record it in [`Batch::skipped`] and keep going
    Skip,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub on_malformed: MalformedRows,
    /// Treat missing trailing columns as empty values
    pub allow_missing_columns: bool,
    /// Drop columns past the declared schema instead of failing
    pub ignore_excess_columns: bool,
}

/// A bounded slice of rows produced by one read
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub index: usize,
    pub records: Vec<Record>,
    /// Data rows consumed from the source, including skipped ones
    pub rows: usize,
    pub skipped: Vec<ParseError>,
}

impl Batch {
    pub fn empty(index: usize) -> Self {
        Batch {
            index,
            records: Vec::new(),
            rows: 0,
            skipped: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// A batch shorter than the step marks the end of input.
    pub fn is_final(&self, step: usize) -> bool {
        self.rows < step
    }
}

/// Byte range of one batch inside the mapped file, computed up front so
/// batches can be parsed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSpan {
    pub index: usize,
    pub start: usize,
    pub rows: usize,
    /// Physical lines consumed before `start`, header included
    pub line: u64,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    next_index: usize,
    offset: usize,
    line: u64,
}

/// Reads fixed-size row batches out of a memory mapped transactions CSV.
///
/// Only the batch being returned is materialized as [`Record`]s; the mapping
/// itself is released when the reader is dropped.
///
/// # Example
/// ```no_run
/// # use chunked_aggregator::processor::chunk_reader::{ChunkReader, ReadOptions};
/// let mut reader = ChunkReader::open("transactions.csv".as_ref(), 5_000_000, ReadOptions::default())?;
/// for batch in reader.batches() {
///     let batch = batch?;
///     println!("batch {} has {} rows", batch.index, batch.len());
/// }
/// # Ok::<(), chunked_aggregator::processor::ProcessorError>(())
/// ```
#[derive(Debug)]
pub struct ChunkReader {
    path: PathBuf,
    mmap: Option<Mmap>, // None for zero-length files
    data_start: usize,
    step: usize,
    options: ReadOptions,
    cursor: Cursor,
}

impl ChunkReader {
    /// Opens and maps `path`, validating the header row.
    ///
    /// # Errors
    /// - [`ProcessorError::Config`] if `step` is zero
    /// - [`ProcessorError::Io`] if the file cannot be opened or mapped
    /// - [`ProcessorError::Format`] if the header is missing or does not match
    pub fn open(path: &Path, step: usize, options: ReadOptions) -> Result<Self, ProcessorError> {
        if step == 0 {
            return Err(ProcessorError::Config("step must be greater than zero".into()));
        }

        let file = File::open(path).map_err(|e| ProcessorError::io(path, None, e))?;
        let len = file
            .metadata()
            .map_err(|e| ProcessorError::io(path, None, e))?
            .len();
        let mmap = if len == 0 {
            None
        } else {
            // The file is treated as immutable for the lifetime of the reader.
            Some(unsafe { Mmap::map(&file) }.map_err(|e| ProcessorError::io(path, None, e))?)
        };

        let mut reader = ChunkReader {
            path: path.to_path_buf(),
            mmap,
            data_start: 0,
            step,
            options,
            cursor: Cursor {
                next_index: 0,
                offset: 0,
                line: 1,
            },
        };
        reader.data_start = reader.validate_header()?;
        reader.cursor.offset = reader.data_start;

        tracing::debug!(
            path = %reader.path.display(),
            bytes = len,
            step,
            "opened transactions file"
        );
        Ok(reader)
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn step(&self) -> usize {
        self.step
    }

    fn validate_header(&self) -> Result<usize, ProcessorError> {
        let buf = self.bytes();
        let bom_len = buf.len() - strip_bom(buf).len();
        let header_error = |value: &[u8], error: String| ProcessorError::Format {
            batch: 0,
            error: ParseError {
                line: 1,
                column: String::new(),
                value: String::from_utf8_lossy(value).to_string(),
                error,
            },
        };

        let (header, data_start) =
            next_line(buf, bom_len).ok_or_else(|| header_error(&[], "missing header line".into()))?;

        let mut names = Vec::with_capacity(Field::ALL.len());
        split_fields(header, &mut names);
        let names: Vec<&[u8]> = names.iter().map(|n| n.trim_ascii()).collect();

        let expected = Field::ALL.len();
        if names.len() < expected || (names.len() > expected && !self.options.ignore_excess_columns) {
            return Err(header_error(
                header,
                format!("expected {} header columns, got {}", expected, names.len()),
            ));
        }
        for (field, name) in Field::ALL.iter().zip(&names) {
            if !name.eq_ignore_ascii_case(field.name().as_bytes()) {
                return Err(header_error(
                    header,
                    format!(
                        "expected column {} at position {}, got {}",
                        field,
                        field.index(),
                        String::from_utf8_lossy(name)
                    ),
                ));
            }
        }

        Ok(data_start)
    }

    /// Returns data rows `[index * step, index * step + step)`.
    ///
    /// Sequential calls continue from where the previous batch ended; any
    /// other index rescans line boundaries from the start of the data.
    /// A batch with fewer than `step` rows (possibly empty) means the input
    /// is exhausted.
    pub fn read_batch(&mut self, index: usize) -> Result<Batch, ProcessorError> {
        let (offset, line) = if index == self.cursor.next_index {
            (self.cursor.offset, self.cursor.line)
        } else {
            let (offset, lines, _) =
                skip_rows(self.bytes(), self.data_start, index.saturating_mul(self.step));
            (offset, 1 + lines)
        };

        let (batch, offset, line) = self.parse_rows(index, offset, line)?;
        self.cursor = Cursor {
            next_index: index + 1,
            offset,
            line,
        };
        Ok(batch)
    }

    /// Iterates batches from index 0 until the first short batch or error.
    pub fn batches(&mut self) -> Batches<'_> {
        Batches {
            reader: self,
            next: 0,
            done: false,
        }
    }

    /// True if non-blank input remains after the last batch read.
    pub fn has_remaining(&self) -> bool {
        has_rows_after(self.bytes(), self.cursor.offset)
    }

    /// Scans line boundaries once and returns the byte span of every batch,
    /// including the terminating short (possibly empty) one.
    pub fn batch_spans(&self) -> Vec<BatchSpan> {
        let data = self.bytes();
        let mut spans = Vec::new();
        let mut offset = self.data_start;
        let mut line = 1u64;

        for index in 0.. {
            let (end, lines, rows) = skip_rows(data, offset, self.step);
            spans.push(BatchSpan {
                index,
                start: offset,
                rows,
                line,
            });
            if rows < self.step {
                break;
            }
            offset = end;
            line += lines;
        }
        spans
    }

    /// Parses one span produced by [`ChunkReader::batch_spans`].
    pub fn read_span(&self, span: &BatchSpan) -> Result<Batch, ProcessorError> {
        let (batch, _, _) = self.parse_rows(span.index, span.start, span.line)?;
        Ok(batch)
    }

    fn parse_rows(
        &self,
        index: usize,
        mut offset: usize,
        mut line: u64,
    ) -> Result<(Batch, usize, u64), ProcessorError> {
        let data = self.bytes();
        let mut batch = Batch::empty(index);
        batch.records.reserve(self.step.min(64 * 1024));
        let mut fields = Vec::with_capacity(Field::ALL.len());

        while batch.rows < self.step {
            let Some((raw, next)) = next_line(data, offset) else {
                break;
            };
            offset = next;
            line += 1;
            if is_blank(raw) {
                continue;
            }
            batch.rows += 1;

            match self.parse_line(raw, line, &mut fields) {
                Ok(record) => batch.records.push(record),
                Err(error) => match self.options.on_malformed {
                    MalformedRows::Fail => {
                        return Err(ProcessorError::Format {
                            batch: index,
                            error,
                        });
                    }
                    MalformedRows::Skip => {
                        tracing::warn!(batch = index, "skipping malformed row: {}", error);
                        batch.skipped.push(error);
                    }
                },
            }
        }

        Ok((batch, offset, line))
    }

    fn parse_line<'a>(
        &self,
        raw: &'a [u8],
        line: u64,
        fields: &mut Vec<&'a [u8]>,
    ) -> Result<Record, ParseError> {
        split_fields(raw, fields);

        let expected = Field::ALL.len();
        let got = fields.len();
        if (got > expected && !self.options.ignore_excess_columns)
            || (got < expected && !self.options.allow_missing_columns)
        {
            return Err(ParseError {
                line,
                column: String::new(),
                value: String::from_utf8_lossy(raw).to_string(),
                error: format!("Expected {} fields, got {}", expected, got),
            });
        }
        fields.truncate(expected);

        Record::parse(&fields[..]).map_err(|e| ParseError {
            line,
            column: e.field.name().to_string(),
            value: e.value,
            error: e.reason,
        })
    }
}

/// Iterator returned by [`ChunkReader::batches`]
pub struct Batches<'a> {
    reader: &'a mut ChunkReader,
    next: usize,
    done: bool,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch, ProcessorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.reader.read_batch(self.next);
        match &result {
            Ok(batch) if !batch.is_final(self.reader.step) => self.next += 1,
            _ => self.done = true,
        }
        Some(result)
    }
}

/// Convenience wrapper: opens `path`, reads one batch and releases the file.
pub fn read_batch(
    path: &Path,
    step: usize,
    index: usize,
    options: ReadOptions,
) -> Result<Batch, ProcessorError> {
    let mut reader = ChunkReader::open(path, step, options)?;
    reader.read_batch(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ErrorKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "CUST_ID,START_DATE,END_DATE,TRANS_ID,DATE,YEAR,MONTH,DAY,EXP_TYPE,AMOUNT";

    fn row(i: usize) -> String {
        format!("C{i},2015-01-01,,T{i},2015-02-03,2015,2,3,Food,{i}.5")
    }

    fn write_csv(body: &str) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        write!(tmp, "{}", body).unwrap();
        tmp
    }

    fn csv_with_rows(n: usize) -> NamedTempFile {
        let mut body = format!("{HEADER}\n");
        for i in 0..n {
            body.push_str(&row(i));
            body.push('\n');
        }
        write_csv(&body)
    }

    #[test]
    fn test_batches_cover_all_rows_in_order() {
        let tmp = csv_with_rows(10);
        let mut reader = ChunkReader::open(tmp.path(), 4, ReadOptions::default()).unwrap();
        let batches: Vec<Batch> = reader.batches().collect::<Result<_, _>>().unwrap();

        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        let ids: Vec<String> = batches
            .iter()
            .flat_map(|b| b.records.iter().map(|r| r.trans_id.clone()))
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("T{i}")).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_exact_multiple_yields_empty_terminating_batch() {
        let tmp = csv_with_rows(8);
        let mut reader = ChunkReader::open(tmp.path(), 4, ReadOptions::default()).unwrap();
        let sizes: Vec<usize> = reader.batches().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 4, 0]);
    }

    #[test]
    fn test_random_access_matches_sequential() {
        let tmp = csv_with_rows(10);
        let mut reader = ChunkReader::open(tmp.path(), 3, ReadOptions::default()).unwrap();
        let third = reader.read_batch(2).unwrap();
        let first = reader.read_batch(0).unwrap();
        assert_eq!(first.records[0].trans_id, "T0");
        assert_eq!(third.records[0].trans_id, "T6");
        assert_eq!(reader.read_batch(5).unwrap().len(), 0);
    }

    #[test]
    fn test_spans_match_sequential_batches() {
        let tmp = csv_with_rows(7);
        let mut reader = ChunkReader::open(tmp.path(), 3, ReadOptions::default()).unwrap();
        let spans = reader.batch_spans();
        assert_eq!(spans.iter().map(|s| s.rows).collect::<Vec<_>>(), vec![3, 3, 1]);

        let from_spans: Vec<Batch> = spans.iter().map(|s| reader.read_span(s).unwrap()).collect();
        let sequential: Vec<Batch> = reader.batches().collect::<Result<_, _>>().unwrap();
        assert_eq!(from_spans, sequential);
    }

    #[test]
    fn test_header_only_file_gives_empty_batch() {
        let tmp = write_csv(&format!("{HEADER}\n"));
        let batch = read_batch(tmp.path(), 5, 0, ReadOptions::default()).unwrap();
        assert!(batch.is_empty());
        assert!(batch.is_final(5));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ChunkReader::open("/definitely/not/here.csv".as_ref(), 5, ReadOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_wrong_header_is_format_error() {
        let tmp = write_csv("id,value\n1,2\n");
        let err = ChunkReader::open(tmp.path(), 5, ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        let empty = write_csv("");
        let err = ChunkReader::open(empty.path(), 5, ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_malformed_row_fails_with_line_and_batch() {
        let body = format!("{HEADER}\n{}\n{}\nC9,2015-01-01,,T9,2015-02-03,2015,2,3,Food,oops\n", row(0), row(1));
        let tmp = write_csv(&body);
        let mut reader = ChunkReader::open(tmp.path(), 2, ReadOptions::default()).unwrap();
        reader.read_batch(0).unwrap();
        match reader.read_batch(1).unwrap_err() {
            ProcessorError::Format { batch, error } => {
                assert_eq!(batch, 1);
                assert_eq!(error.line, 4);
                assert_eq!(error.column, "AMOUNT");
                assert_eq!(error.value, "oops");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_skip_policy_counts_skipped_rows() {
        let body = format!("{HEADER}\n{}\nbroken,row\n{}\n", row(0), row(2));
        let tmp = write_csv(&body);
        let options = ReadOptions {
            on_malformed: MalformedRows::Skip,
            ..ReadOptions::default()
        };
        let batch = read_batch(tmp.path(), 3, 0, options).unwrap();
        assert_eq!(batch.rows, 3);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.skipped.len(), 1);
        assert_eq!(batch.skipped[0].line, 3);
        assert!(!batch.is_final(3));
    }

    #[test]
    fn test_column_count_tolerance() {
        let body = format!(
            "{HEADER}\n{},extra\nC1,2015-01-01,,T1,2015-02-03,2015,2,3,Food\n",
            row(0)
        );
        let tmp = write_csv(&body);
        assert!(read_batch(tmp.path(), 5, 0, ReadOptions::default()).is_err());

        let lenient = ReadOptions {
            ignore_excess_columns: true,
            ..ReadOptions::default()
        };
        // The second row is missing AMOUNT, which stays a format error.
        let err = read_batch(tmp.path(), 5, 0, ReadOptions { allow_missing_columns: true, ..lenient })
            .unwrap_err();
        match err {
            ProcessorError::Format { error, .. } => assert_eq!(error.column, "AMOUNT"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let body = format!("{HEADER}\r\n{}\r\n\r\n{}\r\n", row(0), row(1));
        let tmp = write_csv(&body);
        let batch = read_batch(tmp.path(), 5, 0, ReadOptions::default()).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[1].amount, 1.5);
    }
}
