use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod aggregator;
pub mod chunk_reader;
pub mod materializer;
pub mod partition;
pub mod pipeline;
pub mod record;

/// Error type used across the crate
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        batch: Option<usize>,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Partition error: {source}")]
    Partition {
        batch: Option<usize>,
        #[source]
        source: arrow2::error::Error,
    },

    #[error("Partition {batch} missing from {}: the last partition is full, so the ingest did not finish", dir.display())]
    MissingPartition { batch: usize, dir: PathBuf },

    #[error("Format error in batch {batch}: {error}")]
    Format { batch: usize, error: ParseError },

    #[error("Aggregation finalized without any data rows")]
    EmptyResult,

    #[error("Batch {batch} returned {actual} rows but {expected} were requested and input continues")]
    InconsistentStep {
        batch: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing column: {0}")]
    MissingColumn(String),
}

/// Coarse classification of [`ProcessorError`], used by callers that decide
/// whether a run can be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Format,
    EmptyResult,
    InconsistentStep,
    Config,
}

impl ProcessorError {
    pub fn io(path: &Path, batch: Option<usize>, source: std::io::Error) -> Self {
        ProcessorError::Io {
            batch,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessorError::Io { .. }
            | ProcessorError::Partition { .. }
            | ProcessorError::MissingPartition { .. } => ErrorKind::Io,
            ProcessorError::Format { .. } => ErrorKind::Format,
            ProcessorError::EmptyResult => ErrorKind::EmptyResult,
            ProcessorError::InconsistentStep { .. } => ErrorKind::InconsistentStep,
            ProcessorError::Config(_) | ProcessorError::MissingColumn(_) => ErrorKind::Config,
        }
    }

    /// Batch index at which the error occurred, when known.
    pub fn batch(&self) -> Option<usize> {
        match self {
            ProcessorError::Io { batch, .. } | ProcessorError::Partition { batch, .. } => *batch,
            ProcessorError::Format { batch, .. }
            | ProcessorError::MissingPartition { batch, .. }
            | ProcessorError::InconsistentStep { batch, .. } => Some(*batch),
            _ => None,
        }
    }
}

/// A row that failed to parse. `line` is the 1-based line in the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: u64,
    pub column: String,
    pub value: String,
    pub error: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.column.is_empty() {
            write!(f, "line {}: {}", self.line, self.error)
        } else {
            write!(
                f,
                "line {}, column {}: {} ({:?})",
                self.line, self.column, self.error, self.value
            )
        }
    }
}

/// Dynamic value of a record field, used for group keys and predicates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Missing optional field
    Null,
    /// Integer column
    Int(i64),
    /// Float column
    Float(f64),
    /// Calendar date
    Date(NaiveDate),
    /// String column
    Str(String),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Date(_) => 3,
            Value::Str(_) => 4,
        }
    }

    /// Compares two values of compatible types. Integers and floats compare
    /// numerically; anything involving `Null` or mismatched types is `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Int(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Date(v) => v.hash(state),
            Value::Str(v) => v.hash(state),
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            _ => self
                .compare(other)
                .filter(|ord| *ord != Ordering::Equal || self.rank() == other.rank())
                .unwrap_or_else(|| self.rank().cmp(&other.rank())),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str(""),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Value::Str(v) => f.write_str(v),
        }
    }
}

/// Filter predicate, evaluated per record before folding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterPredicate {
    Equals(Value),
    GreaterThan(Value),
    LessThan(Value),
    /// Inclusive on both ends
    Between(Value, Value),
}

impl FilterPredicate {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FilterPredicate::Equals(target) => value.compare(target) == Some(Ordering::Equal),
            FilterPredicate::GreaterThan(target) => {
                value.compare(target) == Some(Ordering::Greater)
            }
            FilterPredicate::LessThan(target) => value.compare(target) == Some(Ordering::Less),
            FilterPredicate::Between(low, high) => {
                matches!(
                    value.compare(low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(value.compare(high), Some(Ordering::Less | Ordering::Equal))
            }
        }
    }
}

/// Aggregate operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    /// Sum of all numeric values
    Sum,
    /// Count of all rows
    Count,
    /// Average of numeric values
    Avg,
    /// Minimum value
    Min,
    /// Maximum value
    Max,
}

impl AggregateOp {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Count => "count",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
        }
    }
}

/// Result of an aggregation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AggregateResult {
    Int(i64),
    Float(f64),
}

impl AggregateResult {
    pub fn as_f64(&self) -> f64 {
        match self {
            AggregateResult::Int(v) => *v as f64,
            AggregateResult::Float(v) => *v,
        }
    }
}

impl fmt::Display for AggregateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateResult::Int(v) => write!(f, "{v}"),
            AggregateResult::Float(v) => write!(f, "{v:.2}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_ordering_is_numeric_across_int_and_float() {
        let mut values = vec![Value::Float(2.5), Value::Int(3), Value::Int(1)];
        values.sort();
        assert_eq!(values, vec![Value::Int(1), Value::Float(2.5), Value::Int(3)]);
    }

    #[test]
    fn test_between_is_inclusive() {
        let pred = FilterPredicate::Between(Value::Int(2010), Value::Int(2012));
        assert!(pred.matches(&Value::Int(2010)));
        assert!(pred.matches(&Value::Int(2012)));
        assert!(!pred.matches(&Value::Int(2013)));
    }

    #[test]
    fn test_predicates_never_match_mismatched_types() {
        let pred = FilterPredicate::Equals(Value::Str("2020".into()));
        assert!(!pred.matches(&Value::Int(2020)));
        assert!(!FilterPredicate::LessThan(Value::Int(1)).matches(&Value::Null));
    }

    #[test]
    fn test_error_kind_and_batch() {
        let err = ProcessorError::InconsistentStep {
            batch: 3,
            expected: 10,
            actual: 4,
        };
        assert_eq!(err.kind(), ErrorKind::InconsistentStep);
        assert_eq!(err.batch(), Some(3));
        assert_eq!(ProcessorError::EmptyResult.batch(), None);
    }
}
