use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::processor::{
    AggregateOp, AggregateResult, FilterPredicate, ProcessorError, Value,
    chunk_reader::Batch,
    record::{Field, Record},
};

/// Running totals for one group. Every field merges associatively, so
/// partial accumulators from different batches combine in any order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Accumulator {
    pub sum: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
}

impl Default for Accumulator {
    fn default() -> Self {
        Accumulator {
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Accumulator {
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    pub fn merge(&mut self, other: &Accumulator) {
        self.sum += other.sum;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn result(&self, op: AggregateOp) -> AggregateResult {
        match op {
            AggregateOp::Sum => AggregateResult::Float(self.sum),
            AggregateOp::Count => AggregateResult::Int(self.count as i64),
            AggregateOp::Avg => AggregateResult::Float(self.sum / self.count as f64),
            AggregateOp::Min => AggregateResult::Float(self.min),
            AggregateOp::Max => AggregateResult::Float(self.max),
        }
    }
}

/// Ordered tuple of group-by values
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct GroupKey(pub Vec<Value>);

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            values => {
                let parts: Vec<String> = values.iter().map(Value::to_string).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

/// Describes one aggregation: which records take part, how they are grouped
/// and which measures are reported.
///
/// # Example
/// ```rust
/// # use chunked_aggregator::processor::{AggregateOp, FilterPredicate, Value};
/// # use chunked_aggregator::processor::aggregator::AggregationSpec;
/// # use chunked_aggregator::processor::record::Field;
/// let spec = AggregationSpec::new("food_by_month")
///     .filter(Field::ExpType, FilterPredicate::Equals(Value::Str("Food".into())))
///     .group_by(Field::Month)
///     .aggregates(vec![AggregateOp::Sum, AggregateOp::Count]);
/// assert!(spec.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSpec {
    name: String,
    group_by: Vec<Field>,
    measure: Field,
    ops: Vec<AggregateOp>,
    filters: Vec<(Field, FilterPredicate)>,
    collapse: Option<Field>,
}

impl AggregationSpec {
    pub fn new(name: &str) -> Self {
        AggregationSpec {
            name: name.to_string(),
            group_by: Vec::new(),
            measure: Field::Amount,
            ops: Vec::new(),
            filters: Vec::new(),
            collapse: None,
        }
    }

    /// Total AMOUNT per YEAR.
    pub fn sum_by_year() -> Self {
        AggregationSpec::new("sum_by_year")
            .group_by(Field::Year)
            .aggregate(AggregateOp::Sum)
    }

    /// Total AMOUNT and transaction count per YEAR.
    pub fn agg_by_year() -> Self {
        AggregationSpec::new("agg_by_year")
            .group_by(Field::Year)
            .aggregates(vec![AggregateOp::Sum, AggregateOp::Count])
    }

    /// Average across customers of each customer's monthly spend, for one
    /// year and expense type.
    pub fn monthly_average(year: i32, exp_type: &str) -> Self {
        AggregationSpec::new("monthly_average")
            .filter(Field::Year, FilterPredicate::Equals(Value::Int(year as i64)))
            .filter(
                Field::ExpType,
                FilterPredicate::Equals(Value::Str(exp_type.to_string())),
            )
            .group_by_multi(vec![Field::CustId, Field::Month])
            .aggregate(AggregateOp::Avg)
            .collapse(Field::CustId)
    }

    /// Add a group-by column
    pub fn group_by(mut self, field: Field) -> Self {
        self.group_by.push(field);
        self
    }

    pub fn group_by_multi(mut self, fields: Vec<Field>) -> Self {
        self.group_by.extend(fields);
        self
    }

    /// Column whose values are accumulated, AMOUNT unless overridden
    pub fn measure(mut self, field: Field) -> Self {
        self.measure = field;
        self
    }

    pub fn aggregate(mut self, op: AggregateOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn aggregates(mut self, ops: Vec<AggregateOp>) -> Self {
        self.ops.extend(ops);
        self
    }

    /// Add a filter condition. All filters must hold for a record to be folded.
    pub fn filter(mut self, field: Field, predicate: FilterPredicate) -> Self {
        self.filters.push((field, predicate));
        self
    }

    /// Drop `field` from the key when finalizing, re-aggregating the
    /// per-group sums across it.
    pub fn collapse(mut self, field: Field) -> Self {
        self.collapse = Some(field);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_by_fields(&self) -> &[Field] {
        &self.group_by
    }

    pub fn measure_field(&self) -> Field {
        self.measure
    }

    pub fn ops(&self) -> &[AggregateOp] {
        &self.ops
    }

    pub fn filters(&self) -> &[(Field, FilterPredicate)] {
        &self.filters
    }

    pub fn collapse_field(&self) -> Option<Field> {
        self.collapse
    }

    pub fn validate(&self) -> Result<(), ProcessorError> {
        let invalid = |msg: String| Err(ProcessorError::Config(format!("{}: {}", self.name, msg)));

        if self.group_by.is_empty() {
            return invalid("at least one group-by column is required".into());
        }
        if self.ops.is_empty() {
            return invalid("at least one aggregate operation is required".into());
        }
        if !self.measure.is_numeric() {
            return invalid(format!("measure column {} is not numeric", self.measure));
        }
        if let Some(collapse) = self.collapse {
            if !self.group_by.contains(&collapse) {
                return invalid(format!("collapse column {collapse} is not a group-by column"));
            }
            if self.group_by.len() < 2 {
                return invalid(format!("collapsing {collapse} would leave no group-by column"));
            }
        }
        Ok(())
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.filters
            .iter()
            .all(|(field, predicate)| predicate.matches(&record.value(*field)))
    }

    pub fn key(&self, record: &Record) -> GroupKey {
        GroupKey(self.group_by.iter().map(|f| record.value(*f)).collect())
    }
}

/// Per-key running totals for one aggregation run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateState {
    groups: HashMap<GroupKey, Accumulator>,
    batches: usize,
    rows_seen: u64,
    rows_folded: u64,
}

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `batch` in place. Records rejected by the filters only count
    /// towards `rows_seen`.
    pub fn fold_batch(&mut self, spec: &AggregationSpec, batch: &Batch) {
        if batch.is_empty() {
            return;
        }
        self.batches += 1;
        self.rows_seen += batch.len() as u64;

        let measure = spec.measure_field();
        for record in batch.records.iter().filter(|r| spec.matches(r)) {
            let Some(value) = record.numeric(measure) else {
                continue;
            };
            self.groups.entry(spec.key(record)).or_default().update(value);
            self.rows_folded += 1;
        }
    }

    /// Combines a partial state computed over a disjoint set of batches.
    pub fn merge(&mut self, other: AggregateState) {
        for (key, acc) in other.groups {
            self.groups.entry(key).or_default().merge(&acc);
        }
        self.batches += other.batches;
        self.rows_seen += other.rows_seen;
        self.rows_folded += other.rows_folded;
    }

    pub fn groups(&self) -> &HashMap<GroupKey, Accumulator> {
        &self.groups
    }

    /// Non-empty batches folded so far
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    pub fn rows_folded(&self) -> u64 {
        self.rows_folded
    }
}

/// Pure fold step: returns `state` updated with `batch`.
pub fn fold(spec: &AggregationSpec, batch: &Batch, mut state: AggregateState) -> AggregateState {
    state.fold_batch(spec, batch);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(cust: &str, year: i32, month: u8, exp_type: &str, amount: f64) -> Record {
        let date = NaiveDate::from_ymd_opt(year, month as u32, 1).unwrap();
        Record {
            cust_id: cust.to_string(),
            start_date: date,
            end_date: None,
            trans_id: format!("{cust}-{year}-{month}"),
            date,
            year,
            month,
            day: 1,
            exp_type: exp_type.to_string(),
            amount,
        }
    }

    fn batch(index: usize, records: Vec<Record>) -> Batch {
        Batch {
            index,
            rows: records.len(),
            records,
            skipped: Vec::new(),
        }
    }

    #[test]
    fn test_sum_by_year_fold() {
        let spec = AggregationSpec::sum_by_year();
        let b = batch(
            0,
            vec![
                record("a", 2010, 1, "Food", 1.0),
                record("b", 2010, 2, "Food", 2.0),
                record("a", 2011, 1, "Food", 4.0),
            ],
        );
        let state = fold(&spec, &b, AggregateState::new());
        let y2010 = state.groups()[&GroupKey(vec![Value::Int(2010)])];
        assert_eq!(y2010.sum, 3.0);
        assert_eq!(y2010.count, 2);
        assert_eq!(state.batches(), 1);
        assert_eq!(state.rows_folded(), 3);
    }

    #[test]
    fn test_filter_applies_before_folding() {
        let spec = AggregationSpec::monthly_average(2020, "Entertainment");
        let b = batch(
            0,
            vec![
                record("a", 2020, 1, "Entertainment", 10.0),
                record("a", 2019, 1, "Entertainment", 100.0),
                record("a", 2020, 1, "Food", 1000.0),
                record("b", 2020, 1, "Entertainment", 30.0),
            ],
        );
        let state = fold(&spec, &b, AggregateState::new());
        assert_eq!(state.rows_seen(), 4);
        assert_eq!(state.rows_folded(), 2);
        assert_eq!(state.groups().len(), 2);
        let a = state.groups()[&GroupKey(vec![Value::Str("a".into()), Value::Int(1)])];
        assert_eq!(a.sum, 10.0);
    }

    #[test]
    fn test_customer_month_sums_span_batches() {
        let spec = AggregationSpec::monthly_average(2020, "Entertainment");
        let first = batch(0, vec![record("a", 2020, 3, "Entertainment", 5.0)]);
        let second = batch(1, vec![record("a", 2020, 3, "Entertainment", 7.0)]);
        let state = fold(&spec, &second, fold(&spec, &first, AggregateState::new()));
        let a = state.groups()[&GroupKey(vec![Value::Str("a".into()), Value::Int(3)])];
        assert_eq!(a.sum, 12.0);
        assert_eq!(a.count, 2);
    }

    #[test]
    fn test_merge_equals_sequential_fold() {
        let spec = AggregationSpec::agg_by_year();
        let batches: Vec<Batch> = (0..6)
            .map(|i| {
                batch(
                    i,
                    (0..5)
                        .map(|j| record("c", 2010 + (j % 3) as i32, 1, "Food", (i * 5 + j) as f64))
                        .collect(),
                )
            })
            .collect();

        let sequential = batches
            .iter()
            .fold(AggregateState::new(), |state, b| fold(&spec, b, state));

        let mut left = batches[..2]
            .iter()
            .fold(AggregateState::new(), |state, b| fold(&spec, b, state));
        let right = batches[2..]
            .iter()
            .rev()
            .fold(AggregateState::new(), |state, b| fold(&spec, b, state));
        left.merge(right);

        assert_eq!(left.batches(), sequential.batches());
        assert_eq!(left.rows_seen(), sequential.rows_seen());
        for (key, acc) in sequential.groups() {
            let merged = left.groups()[key];
            assert_eq!(merged.count, acc.count);
            assert!((merged.sum - acc.sum).abs() < 1e-9);
            assert_eq!(merged.min, acc.min);
            assert_eq!(merged.max, acc.max);
        }
    }

    #[test]
    fn test_empty_batch_is_not_counted() {
        let spec = AggregationSpec::sum_by_year();
        let state = fold(&spec, &Batch::empty(0), AggregateState::new());
        assert_eq!(state.batches(), 0);
        assert!(state.groups().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_specs() {
        assert!(AggregationSpec::new("x").aggregate(AggregateOp::Sum).validate().is_err());
        assert!(AggregationSpec::new("x").group_by(Field::Year).validate().is_err());
        assert!(
            AggregationSpec::new("x")
                .group_by(Field::Year)
                .aggregate(AggregateOp::Sum)
                .measure(Field::ExpType)
                .validate()
                .is_err()
        );
        assert!(
            AggregationSpec::new("x")
                .group_by(Field::Year)
                .aggregate(AggregateOp::Avg)
                .collapse(Field::Year)
                .validate()
                .is_err()
        );
        assert!(AggregationSpec::monthly_average(2020, "Food").validate().is_ok());
    }
}
