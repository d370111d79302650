use arrow2::{
    array::{Array, Float64Array, Int32Array, Int64Array, MutableUtf8Array, Utf8Array},
    chunk::Chunk,
    datatypes::{DataType, Field as ArrowField, Schema},
};
use serde::Serialize;
use std::collections::HashMap;

use crate::processor::{
    AggregateOp, AggregateResult, ProcessorError, Value,
    aggregator::{Accumulator, AggregateState, AggregationSpec, GroupKey},
    record::{Field, date_to_days},
};

/// Finalized aggregate, sorted ascending by key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateTable {
    pub name: String,
    pub dimensions: Vec<Field>,
    pub measures: Vec<AggregateOp>,
    pub rows: Vec<(GroupKey, Vec<AggregateResult>)>,
}

/// Single measure as two parallel sequences, the form charting code expects
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub keys: Vec<GroupKey>,
    pub values: Vec<f64>,
}

impl AggregateTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> Vec<GroupKey> {
        self.rows.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Values of `op` for each key, `None` if the table has no such measure.
    pub fn series(&self, op: AggregateOp) -> Option<Series> {
        let pos = self.measures.iter().position(|m| *m == op)?;
        Some(Series {
            keys: self.keys(),
            values: self.rows.iter().map(|(_, values)| values[pos].as_f64()).collect(),
        })
    }

    pub fn get(&self, key: &GroupKey, op: AggregateOp) -> Option<AggregateResult> {
        let pos = self.measures.iter().position(|m| *m == op)?;
        let idx = self.rows.binary_search_by(|(k, _)| k.cmp(key)).ok()?;
        Some(self.rows[idx].1[pos])
    }

    /// Columnar Arrow form: one column per dimension, then one per measure.
    pub fn to_arrow(&self) -> (Schema, Chunk<Box<dyn Array>>) {
        let mut fields = Vec::with_capacity(self.dimensions.len() + self.measures.len());
        let mut arrays: Vec<Box<dyn Array>> = Vec::with_capacity(fields.capacity());

        for (pos, dim) in self.dimensions.iter().enumerate() {
            let values = self.rows.iter().map(|(key, _)| &key.0[pos]);
            let (dtype, array) = dimension_array(*dim, values);
            fields.push(ArrowField::new(dim.name(), dtype, true));
            arrays.push(array);
        }

        for (pos, op) in self.measures.iter().enumerate() {
            let name = op.name();
            if *op == AggregateOp::Count {
                let values: Vec<i64> = self
                    .rows
                    .iter()
                    .map(|(_, v)| v[pos].as_f64() as i64)
                    .collect();
                fields.push(ArrowField::new(name, DataType::Int64, false));
                arrays.push(Int64Array::from_vec(values).boxed());
            } else {
                let values: Vec<f64> = self.rows.iter().map(|(_, v)| v[pos].as_f64()).collect();
                fields.push(ArrowField::new(name, DataType::Float64, false));
                arrays.push(Float64Array::from_vec(values).boxed());
            }
        }

        (Schema::from(fields), Chunk::new(arrays))
    }
}

fn dimension_array<'a>(
    field: Field,
    values: impl Iterator<Item = &'a Value>,
) -> (DataType, Box<dyn Array>) {
    match field {
        Field::Year | Field::Month | Field::Day => {
            let ints: Vec<Option<i64>> = values
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect();
            (DataType::Int64, Int64Array::from(ints).boxed())
        }
        Field::Amount => {
            let floats: Vec<Option<f64>> = values
                .map(|v| match v {
                    Value::Float(f) => Some(*f),
                    _ => None,
                })
                .collect();
            (DataType::Float64, Float64Array::from(floats).boxed())
        }
        Field::StartDate | Field::EndDate | Field::Date => {
            let days: Vec<Option<i32>> = values
                .map(|v| match v {
                    Value::Date(d) => Some(date_to_days(*d)),
                    _ => None,
                })
                .collect();
            (
                DataType::Date32,
                Int32Array::from(days).to(DataType::Date32).boxed(),
            )
        }
        Field::CustId | Field::TransId | Field::ExpType => {
            let mut arr = MutableUtf8Array::<i32>::new();
            for v in values {
                match v {
                    Value::Null => arr.push(None::<&str>),
                    other => arr.push(Some(other.to_string())),
                }
            }
            let array: Utf8Array<i32> = arr.into();
            (DataType::Utf8, array.boxed())
        }
    }
}

/// Finalizes `state` into a sorted [`AggregateTable`].
///
/// With a collapse column, each group's sum is re-accumulated under the key
/// with that column removed, so `Avg` becomes the average across the
/// collapsed dimension.
///
/// # Errors
/// [`ProcessorError::EmptyResult`] if no data row was ever folded. Rows that
/// were read but filtered out yield an empty table instead.
pub fn materialize(
    spec: &AggregationSpec,
    state: &AggregateState,
) -> Result<AggregateTable, ProcessorError> {
    if state.batches() == 0 || state.rows_seen() == 0 {
        return Err(ProcessorError::EmptyResult);
    }

    let (dimensions, groups): (Vec<Field>, HashMap<GroupKey, Accumulator>) =
        match spec.collapse_field() {
            None => (spec.group_by_fields().to_vec(), state.groups().clone()),
            Some(collapse) => {
                let pos = spec
                    .group_by_fields()
                    .iter()
                    .position(|f| *f == collapse)
                    .ok_or_else(|| {
                        ProcessorError::Config(format!(
                            "{}: collapse column {} is not a group-by column",
                            spec.name(),
                            collapse
                        ))
                    })?;

                let mut collapsed: HashMap<GroupKey, Accumulator> = HashMap::new();
                for (key, acc) in state.groups() {
                    let mut reduced = key.0.clone();
                    reduced.remove(pos);
                    collapsed.entry(GroupKey(reduced)).or_default().update(acc.sum);
                }

                let dims = spec
                    .group_by_fields()
                    .iter()
                    .copied()
                    .filter(|f| *f != collapse)
                    .collect();
                (dims, collapsed)
            }
        };

    let mut rows: Vec<(GroupKey, Vec<AggregateResult>)> = groups
        .into_iter()
        .map(|(key, acc)| {
            let values = spec.ops().iter().map(|op| acc.result(*op)).collect();
            (key, values)
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(AggregateTable {
        name: spec.name().to_string(),
        dimensions,
        measures: spec.ops().to_vec(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{
        aggregator::fold,
        chunk_reader::Batch,
        record::Record,
    };
    use chrono::NaiveDate;

    fn record(cust: &str, year: i32, month: u8, amount: f64) -> Record {
        let date = NaiveDate::from_ymd_opt(year, month as u32, 1).unwrap();
        Record {
            cust_id: cust.to_string(),
            start_date: date,
            end_date: None,
            trans_id: "t".to_string(),
            date,
            year,
            month,
            day: 1,
            exp_type: "Entertainment".to_string(),
            amount,
        }
    }

    fn batch(records: Vec<Record>) -> Batch {
        Batch {
            index: 0,
            rows: records.len(),
            records,
            skipped: Vec::new(),
        }
    }

    #[test]
    fn test_rows_sorted_by_key() {
        let spec = AggregationSpec::agg_by_year();
        let state = fold(
            &spec,
            &batch(vec![
                record("a", 2012, 1, 1.0),
                record("a", 2010, 1, 2.0),
                record("a", 2011, 1, 3.0),
                record("a", 2010, 1, 4.0),
            ]),
            AggregateState::new(),
        );
        let table = materialize(&spec, &state).unwrap();
        let years: Vec<String> = table.keys().iter().map(GroupKey::to_string).collect();
        assert_eq!(years, vec!["2010", "2011", "2012"]);
        assert_eq!(table.rows[0].1, vec![AggregateResult::Float(6.0), AggregateResult::Int(2)]);
    }

    #[test]
    fn test_collapse_averages_customer_totals() {
        let spec = AggregationSpec::monthly_average(2020, "Entertainment");
        let state = fold(
            &spec,
            &batch(vec![
                record("a", 2020, 1, 10.0),
                record("a", 2020, 1, 20.0),
                record("b", 2020, 1, 50.0),
                record("b", 2020, 2, 8.0),
            ]),
            AggregateState::new(),
        );
        let table = materialize(&spec, &state).unwrap();
        assert_eq!(table.dimensions, vec![Field::Month]);
        let series = table.series(AggregateOp::Avg).unwrap();
        // January: a spent 30, b spent 50 => 40. February: only b => 8.
        assert_eq!(series.values, vec![40.0, 8.0]);
        assert_eq!(series.keys[0], GroupKey(vec![Value::Int(1)]));
    }

    #[test]
    fn test_empty_state_is_an_error() {
        let spec = AggregationSpec::sum_by_year();
        let err = materialize(&spec, &AggregateState::new()).unwrap_err();
        assert!(matches!(err, ProcessorError::EmptyResult));
    }

    #[test]
    fn test_all_rows_filtered_gives_empty_table() {
        let spec = AggregationSpec::monthly_average(1999, "Entertainment");
        let state = fold(&spec, &batch(vec![record("a", 2020, 1, 1.0)]), AggregateState::new());
        let table = materialize(&spec, &state).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_to_arrow_columns() {
        let spec = AggregationSpec::agg_by_year();
        let state = fold(
            &spec,
            &batch(vec![record("a", 2010, 1, 1.5), record("b", 2011, 1, 2.5)]),
            AggregateState::new(),
        );
        let table = materialize(&spec, &state).unwrap();
        let (schema, chunk) = table.to_arrow();
        let names: Vec<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["YEAR", "sum", "count"]);
        assert_eq!(chunk.len(), 2);
        let sums = chunk.arrays()[1]
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(sums.value(1), 2.5);
    }
}
