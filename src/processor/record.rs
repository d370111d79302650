use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::processor::{ProcessorError, Value};

/// Days between 0001-01-01 (CE day 1) and the Unix epoch.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Columns of the transactions file, in header order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    #[serde(rename = "CUST_ID")]
    CustId,
    #[serde(rename = "START_DATE")]
    StartDate,
    #[serde(rename = "END_DATE")]
    EndDate,
    #[serde(rename = "TRANS_ID")]
    TransId,
    #[serde(rename = "DATE")]
    Date,
    #[serde(rename = "YEAR")]
    Year,
    #[serde(rename = "MONTH")]
    Month,
    #[serde(rename = "DAY")]
    Day,
    #[serde(rename = "EXP_TYPE")]
    ExpType,
    #[serde(rename = "AMOUNT")]
    Amount,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::CustId,
        Field::StartDate,
        Field::EndDate,
        Field::TransId,
        Field::Date,
        Field::Year,
        Field::Month,
        Field::Day,
        Field::ExpType,
        Field::Amount,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Field::CustId => "CUST_ID",
            Field::StartDate => "START_DATE",
            Field::EndDate => "END_DATE",
            Field::TransId => "TRANS_ID",
            Field::Date => "DATE",
            Field::Year => "YEAR",
            Field::Month => "MONTH",
            Field::Day => "DAY",
            Field::ExpType => "EXP_TYPE",
            Field::Amount => "AMOUNT",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Field::Year | Field::Month | Field::Day | Field::Amount
        )
    }

    /// Header line as it appears at the top of the source file.
    pub fn header_line() -> String {
        Field::ALL
            .iter()
            .map(Field::name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Field::ALL
            .iter()
            .copied()
            .find(|field| field.name() == upper)
            .ok_or_else(|| ProcessorError::MissingColumn(s.to_string()))
    }
}

/// One transaction row
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub cust_id: String,
    pub start_date: NaiveDate,
    /// Empty for customers that are still active
    pub end_date: Option<NaiveDate>,
    pub trans_id: String,
    pub date: NaiveDate,
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub exp_type: String,
    pub amount: f64,
}

impl Record {
    /// Dynamic view of a field, used for grouping and filtering.
    pub fn value(&self, field: Field) -> Value {
        match field {
            Field::CustId => Value::Str(self.cust_id.clone()),
            Field::StartDate => Value::Date(self.start_date),
            Field::EndDate => self.end_date.map(Value::Date).unwrap_or(Value::Null),
            Field::TransId => Value::Str(self.trans_id.clone()),
            Field::Date => Value::Date(self.date),
            Field::Year => Value::Int(self.year as i64),
            Field::Month => Value::Int(self.month as i64),
            Field::Day => Value::Int(self.day as i64),
            Field::ExpType => Value::Str(self.exp_type.clone()),
            Field::Amount => Value::Float(self.amount),
        }
    }

    /// Numeric view of a field, `None` for non-numeric columns.
    pub fn numeric(&self, field: Field) -> Option<f64> {
        match field {
            Field::Year => Some(self.year as f64),
            Field::Month => Some(self.month as f64),
            Field::Day => Some(self.day as f64),
            Field::Amount => Some(self.amount),
            _ => None,
        }
    }

    /// Parses one row from its already-split fields. Missing trailing fields
    /// must be passed as empty slices.
    ///
    /// On failure returns the offending column and a reason.
    pub fn parse(fields: &[&[u8]]) -> Result<Record, FieldError> {
        let field = |f: Field| column(fields, f);

        Ok(Record {
            cust_id: parse_str(Field::CustId, field(Field::CustId))?,
            start_date: parse_date(Field::StartDate, field(Field::StartDate))?,
            end_date: parse_optional_date(Field::EndDate, field(Field::EndDate))?,
            trans_id: parse_str(Field::TransId, field(Field::TransId))?,
            date: parse_date(Field::Date, field(Field::Date))?,
            year: parse_year(field(Field::Year))?,
            month: parse_ranged(Field::Month, field(Field::Month), 1..=12)?,
            day: parse_ranged(Field::Day, field(Field::Day), 1..=31)?,
            exp_type: parse_str(Field::ExpType, field(Field::ExpType))?,
            amount: parse_float(Field::Amount, field(Field::Amount))?,
        })
    }
}

/// Field-level parse failure, turned into a [`crate::processor::ParseError`]
/// once the reader knows the line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: Field,
    pub value: String,
    pub reason: String,
}

impl FieldError {
    fn new(field: Field, raw: &[u8], reason: impl Into<String>) -> Self {
        FieldError {
            field,
            value: String::from_utf8_lossy(raw).to_string(),
            reason: reason.into(),
        }
    }
}

fn column<'a>(fields: &[&'a [u8]], field: Field) -> &'a [u8] {
    fields.get(field.index()).copied().unwrap_or(&[])
}

fn parse_str(field: Field, raw: &[u8]) -> Result<String, FieldError> {
    if raw.is_empty() {
        return Err(FieldError::new(field, raw, "empty value"));
    }
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|e| FieldError::new(field, raw, e.to_string()))
}

fn parse_date(field: Field, raw: &[u8]) -> Result<NaiveDate, FieldError> {
    let text = std::str::from_utf8(raw).map_err(|e| FieldError::new(field, raw, e.to_string()))?;
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| FieldError::new(field, raw, format!("invalid date: {e}")))
}

fn parse_optional_date(field: Field, raw: &[u8]) -> Result<Option<NaiveDate>, FieldError> {
    if raw.is_empty() {
        Ok(None)
    } else {
        parse_date(field, raw).map(Some)
    }
}

fn parse_year(raw: &[u8]) -> Result<i32, FieldError> {
    atoi_simd::parse::<i32>(raw).map_err(|e| FieldError::new(Field::Year, raw, e.to_string()))
}

fn parse_ranged(
    field: Field,
    raw: &[u8],
    range: std::ops::RangeInclusive<u8>,
) -> Result<u8, FieldError> {
    let value =
        atoi_simd::parse::<u8>(raw).map_err(|e| FieldError::new(field, raw, e.to_string()))?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(FieldError::new(
            field,
            raw,
            format!("out of range {}..={}", range.start(), range.end()),
        ))
    }
}

fn parse_float(field: Field, raw: &[u8]) -> Result<f64, FieldError> {
    let value =
        fast_float::parse::<f64, _>(raw).map_err(|e| FieldError::new(field, raw, e.to_string()))?;
    if !value.is_finite() {
        return Err(FieldError::new(field, raw, "non-finite number"));
    }
    Ok(value)
}

/// Days since the Unix epoch, the Arrow `Date32` representation.
pub fn date_to_days(date: NaiveDate) -> i32 {
    use chrono::Datelike;
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(line: &str) -> Vec<&[u8]> {
        line.split(',').map(str::as_bytes).collect()
    }

    #[test]
    fn test_parse_record() {
        let line = "CI6XLYUMQK,2015-05-01,,T8I9ZB5A6X90UG8,2015-09-29,2015,9,29,Motor/Travel,20.27";
        let record = Record::parse(&split(line)).unwrap();
        assert_eq!(record.cust_id, "CI6XLYUMQK");
        assert_eq!(record.end_date, None);
        assert_eq!(record.year, 2015);
        assert_eq!(record.month, 9);
        assert_eq!(record.exp_type, "Motor/Travel");
        assert_eq!(record.amount, 20.27);
        assert_eq!(record.value(Field::Year), Value::Int(2015));
    }

    #[test]
    fn test_month_out_of_range() {
        let line = "C1,2015-05-01,,T1,2015-09-29,2015,13,29,Food,1.0";
        let err = Record::parse(&split(line)).unwrap_err();
        assert_eq!(err.field, Field::Month);
        assert_eq!(err.value, "13");
    }

    #[test]
    fn test_bad_amount() {
        let line = "C1,2015-05-01,,T1,2015-09-29,2015,9,29,Food,abc";
        let err = Record::parse(&split(line)).unwrap_err();
        assert_eq!(err.field, Field::Amount);
    }

    #[test]
    fn test_non_finite_amount_rejected() {
        for amount in ["nan", "NaN", "inf", "-infinity"] {
            let line = format!("C1,2015-05-01,,T1,2015-09-29,2015,9,29,Food,{amount}");
            let err = Record::parse(&split(&line)).unwrap_err();
            assert_eq!(err.field, Field::Amount);
            assert_eq!(err.value, amount);
        }
    }

    #[test]
    fn test_field_from_str() {
        assert_eq!("exp_type".parse::<Field>().unwrap(), Field::ExpType);
        assert!("nope".parse::<Field>().is_err());
        assert_eq!(
            Field::header_line(),
            "CUST_ID,START_DATE,END_DATE,TRANS_ID,DATE,YEAR,MONTH,DAY,EXP_TYPE,AMOUNT"
        );
    }

    #[test]
    fn test_date_days_conversion() {
        let date = NaiveDate::from_ymd_opt(1970, 1, 2).unwrap();
        assert_eq!(date_to_days(date), 1);
        assert_eq!(days_to_date(1), Some(date));
    }
}
