//! Typed column values.
//!
//! Every value read from or written to the database passes through
//! [`SqlValue`]. Conversions between the declared column types are explicit
//! and exhaustive so the generic table copier never has to guess.

use std::fmt;

use chrono::{DateTime, NaiveDateTime};

use pimstore_core::error::{PimError, Result};

/// Text format of timestamps in engines without a native datetime type.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Declared type of a schema column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Integer,
    Bool,
    Text,
    Blob,
    Timestamp,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Integer => "integer",
            ColumnType::Bool => "bool",
            ColumnType::Text => "text",
            ColumnType::Blob => "blob",
            ColumnType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    fn kind(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Integer(_) => "integer",
            SqlValue::Bool(_) => "bool",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
            SqlValue::Timestamp(_) => "timestamp",
        }
    }

    fn mismatch(&self, target: ColumnType) -> PimError {
        PimError::Integrity(format!(
            "cannot convert {} value {:?} to {}",
            self.kind(),
            self,
            target
        ))
    }

    /// Convert the value to the declared column type. `Null` stays `Null`.
    pub fn coerce(self, target: ColumnType) -> Result<SqlValue> {
        match target {
            ColumnType::Integer => self.coerce_integer(),
            ColumnType::Bool => self.coerce_bool(),
            ColumnType::Text => self.coerce_text(),
            ColumnType::Blob => self.coerce_blob(),
            ColumnType::Timestamp => self.coerce_timestamp(),
        }
    }

    fn coerce_integer(self) -> Result<SqlValue> {
        match self {
            SqlValue::Null | SqlValue::Integer(_) => Ok(self),
            SqlValue::Bool(b) => Ok(SqlValue::Integer(b as i64)),
            SqlValue::Text(ref s) => s
                .trim()
                .parse::<i64>()
                .map(SqlValue::Integer)
                .map_err(|_| self.mismatch(ColumnType::Integer)),
            SqlValue::Blob(_) | SqlValue::Timestamp(_) => Err(self.mismatch(ColumnType::Integer)),
        }
    }

    fn coerce_bool(self) -> Result<SqlValue> {
        match self {
            SqlValue::Null | SqlValue::Bool(_) => Ok(self),
            SqlValue::Integer(i) => Ok(SqlValue::Bool(i != 0)),
            SqlValue::Text(ref s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "t" | "true" => Ok(SqlValue::Bool(true)),
                "0" | "f" | "false" => Ok(SqlValue::Bool(false)),
                _ => Err(self.mismatch(ColumnType::Bool)),
            },
            SqlValue::Blob(_) | SqlValue::Timestamp(_) => Err(self.mismatch(ColumnType::Bool)),
        }
    }

    fn coerce_text(self) -> Result<SqlValue> {
        match self {
            SqlValue::Null | SqlValue::Text(_) => Ok(self),
            SqlValue::Integer(i) => Ok(SqlValue::Text(i.to_string())),
            SqlValue::Bool(b) => Ok(SqlValue::Text(if b { "1" } else { "0" }.to_string())),
            // Bytes that are no valid UTF-8 stay a byte string.
            SqlValue::Blob(bytes) => Ok(String::from_utf8(bytes)
                .map(SqlValue::Text)
                .unwrap_or_else(|e| SqlValue::Blob(e.into_bytes()))),
            SqlValue::Timestamp(ts) => Ok(SqlValue::Text(ts.format(TIMESTAMP_FORMAT).to_string())),
        }
    }

    fn coerce_blob(self) -> Result<SqlValue> {
        match self {
            SqlValue::Null | SqlValue::Blob(_) => Ok(self),
            SqlValue::Text(s) => Ok(SqlValue::Blob(s.into_bytes())),
            SqlValue::Integer(i) => Ok(SqlValue::Blob(i.to_string().into_bytes())),
            SqlValue::Bool(_) | SqlValue::Timestamp(_) => Err(self.mismatch(ColumnType::Blob)),
        }
    }

    fn coerce_timestamp(self) -> Result<SqlValue> {
        match self {
            SqlValue::Null | SqlValue::Timestamp(_) => Ok(self),
            SqlValue::Text(ref s) => parse_timestamp(s)
                .map(SqlValue::Timestamp)
                .ok_or_else(|| self.mismatch(ColumnType::Timestamp)),
            SqlValue::Integer(secs) => DateTime::from_timestamp(secs, 0)
                .map(|dt| SqlValue::Timestamp(dt.naive_utc()))
                .ok_or_else(|| self.mismatch(ColumnType::Timestamp)),
            SqlValue::Bool(_) | SqlValue::Blob(_) => Err(self.mismatch(ColumnType::Timestamp)),
        }
    }
}

/// Parse the timestamp spellings the supported engines produce.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Blob(v.to_vec())
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow {
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    fn typed(&self, idx: usize, ty: ColumnType) -> Result<SqlValue> {
        self.values
            .get(idx)
            .cloned()
            .ok_or_else(|| PimError::Integrity(format!("column index {} out of range", idx)))?
            .coerce(ty)
    }

    fn required(&self, idx: usize, ty: ColumnType) -> Result<SqlValue> {
        match self.typed(idx, ty)? {
            SqlValue::Null => Err(PimError::Integrity(format!(
                "column {} is NULL, expected {}",
                idx, ty
            ))),
            value => Ok(value),
        }
    }

    pub fn i64(&self, idx: usize) -> Result<i64> {
        match self.required(idx, ColumnType::Integer)? {
            SqlValue::Integer(v) => Ok(v),
            other => Err(other.mismatch(ColumnType::Integer)),
        }
    }

    pub fn opt_i64(&self, idx: usize) -> Result<Option<i64>> {
        match self.typed(idx, ColumnType::Integer)? {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(v) => Ok(Some(v)),
            other => Err(other.mismatch(ColumnType::Integer)),
        }
    }

    pub fn bool(&self, idx: usize) -> Result<bool> {
        match self.required(idx, ColumnType::Bool)? {
            SqlValue::Bool(v) => Ok(v),
            other => Err(other.mismatch(ColumnType::Bool)),
        }
    }

    /// Text column, NULL reads as the empty string. Bytes that are not
    /// UTF-8 are decoded lossily.
    pub fn string(&self, idx: usize) -> Result<String> {
        match self.typed(idx, ColumnType::Text)? {
            SqlValue::Null => Ok(String::new()),
            SqlValue::Text(v) => Ok(v),
            SqlValue::Blob(v) => Ok(String::from_utf8_lossy(&v).into_owned()),
            other => Err(other.mismatch(ColumnType::Text)),
        }
    }

    /// Blob column, NULL reads as empty.
    pub fn bytes(&self, idx: usize) -> Result<Vec<u8>> {
        match self.typed(idx, ColumnType::Blob)? {
            SqlValue::Null => Ok(Vec::new()),
            SqlValue::Blob(v) => Ok(v),
            other => Err(other.mismatch(ColumnType::Blob)),
        }
    }

    pub fn timestamp(&self, idx: usize) -> Result<NaiveDateTime> {
        match self.required(idx, ColumnType::Timestamp)? {
            SqlValue::Timestamp(v) => Ok(v),
            other => Err(other.mismatch(ColumnType::Timestamp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap()
    }

    #[test]
    fn test_null_survives_every_coercion() {
        for ty in [
            ColumnType::Integer,
            ColumnType::Bool,
            ColumnType::Text,
            ColumnType::Blob,
            ColumnType::Timestamp,
        ] {
            assert_eq!(SqlValue::Null.coerce(ty).unwrap(), SqlValue::Null);
        }
    }

    #[test]
    fn test_bool_coercions() {
        assert_eq!(
            SqlValue::Integer(1).coerce(ColumnType::Bool).unwrap(),
            SqlValue::Bool(true)
        );
        assert_eq!(
            SqlValue::Text("f".into()).coerce(ColumnType::Bool).unwrap(),
            SqlValue::Bool(false)
        );
        assert!(SqlValue::Text("maybe".into())
            .coerce(ColumnType::Bool)
            .is_err());
        assert_eq!(
            SqlValue::Bool(true).coerce(ColumnType::Integer).unwrap(),
            SqlValue::Integer(1)
        );
    }

    #[test]
    fn test_timestamp_coercions() {
        let text = SqlValue::Text("2024-03-01 12:30:05".into());
        assert_eq!(
            text.coerce(ColumnType::Timestamp).unwrap(),
            SqlValue::Timestamp(ts())
        );
        assert_eq!(
            SqlValue::Text("2024-03-01T12:30:05.000".into())
                .coerce(ColumnType::Timestamp)
                .unwrap(),
            SqlValue::Timestamp(ts())
        );
        assert_eq!(
            SqlValue::Timestamp(ts()).coerce(ColumnType::Text).unwrap(),
            SqlValue::Text("2024-03-01 12:30:05".into())
        );
        assert!(SqlValue::Blob(vec![1]).coerce(ColumnType::Timestamp).is_err());
    }

    #[test]
    fn test_blob_text_coercions() {
        assert_eq!(
            SqlValue::Text("abc".into()).coerce(ColumnType::Blob).unwrap(),
            SqlValue::Blob(b"abc".to_vec())
        );
        assert_eq!(
            SqlValue::Blob(b"abc".to_vec()).coerce(ColumnType::Text).unwrap(),
            SqlValue::Text("abc".into())
        );
        assert_eq!(
            SqlValue::Blob(vec![0xff, 0xfe])
                .coerce(ColumnType::Text)
                .unwrap(),
            SqlValue::Blob(vec![0xff, 0xfe])
        );
        let row = SqlRow::new(vec![SqlValue::Blob(vec![b'a', 0xff])]);
        assert_eq!(row.string(0).unwrap(), "a\u{fffd}");
    }

    #[test]
    fn test_row_accessors() {
        let row = SqlRow::new(vec![
            SqlValue::Integer(7),
            SqlValue::Null,
            SqlValue::Text("name".into()),
            SqlValue::Integer(0),
            SqlValue::Text("2024-03-01 12:30:05".into()),
        ]);
        assert_eq!(row.i64(0).unwrap(), 7);
        assert_eq!(row.opt_i64(1).unwrap(), None);
        assert!(row.i64(1).is_err());
        assert_eq!(row.string(2).unwrap(), "name");
        assert_eq!(row.bytes(2).unwrap(), b"name".to_vec());
        assert!(!row.bool(3).unwrap());
        assert_eq!(row.timestamp(4).unwrap(), ts());
        assert!(row.i64(9).is_err());
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(3i64)), SqlValue::Integer(3));
    }
}
