//! Postgres row operation.
//!
//! - [`Row`]
//! - [`Column`]
use bytes::Bytes;
use std::{fmt, str::Utf8Error};

use crate::ext::FmtExt;

/// Column description from `RowDescription`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: i32,
    /// Negative for variable length types.
    pub type_len: i16,
    /// `-1` when the server does not send it.
    pub type_modifier: i32,
}

/// Postgres row, each value is either in text or binary format depending on the row type.
#[derive(Clone, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<Bytes>>,
}

impl Row {
    pub(crate) fn new(values: Vec<Option<Bytes>>) -> Row {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value, `None` for null or out of bound index.
    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        self.values.get(idx)?.as_deref()
    }

    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.values.get(idx), Some(None))
    }

    /// Text value, `Ok(None)` for null or out of bound index.
    pub fn try_get_str(&self, idx: usize) -> Result<Option<&str>, Utf8Error> {
        self.get(idx).map(std::str::from_utf8).transpose()
    }

    /// Text value, `None` for null, out of bound index or invalid utf8.
    pub fn get_str(&self, idx: usize) -> Option<&str> {
        self.try_get_str(idx).ok().flatten()
    }

    pub fn values(&self) -> impl Iterator<Item = Option<&[u8]>> {
        self.values.iter().map(Option::as_deref)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for value in self.values() {
            match value {
                Some(value) => list.entry(&value.lossy()),
                None => list.entry(&"NULL"),
            };
        }
        list.finish()
    }
}
