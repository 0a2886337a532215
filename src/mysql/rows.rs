//! Splitting rows events into rows of typed fields.
//!
//! A rows event carries one or more row images back to back. Each image
//! starts with a null bitmap covering the included columns, followed by the
//! non-null values in column order. Update events alternate between the
//! before image and the after image, each with its own set of included
//! columns.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::{bit_is_set, count_set_bits, RowsEvent, RowsKind, TableMapEvent};
use super::value::{field_byte_length, Value};
use crate::{Error, Result};

/// The fields of one row image, one per included column in column order.
pub type RowOfFields<'a> = Vec<Value<'a>>;

/// Table maps seen on the current connection, keyed by table id.
#[derive(Debug, Default, Clone)]
pub struct TableMapCache {
    tables: HashMap<u64, Arc<TableMapEvent>>,
}

impl TableMapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: Arc<TableMapEvent>) {
        self.tables.insert(table.table_id, table);
    }

    pub fn get(&self, table_id: u64) -> Option<&Arc<TableMapEvent>> {
        self.tables.get(&table_id)
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Field set of `rows`, looked up by its table id.
    pub fn row_fields<'a>(&'a self, rows: &'a RowsEvent) -> Result<RowFieldSet<'a>> {
        let table = self
            .get(rows.table_id)
            .ok_or(Error::UnknownTable(rows.table_id))?;
        RowFieldSet::new(rows, table)
    }
}

/// The rows of a rows event, decoded lazily against its table map.
#[derive(Debug, Clone, Copy)]
pub struct RowFieldSet<'a> {
    rows: &'a RowsEvent,
    table: &'a TableMapEvent,
}

impl<'a> RowFieldSet<'a> {
    /// Pairs a rows event with the table map it refers to.
    ///
    /// Fails with `UnknownTable` when the table ids differ and with
    /// `CorruptRowImage` when the column layouts disagree.
    pub fn new(rows: &'a RowsEvent, table: &'a TableMapEvent) -> Result<Self> {
        if rows.table_id != table.table_id {
            return Err(Error::UnknownTable(rows.table_id));
        }

        let column_count = table.column_count();
        if rows.column_count != column_count {
            return Err(Error::CorruptRowImage(format!(
                "rows event has {} columns, table map {}.{} has {}",
                rows.column_count, table.schema_name, table.table_name, column_count
            )));
        }
        if table.column_metadata.len() != column_count {
            return Err(Error::CorruptRowImage(format!(
                "table map {}.{} has {} metadata words for {} columns",
                table.schema_name,
                table.table_name,
                table.column_metadata.len(),
                column_count
            )));
        }

        let bitmap_len = (column_count + 7) / 8;
        let after_ok = rows
            .columns_present_after
            .as_ref()
            .map(|bitmap| bitmap.len() == bitmap_len)
            .unwrap_or(rows.kind != RowsKind::Update);
        if rows.columns_present.len() != bitmap_len || !after_ok {
            return Err(Error::CorruptRowImage(format!(
                "included-columns bitmap does not cover {} columns",
                column_count
            )));
        }

        Ok(Self { rows, table })
    }

    pub fn table(&self) -> &'a TableMapEvent {
        self.table
    }

    pub fn kind(&self) -> RowsKind {
        self.rows.kind
    }

    /// Iterates over the row images from the first one.
    pub fn iter(&self) -> RowIter<'a> {
        RowIter {
            rows: self.rows,
            table: self.table,
            data: &self.rows.rows,
            image: 0,
            failed: false,
        }
    }
}

impl<'a> IntoIterator for &RowFieldSet<'a> {
    type Item = Result<RowOfFields<'a>>;
    type IntoIter = RowIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Forward iterator over the row images of a [`RowFieldSet`].
///
/// Stops after the first corrupt image.
#[derive(Debug, Clone)]
pub struct RowIter<'a> {
    rows: &'a RowsEvent,
    table: &'a TableMapEvent,
    data: &'a [u8],
    image: usize,
    failed: bool,
}

impl<'a> RowIter<'a> {
    fn present_bitmap(&self) -> &'a [u8] {
        match (&self.rows.columns_present_after, self.image % 2) {
            (Some(after), 1) => after,
            _ => &self.rows.columns_present,
        }
    }

    fn decode_image(&mut self) -> Result<RowOfFields<'a>> {
        let table = self.table;
        let column_count = table.column_count();
        let present = self.present_bitmap();
        let present_count = count_set_bits(present, column_count);

        let null_bitmap_len = (present_count + 7) / 8;
        if self.data.len() < null_bitmap_len {
            return Err(Error::CorruptRowImage(format!(
                "row image {} ends inside its null bitmap",
                self.image
            )));
        }
        let (null_bitmap, mut cursor) = self.data.split_at(null_bitmap_len);

        let mut fields = Vec::with_capacity(present_count);
        let mut null_idx = 0;
        for column in 0..column_count {
            if !bit_is_set(present, column) {
                continue;
            }

            let column_type = table.column_types[column];
            let metadata = table.column_metadata[column];
            let is_null = bit_is_set(null_bitmap, null_idx);
            null_idx += 1;

            if is_null {
                fields.push(Value::null(column_type, metadata));
                continue;
            }

            let length = field_byte_length(column_type, cursor, metadata).ok_or_else(|| {
                Error::CorruptRowImage(format!(
                    "cannot size column {} of type {:?} in {}.{}",
                    column, column_type, table.schema_name, table.table_name
                ))
            })?;
            if length > cursor.len() {
                return Err(Error::CorruptRowImage(format!(
                    "column {} needs {} bytes, {} left in row image {}",
                    column,
                    length,
                    cursor.len(),
                    self.image
                )));
            }

            fields.push(Value::with_length(cursor, length, column_type, metadata, false));
            cursor = &cursor[length..];
        }

        self.data = cursor;
        self.image += 1;
        Ok(fields)
    }
}

impl<'a> Iterator for RowIter<'a> {
    type Item = Result<RowOfFields<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }

        let row = self.decode_image();
        if row.is_err() {
            self.failed = true;
        }
        Some(row)
    }
}
