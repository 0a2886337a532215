//! Typed, non-owning views over fields of a row image.

use std::ptr;

use super::types::ColumnType;
use crate::decimal::decimal_bin_size;
use crate::{Error, Result};

/// Real type codes that hide behind `ColumnType::String` metadata.
const REAL_TYPE_ENUM: u8 = 247;
const REAL_TYPE_SET: u8 = 248;

/// Maximum byte length of a CHAR/BINARY column, decoded from its metadata.
///
/// The low byte holds the real type with the two high bits of the length
/// folded in, the high byte holds the low eight bits of the length.
pub fn string_max_length(metadata: u16) -> usize {
    let lower = (metadata & 0xff) as usize;
    let higher = (metadata >> 8) as usize;
    if lower & 0x30 != 0x30 {
        (((lower & 0x30) ^ 0x30) << 4) | higher
    } else {
        higher
    }
}

/// Real type of a `ColumnType::String` column (ENUM and SET are sent as
/// strings).
pub fn string_real_type(metadata: u16) -> ColumnType {
    match (metadata & 0xff) as u8 {
        REAL_TYPE_ENUM => ColumnType::Enum,
        REAL_TYPE_SET => ColumnType::Set,
        _ => ColumnType::String,
    }
}

fn le_prefix(data: &[u8], width: usize) -> Option<usize> {
    let bytes = data.get(..width)?;
    Some(
        bytes
            .iter()
            .rev()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b)),
    )
}

fn fractional_bytes(fsp: u16) -> usize {
    (usize::from(fsp) + 1) / 2
}

/// Number of bytes a field of `column_type` occupies at the start of `data`.
///
/// Returns `None` for types with no known encoding and when a length prefix
/// is cut off.
pub fn field_byte_length(column_type: ColumnType, data: &[u8], metadata: u16) -> Option<usize> {
    let length = match column_type {
        ColumnType::VarString => usize::from(metadata),
        ColumnType::NewDecimal => {
            decimal_bin_size(usize::from(metadata & 0xff), usize::from(metadata >> 8))
        }
        ColumnType::Decimal | ColumnType::Float | ColumnType::Double => usize::from(metadata),
        ColumnType::Set | ColumnType::Enum => usize::from(metadata >> 8),
        ColumnType::String => {
            if string_real_type(metadata) != ColumnType::String {
                usize::from(metadata >> 8)
            } else if string_max_length(metadata) > 255 {
                2 + le_prefix(data, 2)?
            } else {
                1 + le_prefix(data, 1)?
            }
        }
        ColumnType::Year | ColumnType::Tiny => 1,
        ColumnType::Short => 2,
        ColumnType::Int24 => 3,
        ColumnType::Long => 4,
        ColumnType::LongLong => 8,
        ColumnType::Null => 0,
        ColumnType::NewDate | ColumnType::Date | ColumnType::Time => 3,
        ColumnType::Timestamp => 4,
        ColumnType::DateTime => 8,
        ColumnType::Timestamp2 => 4 + fractional_bytes(metadata),
        ColumnType::DateTime2 => 5 + fractional_bytes(metadata),
        ColumnType::Time2 => 3 + fractional_bytes(metadata),
        ColumnType::Bit => {
            let bytes = usize::from(metadata >> 8);
            let bits = metadata & 0xff;
            bytes + usize::from(bits > 0)
        }
        ColumnType::Varchar => {
            if metadata > 255 {
                2 + le_prefix(data, 2)?
            } else {
                1 + le_prefix(data, 1)?
            }
        }
        ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Blob
        | ColumnType::Geometry
        | ColumnType::Json => match metadata {
            1..=4 => {
                let width = usize::from(metadata);
                width + le_prefix(data, width)?
            }
            _ => return None,
        },
        ColumnType::Unknown(_) => return None,
    };
    Some(length)
}

/// A single field of a row image.
///
/// The value borrows the row image; it never copies or allocates. Two values
/// are equal when they view the same bytes with the same type and metadata.
#[derive(Debug, Clone, Copy)]
pub struct Value<'a> {
    storage: &'a [u8],
    column_type: ColumnType,
    metadata: u16,
    is_null: bool,
}

impl<'a> Value<'a> {
    /// Creates a view over the field at the start of `storage`, computing its
    /// byte length from the type and metadata.
    pub fn new(
        storage: &'a [u8],
        column_type: ColumnType,
        metadata: u16,
        is_null: bool,
    ) -> Result<Self> {
        if is_null {
            return Ok(Self::null(column_type, metadata));
        }

        let length = field_byte_length(column_type, storage, metadata).ok_or_else(|| {
            Error::CorruptRowImage(format!(
                "unsupported field length for {:?} (metadata {:#06x})",
                column_type, metadata
            ))
        })?;

        if length > storage.len() {
            return Err(Error::CorruptRowImage(format!(
                "{:?} field needs {} bytes, {} left in row image",
                column_type,
                length,
                storage.len()
            )));
        }

        Ok(Self::with_length(storage, length, column_type, metadata, false))
    }

    /// Creates a view of exactly `length` bytes at the start of `storage`.
    ///
    /// `length` is clamped to the bytes actually available.
    pub fn with_length(
        storage: &'a [u8],
        length: usize,
        column_type: ColumnType,
        metadata: u16,
        is_null: bool,
    ) -> Self {
        let length = length.min(storage.len());
        Self {
            storage: &storage[..length],
            column_type,
            metadata,
            is_null,
        }
    }

    /// A NULL field, which occupies no bytes.
    pub fn null(column_type: ColumnType, metadata: u16) -> Self {
        Self {
            storage: &[],
            column_type,
            metadata,
            is_null: true,
        }
    }

    pub fn storage(&self) -> &'a [u8] {
        self.storage
    }

    pub fn length(&self) -> usize {
        self.storage.len()
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn metadata(&self) -> u16 {
        self.metadata
    }

    pub fn is_null(&self) -> bool {
        self.is_null
    }

    fn le_bytes<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        if !self.is_null {
            let n = N.min(self.storage.len());
            out[..n].copy_from_slice(&self.storage[..n]);
        }
        out
    }

    pub fn as_i8(&self) -> i8 {
        i8::from_le_bytes(self.le_bytes::<1>())
    }

    pub fn as_i16(&self) -> i16 {
        i16::from_le_bytes(self.le_bytes::<2>())
    }

    /// Three byte signed integer.
    pub fn as_i24(&self) -> i32 {
        let [a, b, c] = self.le_bytes::<3>();
        // Shift up and back down to sign extend bit 23.
        i32::from_le_bytes([0, a, b, c]) >> 8
    }

    /// Three byte unsigned integer, as used by DATE and TIME.
    pub fn as_u24(&self) -> u32 {
        let [a, b, c] = self.le_bytes::<3>();
        u32::from_le_bytes([a, b, c, 0])
    }

    pub fn as_i32(&self) -> i32 {
        i32::from_le_bytes(self.le_bytes::<4>())
    }

    pub fn as_i64(&self) -> i64 {
        i64::from_le_bytes(self.le_bytes::<8>())
    }

    pub fn as_f32(&self) -> f32 {
        f32::from_le_bytes(self.le_bytes::<4>())
    }

    pub fn as_f64(&self) -> f64 {
        f64::from_le_bytes(self.le_bytes::<8>())
    }

    /// Character data of a VARCHAR, CHAR or VAR_STRING field without its
    /// length prefix.
    pub fn as_c_str(&self) -> &'a [u8] {
        if self.is_null || self.storage.len() <= 1 {
            return &[];
        }

        let max_length = match self.column_type {
            ColumnType::String => string_max_length(self.metadata),
            _ => usize::from(self.metadata),
        };
        let prefix = if max_length > 255 { 2 } else { 1 };
        self.storage.get(prefix..).unwrap_or(&[])
    }

    /// Payload of a BLOB-like field without its `metadata` byte length prefix.
    pub fn as_blob(&self) -> &'a [u8] {
        if self.is_null || self.storage.is_empty() {
            return &[];
        }
        self.storage
            .get(usize::from(self.metadata)..)
            .unwrap_or(&[])
    }
}

impl PartialEq for Value<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.storage.len() == other.storage.len()
            && ptr::eq(self.storage.as_ptr(), other.storage.as_ptr())
            && self.column_type == other.column_type
            && self.metadata == other.metadata
    }
}

impl Eq for Value<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_lengths() {
        let data = [0u8; 16];
        let cases = [
            (ColumnType::Tiny, 1),
            (ColumnType::Year, 1),
            (ColumnType::Short, 2),
            (ColumnType::Int24, 3),
            (ColumnType::Long, 4),
            (ColumnType::LongLong, 8),
            (ColumnType::Date, 3),
            (ColumnType::NewDate, 3),
            (ColumnType::Time, 3),
            (ColumnType::Timestamp, 4),
            (ColumnType::DateTime, 8),
            (ColumnType::Null, 0),
        ];
        for (column_type, expected) in cases {
            assert_eq!(
                field_byte_length(column_type, &data, 0),
                Some(expected),
                "{:?}",
                column_type
            );
        }
    }

    #[test]
    fn test_metadata_driven_lengths() {
        let data = [0u8; 16];
        assert_eq!(field_byte_length(ColumnType::Float, &data, 4), Some(4));
        assert_eq!(field_byte_length(ColumnType::Double, &data, 8), Some(8));
        assert_eq!(field_byte_length(ColumnType::VarString, &data, 12), Some(12));
        // DECIMAL(10,2)
        assert_eq!(field_byte_length(ColumnType::NewDecimal, &data, 0x020a), Some(5));
        // BIT(10): one full byte plus two bits
        assert_eq!(field_byte_length(ColumnType::Bit, &data, 0x0102), Some(2));
        assert_eq!(field_byte_length(ColumnType::Bit, &data, 0x0100), Some(1));
        assert_eq!(field_byte_length(ColumnType::DateTime2, &data, 0), Some(5));
        assert_eq!(field_byte_length(ColumnType::DateTime2, &data, 6), Some(8));
        assert_eq!(field_byte_length(ColumnType::Time2, &data, 3), Some(5));
        assert_eq!(field_byte_length(ColumnType::Timestamp2, &data, 1), Some(5));
    }

    #[test]
    fn test_prefixed_lengths() {
        assert_eq!(field_byte_length(ColumnType::Varchar, &[3, b'a', b'b', b'c'], 255), Some(4));
        assert_eq!(field_byte_length(ColumnType::Varchar, &[0x2c, 0x01], 1000), Some(302));
        assert_eq!(field_byte_length(ColumnType::Blob, &[5, 0], 2), Some(7));
        assert_eq!(field_byte_length(ColumnType::Blob, &[1, 0, 1, 0], 4), Some(65541));
        assert_eq!(field_byte_length(ColumnType::Json, &[2], 1), Some(3));
    }

    #[test]
    fn test_string_metadata() {
        // CHAR(10): real type 0xfe, length 10
        assert_eq!(string_max_length(0x0afe), 10);
        assert_eq!(field_byte_length(ColumnType::String, &[2, b'h', b'i'], 0x0afe), Some(3));

        // CHAR(300) in utf8mb4 needs two length bytes: high bits folded into 0xee
        let metadata = (0xb0u16 << 8) | 0xee;
        assert_eq!(string_max_length(metadata), 0x1b0);
        assert_eq!(field_byte_length(ColumnType::String, &[4, 0], metadata), Some(6));

        // ENUM with one byte packs
        assert_eq!(string_real_type(0x01f7), ColumnType::Enum);
        assert_eq!(field_byte_length(ColumnType::String, &[3], 0x01f7), Some(1));
        assert_eq!(string_real_type(0x02f8), ColumnType::Set);
    }

    #[test]
    fn test_unsupported_lengths() {
        assert_eq!(field_byte_length(ColumnType::Unknown(20), &[0; 4], 0), None);
        assert_eq!(field_byte_length(ColumnType::Blob, &[0; 4], 0), None);
        assert_eq!(field_byte_length(ColumnType::Varchar, &[], 10), None);
        assert_eq!(field_byte_length(ColumnType::Blob, &[1], 2), None);
    }

    #[test]
    fn test_integer_accessors() {
        let data = [0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        let value = Value::new(&data, ColumnType::LongLong, 0, false).unwrap();
        assert_eq!(value.as_i64(), -2);
        assert_eq!(value.as_i8(), -2);
        assert_eq!(value.as_i16(), -2);
        assert_eq!(value.as_i32(), -2);

        let value = Value::new(&data[..3], ColumnType::Int24, 0, false).unwrap();
        assert_eq!(value.as_i24(), -2);
        assert_eq!(value.as_u24(), 0xff_fffe);

        let positive = [0x01, 0x02, 0x03];
        let value = Value::new(&positive, ColumnType::Int24, 0, false).unwrap();
        assert_eq!(value.as_i24(), 0x030201);
    }

    #[test]
    fn test_float_accessors() {
        let data = 1.5f32.to_le_bytes();
        let value = Value::new(&data, ColumnType::Float, 4, false).unwrap();
        assert_eq!(value.as_f32(), 1.5);

        let data = (-0.25f64).to_le_bytes();
        let value = Value::new(&data, ColumnType::Double, 8, false).unwrap();
        assert_eq!(value.as_f64(), -0.25);
    }

    #[test]
    fn test_null_accessors() {
        let value = Value::null(ColumnType::Long, 0);
        assert!(value.is_null());
        assert_eq!(value.length(), 0);
        assert_eq!(value.as_i32(), 0);
        assert_eq!(value.as_f64(), 0.0);
        assert!(value.as_c_str().is_empty());
        assert!(value.as_blob().is_empty());
    }

    #[test]
    fn test_string_accessors() {
        let data = [3, b'a', b'b', b'c', 0xaa];
        let value = Value::new(&data, ColumnType::Varchar, 255, false).unwrap();
        assert_eq!(value.length(), 4);
        assert_eq!(value.as_c_str(), b"abc");

        let data = [2, 0, b'h', b'i'];
        let value = Value::new(&data, ColumnType::Blob, 2, false).unwrap();
        assert_eq!(value.as_blob(), b"hi");
    }

    #[test]
    fn test_new_rejects_overrun() {
        let data = [10, b'a'];
        assert!(Value::new(&data, ColumnType::Varchar, 20, false).is_err());
        assert!(Value::new(&data, ColumnType::Unknown(99), 0, false).is_err());
    }

    #[test]
    fn test_equality_is_identity() {
        let data = [1u8, 0, 0, 0, 1, 0, 0, 0];
        let a = Value::new(&data[..4], ColumnType::Long, 0, false).unwrap();
        let b = Value::new(&data[..4], ColumnType::Long, 0, false).unwrap();
        let c = Value::new(&data[4..], ColumnType::Long, 0, false).unwrap();

        assert_eq!(a, b);
        // Same bytes at a different address are a different value.
        assert_ne!(a, c);
        assert_eq!(a.as_i32(), c.as_i32());

        let d = Value::with_length(&data, 4, ColumnType::Long, 1, false);
        assert_ne!(a, d);
    }
}
