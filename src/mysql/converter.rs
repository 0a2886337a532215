//! Conversion of field values into plain Rust types.

use super::types::ColumnType;
use super::value::{string_real_type, Value};
use crate::decimal::{bin2decimal, decimal2string, Decimal};

/// Text produced for types that have no conversion.
pub const NOT_IMPLEMENTED: &str = "not implemented";

const NULL_TEXT: &str = "NULL";

/// Offset MySQL adds to packed temporal values so they sort as unsigned.
const DATETIMEF_INT_OFS: i64 = 0x80_0000_0000;
const TIMEF_INT_OFS: i64 = 0x80_0000;
const TIMEF_OFS: i64 = 0x8000_0000_0000;

/// Stateless converter dispatching on the field's column type.
#[derive(Debug, Default, Clone, Copy)]
pub struct Converter;

impl Converter {
    pub fn new() -> Self {
        Self
    }

    /// Renders a field as text.
    ///
    /// NULL fields become `"NULL"`; types without a conversion become
    /// [`NOT_IMPLEMENTED`].
    pub fn to_string(&self, value: &Value<'_>) -> String {
        if value.is_null() {
            return NULL_TEXT.to_string();
        }

        match value.column_type() {
            ColumnType::Tiny => value.as_i8().to_string(),
            ColumnType::Short => value.as_i16().to_string(),
            ColumnType::Int24 => value.as_i24().to_string(),
            ColumnType::Long => value.as_i32().to_string(),
            ColumnType::LongLong => value.as_i64().to_string(),
            ColumnType::Float => value.as_f32().to_string(),
            ColumnType::Double => value.as_f64().to_string(),
            ColumnType::Null => NULL_TEXT.to_string(),
            ColumnType::Timestamp => (value.as_i32() as u32).to_string(),
            ColumnType::Timestamp2 => format_timestamp2(value),
            ColumnType::Date | ColumnType::NewDate => format_date(value.as_u24()),
            ColumnType::Time => format_time(value.as_u24()),
            ColumnType::Time2 => format_time2(value),
            ColumnType::DateTime => format_datetime(value.as_i64() as u64),
            ColumnType::DateTime2 => format_datetime2(value),
            ColumnType::Year => format!("{:04}", year(value)),
            ColumnType::Varchar => String::from_utf8_lossy(value.as_c_str()).into_owned(),
            ColumnType::VarString => String::from_utf8_lossy(value.storage()).into_owned(),
            ColumnType::String => match string_real_type(value.metadata()) {
                ColumnType::Enum | ColumnType::Set => unsigned_le(value.storage()).to_string(),
                _ => String::from_utf8_lossy(value.as_c_str()).into_owned(),
            },
            ColumnType::Enum | ColumnType::Set => unsigned_le(value.storage()).to_string(),
            ColumnType::Bit => unsigned_be(value.storage()).to_string(),
            ColumnType::NewDecimal => {
                decimal_text(value).unwrap_or_else(|| NOT_IMPLEMENTED.to_string())
            }
            ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Blob => String::from_utf8_lossy(value.as_blob()).into_owned(),
            ColumnType::Decimal
            | ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::Unknown(_) => NOT_IMPLEMENTED.to_string(),
        }
    }

    /// Converts a field to an integer. Unsupported types give 0.
    pub fn to_i64(&self, value: &Value<'_>) -> i64 {
        if value.is_null() {
            return 0;
        }

        match value.column_type() {
            ColumnType::Tiny => i64::from(value.as_i8()),
            ColumnType::Short => i64::from(value.as_i16()),
            ColumnType::Int24 => i64::from(value.as_i24()),
            ColumnType::Long => i64::from(value.as_i32()),
            ColumnType::LongLong | ColumnType::DateTime => value.as_i64(),
            ColumnType::Timestamp => i64::from(value.as_i32() as u32),
            ColumnType::Double => value.as_f64() as i64,
            ColumnType::Year => i64::from(year(value)),
            ColumnType::Bit => unsigned_be(value.storage()) as i64,
            ColumnType::Enum | ColumnType::Set => unsigned_le(value.storage()) as i64,
            ColumnType::String => match string_real_type(value.metadata()) {
                ColumnType::Enum | ColumnType::Set => unsigned_le(value.storage()) as i64,
                _ => 0,
            },
            ColumnType::VarString => String::from_utf8_lossy(value.storage())
                .trim()
                .parse()
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Converts a FLOAT field. Other types give 0.
    pub fn to_f32(&self, value: &Value<'_>) -> f32 {
        match value.column_type() {
            ColumnType::Float if !value.is_null() => value.as_f32(),
            _ => 0.0,
        }
    }

    /// Converts a floating point or decimal field. Other types give 0.
    pub fn to_f64(&self, value: &Value<'_>) -> f64 {
        if value.is_null() {
            return 0.0;
        }

        match value.column_type() {
            ColumnType::Double => value.as_f64(),
            ColumnType::Float => f64::from(value.as_f32()),
            ColumnType::NewDecimal => decimal_text(value)
                .and_then(|text| text.parse().ok())
                .unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

fn year(value: &Value<'_>) -> u32 {
    let year = u32::from(value.as_i8() as u8);
    if year > 0 {
        year + 1900
    } else {
        year
    }
}

fn unsigned_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn unsigned_be(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn decimal_text(value: &Value<'_>) -> Option<String> {
    let precision = usize::from(value.metadata() & 0xff);
    let scale = usize::from(value.metadata() >> 8);

    let mut decimal = Decimal::default();
    bin2decimal(value.storage(), &mut decimal, precision, scale).ok()?;

    let mut text = String::new();
    decimal2string(&decimal, &mut text, precision + 3, 0, 0, b'0').ok()?;
    Some(text)
}

fn format_date(packed: u32) -> String {
    let day = packed & 0x1f;
    let month = (packed >> 5) & 0x0f;
    let year = packed >> 9;
    format!("{:04}-{:02}-{:02}", year, month, day)
}

fn format_time(packed: u32) -> String {
    let second = packed % 100;
    let minute = (packed % 10_000) / 100;
    let hour = packed / 10_000;
    format!("{:02}:{:02}:{:02}", hour, minute, second)
}

fn format_datetime(packed: u64) -> String {
    let date = packed / 1_000_000;
    let time = packed % 1_000_000;
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        date / 10_000,
        (date % 10_000) / 100,
        date % 100,
        time / 10_000,
        (time % 10_000) / 100,
        time % 100
    )
}

fn be_uint(bytes: &[u8]) -> i64 {
    bytes
        .iter()
        .fold(0i64, |acc, &b| (acc << 8) | i64::from(b))
}

/// Fractional seconds in microseconds, stored big-endian after the
/// integer part with `(fsp + 1) / 2` bytes.
fn fraction_micros(bytes: &[u8], fsp: u16) -> i64 {
    match fsp {
        1 | 2 => be_uint(bytes.get(..1).unwrap_or(&[])) * 10_000,
        3 | 4 => be_uint(bytes.get(..2).unwrap_or(&[])) * 100,
        5 | 6 => be_uint(bytes.get(..3).unwrap_or(&[])),
        _ => 0,
    }
}

fn format_fraction(micros: i64, fsp: u16) -> String {
    if fsp == 0 {
        return String::new();
    }
    let digits = format!("{:06}", micros);
    format!(".{}", &digits[..usize::from(fsp.min(6))])
}

fn format_timestamp2(value: &Value<'_>) -> String {
    let storage = value.storage();
    let fsp = value.metadata();
    let seconds = be_uint(storage.get(..4).unwrap_or(&[]));
    let micros = fraction_micros(storage.get(4..).unwrap_or(&[]), fsp);
    format!("{}{}", seconds, format_fraction(micros, fsp))
}

fn format_datetime2(value: &Value<'_>) -> String {
    let storage = value.storage();
    let fsp = value.metadata();
    let int_part = be_uint(storage.get(..5).unwrap_or(&[])) - DATETIMEF_INT_OFS;
    let micros = fraction_micros(storage.get(5..).unwrap_or(&[]), fsp);

    let ymdhms = int_part.abs();
    let ymd = ymdhms >> 17;
    let ym = ymd >> 5;
    let hms = ymdhms % (1 << 17);

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
        ym / 13,
        ym % 13,
        ymd % (1 << 5),
        hms >> 12,
        (hms >> 6) % (1 << 6),
        hms % (1 << 6),
        format_fraction(micros, fsp)
    )
}

fn format_time2(value: &Value<'_>) -> String {
    let storage = value.storage();
    let fsp = value.metadata();
    let int_part = be_uint(storage.get(..3).unwrap_or(&[])) - TIMEF_INT_OFS;
    let frac = be_uint(storage.get(3..).unwrap_or(&[]));

    // Negative values keep the fraction in reverse order so they sort as
    // binary strings; borrow one second to undo it.
    let packed = match fsp {
        1 | 2 => {
            let (int_part, frac) = borrow_second(int_part, frac, 0x100);
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let (int_part, frac) = borrow_second(int_part, frac, 0x1_0000);
            (int_part << 24) + frac * 100
        }
        5 | 6 => be_uint(storage.get(..6).unwrap_or(&[])) - TIMEF_OFS,
        _ => int_part << 24,
    };

    let negative = packed < 0;
    let packed = packed.abs();
    let hms = packed >> 24;
    let micros = packed % (1 << 24);
    format!(
        "{}{:02}:{:02}:{:02}{}",
        if negative { "-" } else { "" },
        (hms >> 12) % (1 << 10),
        (hms >> 6) % (1 << 6),
        hms % (1 << 6),
        format_fraction(micros, fsp)
    )
}

fn borrow_second(int_part: i64, frac: i64, modulus: i64) -> (i64, i64) {
    if int_part < 0 && frac != 0 {
        (int_part + 1, frac - modulus)
    } else {
        (int_part, frac)
    }
}
