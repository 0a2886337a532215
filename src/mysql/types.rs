use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::{Error, Result};

/// Binlog event type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    StartV3,
    Query,
    Stop,
    Rotate,
    Intvar,
    Rand,
    UserVar,
    FormatDescription,
    Xid,
    TableMap,
    WriteRowsV1,
    UpdateRowsV1,
    DeleteRowsV1,
    Incident,
    Heartbeat,
    Ignorable,
    RowsQuery,
    WriteRowsV2,
    UpdateRowsV2,
    DeleteRowsV2,
    Gtid,
    AnonymousGtid,
    PreviousGtids,
    Unknown(u8),
}

impl EventType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => EventType::StartV3,
            2 => EventType::Query,
            3 => EventType::Stop,
            4 => EventType::Rotate,
            5 => EventType::Intvar,
            13 => EventType::Rand,
            14 => EventType::UserVar,
            15 => EventType::FormatDescription,
            16 => EventType::Xid,
            19 => EventType::TableMap,
            23 => EventType::WriteRowsV1,
            24 => EventType::UpdateRowsV1,
            25 => EventType::DeleteRowsV1,
            26 => EventType::Incident,
            27 => EventType::Heartbeat,
            28 => EventType::Ignorable,
            29 => EventType::RowsQuery,
            30 => EventType::WriteRowsV2,
            31 => EventType::UpdateRowsV2,
            32 => EventType::DeleteRowsV2,
            33 => EventType::Gtid,
            34 => EventType::AnonymousGtid,
            35 => EventType::PreviousGtids,
            other => EventType::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            EventType::StartV3 => 1,
            EventType::Query => 2,
            EventType::Stop => 3,
            EventType::Rotate => 4,
            EventType::Intvar => 5,
            EventType::Rand => 13,
            EventType::UserVar => 14,
            EventType::FormatDescription => 15,
            EventType::Xid => 16,
            EventType::TableMap => 19,
            EventType::WriteRowsV1 => 23,
            EventType::UpdateRowsV1 => 24,
            EventType::DeleteRowsV1 => 25,
            EventType::Incident => 26,
            EventType::Heartbeat => 27,
            EventType::Ignorable => 28,
            EventType::RowsQuery => 29,
            EventType::WriteRowsV2 => 30,
            EventType::UpdateRowsV2 => 31,
            EventType::DeleteRowsV2 => 32,
            EventType::Gtid => 33,
            EventType::AnonymousGtid => 34,
            EventType::PreviousGtids => 35,
            EventType::Unknown(code) => *code,
        }
    }

    pub fn is_rows_event(&self) -> bool {
        self.rows_kind().is_some()
    }

    /// Rows events written by 5.6+ servers carry an extra-data block.
    pub fn is_rows_v2(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsV2 | EventType::UpdateRowsV2 | EventType::DeleteRowsV2
        )
    }

    pub fn rows_kind(&self) -> Option<RowsKind> {
        match self {
            EventType::WriteRowsV1 | EventType::WriteRowsV2 => Some(RowsKind::Write),
            EventType::UpdateRowsV1 | EventType::UpdateRowsV2 => Some(RowsKind::Update),
            EventType::DeleteRowsV1 | EventType::DeleteRowsV2 => Some(RowsKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Unknown(code) => write!(f, "Unknown({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Column type codes as they appear in table map events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    NewDate,
    Varchar,
    Bit,
    Timestamp2,
    DateTime2,
    Time2,
    Json,
    NewDecimal,
    Enum,
    Set,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    VarString,
    String,
    Geometry,
    Unknown(u8),
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            other => ColumnType::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ColumnType::Decimal => 0,
            ColumnType::Tiny => 1,
            ColumnType::Short => 2,
            ColumnType::Long => 3,
            ColumnType::Float => 4,
            ColumnType::Double => 5,
            ColumnType::Null => 6,
            ColumnType::Timestamp => 7,
            ColumnType::LongLong => 8,
            ColumnType::Int24 => 9,
            ColumnType::Date => 10,
            ColumnType::Time => 11,
            ColumnType::DateTime => 12,
            ColumnType::Year => 13,
            ColumnType::NewDate => 14,
            ColumnType::Varchar => 15,
            ColumnType::Bit => 16,
            ColumnType::Timestamp2 => 17,
            ColumnType::DateTime2 => 18,
            ColumnType::Time2 => 19,
            ColumnType::Json => 245,
            ColumnType::NewDecimal => 246,
            ColumnType::Enum => 247,
            ColumnType::Set => 248,
            ColumnType::TinyBlob => 249,
            ColumnType::MediumBlob => 250,
            ColumnType::LongBlob => 251,
            ColumnType::Blob => 252,
            ColumnType::VarString => 253,
            ColumnType::String => 254,
            ColumnType::Geometry => 255,
            ColumnType::Unknown(code) => *code,
        }
    }

    /// Number of metadata bytes this type carries in a table map event.
    pub fn metadata_len(&self) -> usize {
        match self {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Blob
            | ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::Timestamp2
            | ColumnType::DateTime2
            | ColumnType::Time2 => 1,
            ColumnType::Varchar
            | ColumnType::VarString
            | ColumnType::Bit
            | ColumnType::NewDecimal
            | ColumnType::String
            | ColumnType::Enum
            | ColumnType::Set => 2,
            _ => 0,
        }
    }
}

/// The fixed 19 byte header in front of every binlog event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    /// Header, payload and trailing checksum together.
    pub event_length: u32,
    /// Offset of the next event in the current binlog file.
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < Self::SIZE {
            return Err(Error::Protocol(format!(
                "Event header too short: {} bytes",
                data.remaining()
            )));
        }

        Ok(Self {
            timestamp: data.get_u32_le(),
            event_type: EventType::from_u8(data.get_u8()),
            server_id: data.get_u32_le(),
            event_length: data.get_u32_le(),
            next_position: data.get_u32_le(),
            flags: data.get_u16_le(),
        })
    }
}

/// Checksum algorithm announced by the format description event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    None,
    Crc32,
    Undefined,
}

impl ChecksumAlgorithm {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ChecksumAlgorithm::None,
            1 => ChecksumAlgorithm::Crc32,
            _ => ChecksumAlgorithm::Undefined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    pub post_header_lengths: Vec<u8>,
    pub checksum: ChecksumAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEvent {
    pub position: u64,
    pub next_binlog: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub schema: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XidEvent {
    pub xid: u64,
}

/// Schema of one table as announced ahead of its rows events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub flags: u16,
    pub schema_name: String,
    pub table_name: String,
    pub column_types: Vec<ColumnType>,
    /// One metadata word per column, little-endian as it appears on the wire.
    pub column_metadata: Vec<u16>,
    pub null_bitmap: Vec<u8>,
}

impl TableMapEvent {
    pub fn column_count(&self) -> usize {
        self.column_types.len()
    }

    pub fn is_nullable(&self, column: usize) -> bool {
        bit_is_set(&self.null_bitmap, column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// Raw row images of a write, update or delete rows event.
///
/// The images are kept undecoded; [`RowFieldSet`](super::rows::RowFieldSet)
/// splits them into fields on demand.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub kind: RowsKind,
    pub table_id: u64,
    pub flags: u16,
    pub column_count: usize,
    /// Columns present in the (before) image.
    pub columns_present: Vec<u8>,
    /// Columns present in the after image of an update.
    pub columns_present_after: Option<Vec<u8>>,
    /// Concatenated row images.
    pub rows: Bytes,
    /// Table map this event was decoded against.
    pub table: Option<Arc<TableMapEvent>>,
}

/// Decoded event body.
#[derive(Debug, Clone)]
pub enum EventData {
    FormatDescription(FormatDescriptionEvent),
    Rotate(RotateEvent),
    Query(QueryEvent),
    Xid(XidEvent),
    TableMap(Arc<TableMapEvent>),
    WriteRows(RowsEvent),
    UpdateRows(RowsEvent),
    DeleteRows(RowsEvent),
    Heartbeat,
    /// Events this client does not interpret; the payload is kept as is.
    Unknown(Bytes),
}

/// A complete binlog event as handed to consumers.
#[derive(Debug, Clone)]
pub struct BinlogEvent {
    pub header: EventHeader,
    pub data: EventData,
}

impl BinlogEvent {
    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }

    pub fn rows(&self) -> Option<&RowsEvent> {
        match &self.data {
            EventData::WriteRows(rows) | EventData::UpdateRows(rows) | EventData::DeleteRows(rows) => {
                Some(rows)
            }
            _ => None,
        }
    }
}

pub(crate) fn bit_is_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map(|byte| byte & (1 << (idx % 8)) != 0)
        .unwrap_or(false)
}

pub(crate) fn count_set_bits(bitmap: &[u8], bits: usize) -> usize {
    (0..bits).filter(|&idx| bit_is_set(bitmap, idx)).count()
}
