use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::rows::TableMapCache;
use super::types::{
    BinlogEvent, ChecksumAlgorithm, ColumnType, EventData, EventHeader, EventType,
    FormatDescriptionEvent, QueryEvent, RotateEvent, RowsEvent, RowsKind, TableMapEvent,
    XidEvent,
};
use super::wire::{lossy_string, Reader};
use crate::{Error, Result};

const CHECKSUM_LEN: usize = 4;

/// Server version field of the format description event.
const SERVER_VERSION_LEN: usize = 50;

/// binlog_version + server_version + create_timestamp + header_length
const FDE_FIXED_LEN: usize = 2 + SERVER_VERSION_LEN + 4 + 1;

/// Turns raw event bytes from the stream into [`BinlogEvent`]s.
///
/// The decoder keeps the state that spans events: the checksum algorithm
/// announced by the last format description event and the table maps that
/// rows events refer to.
pub struct BinlogDecoder {
    tables: TableMapCache,
    checksum: ChecksumAlgorithm,
    verify_checksum: bool,
}

impl Default for BinlogDecoder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl BinlogDecoder {
    pub fn new(verify_checksum: bool) -> Self {
        Self {
            tables: TableMapCache::new(),
            checksum: ChecksumAlgorithm::None,
            verify_checksum,
        }
    }

    /// Decoder for a stream whose checksum algorithm is known up front.
    ///
    /// Events before the first format description, such as the artificial
    /// rotate that opens a dump, are then decoded correctly.
    pub fn with_checksum(verify_checksum: bool, checksum: ChecksumAlgorithm) -> Self {
        Self {
            checksum,
            ..Self::new(verify_checksum)
        }
    }

    pub fn tables(&self) -> &TableMapCache {
        &self.tables
    }

    pub fn checksum(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    /// Forgets table maps and checksum state, as needed when the stream
    /// restarts at a new position.
    pub fn reset(&mut self) {
        self.tables.clear();
        self.checksum = ChecksumAlgorithm::None;
    }

    /// Decodes one complete event: header, payload and optional checksum.
    pub fn decode(&mut self, data: Bytes) -> Result<BinlogEvent> {
        let header = EventHeader::parse(&data)?;

        if header.event_length as usize != data.len() {
            warn!(
                "{} event announces {} bytes but {} were received",
                header.event_type,
                header.event_length,
                data.len()
            );
        }

        let checksum = if header.event_type == EventType::FormatDescription {
            fde_checksum_algorithm(&data[EventHeader::SIZE..])
        } else {
            self.checksum
        };

        let payload_end = if checksum == ChecksumAlgorithm::Crc32 {
            if data.len() < EventHeader::SIZE + CHECKSUM_LEN {
                return Err(Error::Protocol(format!(
                    "{} event too short for its checksum",
                    header.event_type
                )));
            }
            let end = data.len() - CHECKSUM_LEN;
            if self.verify_checksum {
                verify_crc32(&data, end)?;
            }
            end
        } else {
            data.len()
        };
        let payload = data.slice(EventHeader::SIZE..payload_end);

        trace!(
            "Decoding {} event at next_position={}, {} payload bytes",
            header.event_type,
            header.next_position,
            payload.len()
        );

        let data = match header.event_type {
            EventType::FormatDescription => {
                let event = decode_format_description(&payload, checksum)?;
                debug!(
                    "Format description: server {}, binlog v{}, checksum {:?}",
                    event.server_version, event.binlog_version, event.checksum
                );
                self.checksum = event.checksum;
                EventData::FormatDescription(event)
            }
            EventType::TableMap => {
                let table = Arc::new(decode_table_map(&payload)?);
                trace!(
                    "Table map {} -> {}.{}",
                    table.table_id,
                    table.schema_name,
                    table.table_name
                );
                self.tables.insert(Arc::clone(&table));
                EventData::TableMap(table)
            }
            EventType::Rotate => EventData::Rotate(decode_rotate(&payload)?),
            EventType::Query => EventData::Query(decode_query(&payload)?),
            EventType::Xid => EventData::Xid(XidEvent {
                xid: Reader::new(&payload).u64_le("xid")?,
            }),
            EventType::Heartbeat => EventData::Heartbeat,
            event_type => match event_type.rows_kind() {
                Some(kind) => {
                    let mut rows = decode_rows(&payload, kind, event_type.is_rows_v2())?;
                    let table = self
                        .tables
                        .get(rows.table_id)
                        .ok_or(Error::UnknownTable(rows.table_id))?;
                    rows.table = Some(Arc::clone(table));
                    match kind {
                        RowsKind::Write => EventData::WriteRows(rows),
                        RowsKind::Update => EventData::UpdateRows(rows),
                        RowsKind::Delete => EventData::DeleteRows(rows),
                    }
                }
                None => EventData::Unknown(payload),
            },
        };

        Ok(BinlogEvent { header, data })
    }
}

/// Checksum algorithm of a format description event payload (checksum
/// included).
///
/// Servers older than the checksum feature do not carry the algorithm byte
/// at all; for the others it sits right before the four checksum bytes.
fn fde_checksum_algorithm(payload: &[u8]) -> ChecksumAlgorithm {
    if payload.len() < FDE_FIXED_LEN + 1 + CHECKSUM_LEN {
        return ChecksumAlgorithm::None;
    }

    let version = server_version(&payload[2..2 + SERVER_VERSION_LEN]);
    if !version_has_checksum(&version) {
        return ChecksumAlgorithm::None;
    }

    match ChecksumAlgorithm::from_u8(payload[payload.len() - 1 - CHECKSUM_LEN]) {
        ChecksumAlgorithm::Undefined => ChecksumAlgorithm::None,
        algorithm => algorithm,
    }
}

fn server_version(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    lossy_string(&raw[..end])
}

/// Whether a server of this version writes the checksum algorithm byte.
///
/// MySQL added binlog checksums in 5.6.1, MariaDB in 5.3.
pub(crate) fn version_has_checksum(version: &str) -> bool {
    let mut parts = version.split('.');
    let major = parts.next().and_then(|p| p.parse::<u32>().ok());
    let minor = parts.next().and_then(|p| {
        p.chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<u32>()
            .ok()
    });
    let patch = parts
        .next()
        .and_then(|p| {
            p.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse::<u32>()
                .ok()
        })
        .unwrap_or(0);

    let (major, minor) = match (major, minor) {
        (Some(major), Some(minor)) => (major, minor),
        _ => return true,
    };

    if version.contains("MariaDB") {
        return (major, minor) >= (5, 3);
    }
    (major, minor, patch) >= (5, 6, 1)
}

fn verify_crc32(data: &[u8], payload_end: usize) -> Result<()> {
    let mut reader = Reader::new(&data[payload_end..]);
    let expected = reader.u32_le("event checksum")?;
    let computed = crc32fast::hash(&data[..payload_end]);
    if expected != computed {
        return Err(Error::ChecksumMismatch { expected, computed });
    }
    Ok(())
}

fn decode_format_description(
    payload: &[u8],
    checksum: ChecksumAlgorithm,
) -> Result<FormatDescriptionEvent> {
    let mut reader = Reader::new(payload);
    let binlog_version = reader.u16_le("binlog version")?;
    let server_version = server_version(reader.take(SERVER_VERSION_LEN, "server version")?);
    let create_timestamp = reader.u32_le("create timestamp")?;
    let header_length = reader.u8("header length")?;

    let mut post_header_lengths = reader.rest().to_vec();
    if version_has_checksum(&server_version) {
        // Trailing algorithm byte.
        post_header_lengths.pop();
    }

    Ok(FormatDescriptionEvent {
        binlog_version,
        server_version,
        create_timestamp,
        header_length,
        post_header_lengths,
        checksum,
    })
}

fn decode_rotate(payload: &[u8]) -> Result<RotateEvent> {
    let mut reader = Reader::new(payload);
    let position = reader.u64_le("rotate position")?;
    let name = reader.rest();
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    Ok(RotateEvent {
        position,
        next_binlog: lossy_string(&name[..end]),
    })
}

fn decode_query(payload: &[u8]) -> Result<QueryEvent> {
    let mut reader = Reader::new(payload);
    let thread_id = reader.u32_le("query thread id")?;
    let exec_time = reader.u32_le("query exec time")?;
    let schema_len = reader.u8("query schema length")? as usize;
    let error_code = reader.u16_le("query error code")?;
    let status_vars_len = reader.u16_le("query status vars length")? as usize;
    reader.skip(status_vars_len, "query status vars")?;
    let schema = lossy_string(reader.take(schema_len, "query schema")?);
    reader.skip(1, "query schema terminator")?;
    let query = lossy_string(reader.rest());

    Ok(QueryEvent {
        thread_id,
        exec_time,
        error_code,
        schema,
        query,
    })
}

fn decode_table_map(payload: &[u8]) -> Result<TableMapEvent> {
    let mut reader = Reader::new(payload);
    let table_id = reader.uint_le(6, "table id")?;
    let flags = reader.u16_le("table map flags")?;

    let schema_len = reader.u8("schema name length")? as usize;
    let schema_name = lossy_string(reader.take(schema_len, "schema name")?);
    reader.skip(1, "schema name terminator")?;

    let table_len = reader.u8("table name length")? as usize;
    let table_name = lossy_string(reader.take(table_len, "table name")?);
    reader.skip(1, "table name terminator")?;

    let column_count = reader.packed_int("column count")? as usize;
    let column_types: Vec<ColumnType> = reader
        .take(column_count, "column types")?
        .iter()
        .map(|&code| ColumnType::from_u8(code))
        .collect();

    let metadata_len = reader.packed_int("metadata length")? as usize;
    let metadata_block = reader.take(metadata_len, "column metadata")?;
    let column_metadata = decode_column_metadata(&column_types, metadata_block)?;

    let null_bitmap = reader
        .take((column_count + 7) / 8, "null bitmap")?
        .to_vec();

    // MySQL 8 appends optional metadata (column names, signedness) here.
    if !reader.is_empty() {
        trace!(
            "Ignoring {} bytes of optional metadata for table {}",
            reader.remaining(),
            table_id
        );
    }

    Ok(TableMapEvent {
        table_id,
        flags,
        schema_name,
        table_name,
        column_types,
        column_metadata,
        null_bitmap,
    })
}

fn decode_column_metadata(column_types: &[ColumnType], block: &[u8]) -> Result<Vec<u16>> {
    let mut reader = Reader::new(block);
    let mut metadata = Vec::with_capacity(column_types.len());

    for column_type in column_types {
        let word = match column_type.metadata_len() {
            0 => 0,
            1 => u16::from(reader.u8("column metadata")?),
            _ => reader.u16_le("column metadata")?,
        };
        metadata.push(word);
    }

    if !reader.is_empty() {
        return Err(Error::Protocol(format!(
            "{} unused bytes in column metadata block",
            reader.remaining()
        )));
    }

    Ok(metadata)
}

fn decode_rows(payload: &Bytes, kind: RowsKind, v2: bool) -> Result<RowsEvent> {
    let mut reader = Reader::new(payload);
    let table_id = reader.uint_le(6, "rows table id")?;
    let flags = reader.u16_le("rows flags")?;

    if v2 {
        // The length counts its own two bytes.
        let extra_len = reader.u16_le("rows extra data length")? as usize;
        reader.skip(extra_len.saturating_sub(2), "rows extra data")?;
    }

    let column_count = reader.packed_int("rows column count")?;
    if column_count > reader.remaining() as u64 * 8 {
        return Err(Error::Protocol(format!(
            "rows event claims {} columns, only {} bytes left",
            column_count,
            reader.remaining()
        )));
    }
    let column_count = column_count as usize;
    let bitmap_len = (column_count + 7) / 8;
    let columns_present = reader.take(bitmap_len, "columns bitmap")?.to_vec();
    let columns_present_after = if kind == RowsKind::Update {
        Some(reader.take(bitmap_len, "after image columns bitmap")?.to_vec())
    } else {
        None
    };

    let rows = payload.slice(reader.position()..);

    Ok(RowsEvent {
        kind,
        table_id,
        flags,
        column_count,
        columns_present,
        columns_present_after,
        rows,
        table: None,
    })
}

#[cfg(test)]
#[path = "decoder_tests.rs"]
mod tests;
