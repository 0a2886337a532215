use bytes::{BufMut, Bytes, BytesMut};

use super::types::{ColumnType, EventHeader, EventType, RowsKind};

/// Mock event builder for testing the binlog decoder and driver
pub struct MockEventBuilder {
    server_id: u32,
    timestamp: u32,
    position: u32,
    checksum: bool,
}

#[derive(Debug, Clone)]
pub struct MockTable {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub columns: Vec<(ColumnType, Vec<u8>)>,
}

impl MockTable {
    /// `columns` pairs each type with its raw table map metadata bytes.
    pub fn new(table_id: u64, schema: &str, table: &str, columns: Vec<(ColumnType, Vec<u8>)>) -> Self {
        Self {
            table_id,
            schema: schema.to_string(),
            table: table.to_string(),
            columns,
        }
    }

    /// `shop.items (id INT, name VARCHAR(255))`
    pub fn items(table_id: u64) -> Self {
        Self::new(
            table_id,
            "shop",
            "items",
            vec![
                (ColumnType::Long, vec![]),
                (ColumnType::Varchar, vec![0xff, 0x00]),
            ],
        )
    }
}

impl Default for MockEventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEventBuilder {
    pub fn new() -> Self {
        Self {
            server_id: 1,
            timestamp: 1_697_369_400, // 2023-10-15 10:30:00 UTC
            position: 4,
            checksum: true,
        }
    }

    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    /// Wraps a payload in a header and, when enabled, a CRC32 trailer.
    ///
    /// Advances the builder position past the event.
    pub fn event(&mut self, event_type: EventType, payload: &[u8]) -> Bytes {
        let trailer = if self.checksum { 4 } else { 0 };
        let event_length = (EventHeader::SIZE + payload.len() + trailer) as u32;
        self.position += event_length;

        let mut buf = BytesMut::with_capacity(event_length as usize);
        buf.put_u32_le(self.timestamp);
        buf.put_u8(event_type.as_u8());
        buf.put_u32_le(self.server_id);
        buf.put_u32_le(event_length);
        buf.put_u32_le(self.position);
        buf.put_u16_le(0);
        buf.put_slice(payload);
        if self.checksum {
            let crc = crc32fast::hash(&buf);
            buf.put_u32_le(crc);
        }
        buf.freeze()
    }

    /// Build a FORMAT_DESCRIPTION event for a MySQL 8 server
    pub fn format_description(&mut self) -> Bytes {
        self.format_description_for("8.0.35-log")
    }

    pub fn format_description_for(&mut self, server_version: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16_le(4);
        let mut version = [0u8; 50];
        version[..server_version.len()].copy_from_slice(server_version.as_bytes());
        buf.put_slice(&version);
        buf.put_u32_le(0);
        buf.put_u8(EventHeader::SIZE as u8);
        buf.put_slice(&[0x38, 0x0d, 0x00, 0x08, 0x00, 0x12, 0x00]);
        if self.checksum {
            buf.put_u8(1); // CRC32
        }
        self.event(EventType::FormatDescription, &buf)
    }

    /// Build a ROTATE event pointing at `file`
    pub fn rotate(&mut self, file: &str, position: u64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64_le(position);
        buf.put_slice(file.as_bytes());
        self.event(EventType::Rotate, &buf)
    }

    pub fn query(&mut self, schema: &str, query: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(11); // thread id
        buf.put_u32_le(0); // exec time
        buf.put_u8(schema.len() as u8);
        buf.put_u16_le(0); // error code
        buf.put_u16_le(3); // status vars length
        buf.put_slice(&[0x00, 0x00, 0x00]);
        buf.put_slice(schema.as_bytes());
        buf.put_u8(0);
        buf.put_slice(query.as_bytes());
        self.event(EventType::Query, &buf)
    }

    pub fn xid(&mut self, xid: u64) -> Bytes {
        self.event(EventType::Xid, &xid.to_le_bytes())
    }

    pub fn table_map(&mut self, table: &MockTable) -> Bytes {
        let mut buf = BytesMut::new();
        put_table_id(&mut buf, table.table_id);
        buf.put_u16_le(1);
        buf.put_u8(table.schema.len() as u8);
        buf.put_slice(table.schema.as_bytes());
        buf.put_u8(0);
        buf.put_u8(table.table.len() as u8);
        buf.put_slice(table.table.as_bytes());
        buf.put_u8(0);
        buf.put_u8(table.columns.len() as u8);
        for (column_type, _) in &table.columns {
            buf.put_u8(column_type.as_u8());
        }
        let metadata: Vec<u8> = table
            .columns
            .iter()
            .flat_map(|(_, meta)| meta.iter().copied())
            .collect();
        buf.put_u8(metadata.len() as u8);
        buf.put_slice(&metadata);
        buf.put_bytes(0xff, (table.columns.len() + 7) / 8);
        self.event(EventType::TableMap, &buf)
    }

    /// Build a v2 rows event with every column present
    ///
    /// `images` holds the encoded row images, null bitmap included.
    pub fn rows(&mut self, kind: RowsKind, table: &MockTable, images: &[Vec<u8>]) -> Bytes {
        let column_count = table.columns.len();
        let bitmap_len = (column_count + 7) / 8;

        let mut buf = BytesMut::new();
        put_table_id(&mut buf, table.table_id);
        buf.put_u16_le(0);
        buf.put_u16_le(2); // extra data length, no extra data
        buf.put_u8(column_count as u8);
        buf.put_bytes(0xff, bitmap_len);
        if kind == RowsKind::Update {
            buf.put_bytes(0xff, bitmap_len);
        }
        for image in images {
            buf.put_slice(image);
        }

        let event_type = match kind {
            RowsKind::Write => EventType::WriteRowsV2,
            RowsKind::Update => EventType::UpdateRowsV2,
            RowsKind::Delete => EventType::DeleteRowsV2,
        };
        self.event(event_type, &buf)
    }

    pub fn heartbeat(&mut self) -> Bytes {
        self.event(EventType::Heartbeat, b"mysql-bin.000001")
    }
}

fn put_table_id(buf: &mut BytesMut, table_id: u64) {
    buf.put_slice(&table_id.to_le_bytes()[..6]);
}

/// Row image for [`MockTable::items`] with no NULLs.
pub fn items_row(id: i32, name: &str) -> Vec<u8> {
    let mut row = vec![0x00];
    row.extend_from_slice(&id.to_le_bytes());
    row.push(name.len() as u8);
    row.extend_from_slice(name.as_bytes());
    row
}
