#![allow(dead_code)]

use binlog_capture::config::{Config, MysqlConfig, ReplicationConfig};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Get live server configuration from environment variables
pub fn get_test_config() -> Config {
    let mysql = MysqlConfig {
        host: env::var("TEST_MYSQL_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_MYSQL_PORT")
            .unwrap_or_else(|_| "3306".to_string())
            .parse()
            .unwrap_or(3306),
        username: env::var("TEST_MYSQL_USERNAME").unwrap_or_else(|_| "root".to_string()),
        password: env::var("TEST_MYSQL_PASSWORD").unwrap_or_else(|_| "mysql".to_string()),
        // Unique per run so parallel test runs do not kick each other off.
        server_id: 1000 + std::process::id() % 10_000,
        connect_timeout_secs: 10,
    };

    Config {
        mysql,
        replication: ReplicationConfig {
            queue_capacity: 16,
            ..ReplicationConfig::default()
        },
    }
}

pub const MOCK_SERVER_VERSION: &str = "8.0.35-mock";
pub const MOCK_PASSWORD: &str = "secret";

const SALT: &[u8; 20] = b"abcdefghijklmnopqrst";

const ARTIFICIAL: u16 = 0x20;

const QUERY_EVENT: u8 = 2;
const ROTATE_EVENT: u8 = 4;
const FORMAT_DESCRIPTION_EVENT: u8 = 15;
const XID_EVENT: u8 = 16;
const TABLE_MAP_EVENT: u8 = 19;
const WRITE_ROWS_EVENT_V2: u8 = 30;

const MYSQL_TYPE_LONG: u8 = 3;
const MYSQL_TYPE_VARCHAR: u8 = 15;

/// Events the mock server streams after the artificial rotate and the
/// format description, with positions starting at the dump offset.
#[derive(Debug, Clone)]
pub enum MockEvent {
    Query(String),
    /// Table map for `shop.items (id INT, name VARCHAR(255))`.
    TableMap(u64),
    /// Write rows for the `shop.items` layout.
    Insert(u64, Vec<(i32, String)>),
    Xid(u64),
}

/// How the stream ends after the scripted events.
#[derive(Debug, Clone)]
pub enum StreamEnd {
    Eof,
    Error(u16, String),
    /// Keep the connection open until the client goes away.
    Hold,
}

#[derive(Debug, Clone)]
pub struct MockScript {
    pub master_status: (String, u64),
    pub binlogs: Vec<(String, u64)>,
    pub events: Vec<MockEvent>,
    pub end: StreamEnd,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            master_status: ("mysql-bin.000003".to_string(), 4),
            binlogs: vec![
                ("mysql-bin.000001".to_string(), 1024),
                ("mysql-bin.000002".to_string(), 2048),
                ("mysql-bin.000003".to_string(), 4096),
            ],
            events: Vec::new(),
            end: StreamEnd::Eof,
        }
    }
}

/// A binlog dump request as received by the mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRequest {
    pub file: String,
    pub position: u32,
    pub server_id: u32,
}

/// Just enough of a MySQL server to replicate from.
pub struct MockServer {
    addr: SocketAddr,
    dumps: Arc<Mutex<Vec<DumpRequest>>>,
}

impl MockServer {
    /// Starts the server on a background thread.
    pub fn start(script: MockScript) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let dumps = Arc::new(Mutex::new(Vec::new()));

        let server_dumps = Arc::clone(&dumps);
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = TcpListener::from_std(listener).unwrap();
                let mut connection_id = 0;
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    connection_id += 1;
                    let session = Session {
                        socket,
                        script: script.clone(),
                        dumps: Arc::clone(&server_dumps),
                        connection_id,
                    };
                    tokio::spawn(async move {
                        let _ = session.run().await;
                    });
                }
            });
        });

        Self { addr, dumps }
    }

    pub fn url(&self, password: &str) -> String {
        format!("mysql://repl:{}@{}", password, self.addr)
    }

    pub fn config(&self) -> Config {
        Config::from_url(&self.url(MOCK_PASSWORD)).unwrap()
    }

    pub fn dumps(&self) -> Vec<DumpRequest> {
        self.dumps.lock().clone()
    }
}

struct Session {
    socket: TcpStream,
    script: MockScript,
    dumps: Arc<Mutex<Vec<DumpRequest>>>,
    connection_id: u32,
}

impl Session {
    async fn run(mut self) -> std::io::Result<()> {
        let greeting = greeting(self.connection_id);
        write_packet(&mut self.socket, 0, &greeting).await?;

        let (_, response) = read_packet(&mut self.socket).await?;
        if auth_response(&response) != scramble(MOCK_PASSWORD, SALT) {
            let err = error_packet(1045, "28000", "Access denied for user 'repl'");
            write_packet(&mut self.socket, 2, &err).await?;
            return Ok(());
        }
        write_packet(&mut self.socket, 2, &ok_packet()).await?;

        loop {
            let (_, command) = read_packet(&mut self.socket).await?;
            match command.first() {
                Some(0x03) => {
                    let sql = String::from_utf8_lossy(&command[1..]).to_string();
                    self.answer_query(&sql).await?;
                }
                Some(0x15) => write_packet(&mut self.socket, 1, &ok_packet()).await?,
                Some(0x12) => return self.dump(&command[1..]).await,
                _ => return Ok(()),
            }
        }
    }

    async fn answer_query(&mut self, sql: &str) -> std::io::Result<()> {
        let packets = if sql == "SHOW MASTER STATUS" {
            let (file, position) = &self.script.master_status;
            result_set(
                &["File", "Position"],
                &[vec![file.clone(), position.to_string()]],
            )
        } else if sql == "SHOW BINARY LOGS" {
            let rows: Vec<Vec<String>> = self
                .script
                .binlogs
                .iter()
                .map(|(name, size)| vec![name.clone(), size.to_string()])
                .collect();
            result_set(&["Log_name", "File_size"], &rows)
        } else if sql.contains("'binlog_checksum'") {
            result_set(
                &["Variable_name", "Value"],
                &[vec!["binlog_checksum".to_string(), "CRC32".to_string()]],
            )
        } else if sql.starts_with("SET ") {
            vec![ok_packet()]
        } else {
            vec![error_packet(1064, "42000", "You have an error in your SQL syntax")]
        };

        for (seq, packet) in packets.iter().enumerate() {
            write_packet(&mut self.socket, seq as u8 + 1, packet).await?;
        }
        Ok(())
    }

    async fn dump(mut self, body: &[u8]) -> std::io::Result<()> {
        let position = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let server_id = u32::from_le_bytes([body[6], body[7], body[8], body[9]]);
        let file = String::from_utf8_lossy(&body[10..]).to_string();
        self.dumps.lock().push(DumpRequest {
            file: file.clone(),
            position,
            server_id,
        });

        let mut writer = EventWriter::new(position);
        let mut events = vec![writer.artificial_rotate(&file, u64::from(position))];
        events.push(writer.format_description());
        for event in &self.script.events {
            events.push(writer.write(event));
        }

        let mut seq: u8 = 1;
        for event in events {
            let mut packet = vec![0x00];
            packet.extend_from_slice(&event);
            write_packet(&mut self.socket, seq, &packet).await?;
            seq = seq.wrapping_add(1);
        }

        match self.script.end.clone() {
            StreamEnd::Eof => {
                write_packet(&mut self.socket, seq, &[0xfe, 0, 0, 2, 0]).await?;
            }
            StreamEnd::Error(code, message) => {
                let err = error_packet(code, "HY000", &message);
                write_packet(&mut self.socket, seq, &err).await?;
            }
            StreamEnd::Hold => {
                let mut buf = [0u8; 64];
                while self.socket.read(&mut buf).await? > 0 {}
            }
        }
        Ok(())
    }
}

/// Serializes events the way a server with CRC32 checksums writes them.
pub struct EventWriter {
    position: u32,
}

impl EventWriter {
    pub fn new(position: u32) -> Self {
        Self { position }
    }

    fn event(&mut self, event_type: u8, flags: u16, payload: &[u8], advance: bool) -> Vec<u8> {
        let event_length = (19 + payload.len() + 4) as u32;
        let next_position = if advance {
            self.position += event_length;
            self.position
        } else {
            0
        };

        let mut event = Vec::with_capacity(event_length as usize);
        event.extend_from_slice(&1_697_369_400u32.to_le_bytes());
        event.push(event_type);
        event.extend_from_slice(&1u32.to_le_bytes());
        event.extend_from_slice(&event_length.to_le_bytes());
        event.extend_from_slice(&next_position.to_le_bytes());
        event.extend_from_slice(&flags.to_le_bytes());
        event.extend_from_slice(payload);
        let crc = crc32fast::hash(&event);
        event.extend_from_slice(&crc.to_le_bytes());
        event
    }

    pub fn artificial_rotate(&mut self, file: &str, position: u64) -> Vec<u8> {
        let mut payload = position.to_le_bytes().to_vec();
        payload.extend_from_slice(file.as_bytes());
        self.event(ROTATE_EVENT, ARTIFICIAL, &payload, false)
    }

    pub fn format_description(&mut self) -> Vec<u8> {
        let mut payload = 4u16.to_le_bytes().to_vec();
        let mut version = [0u8; 50];
        version[..MOCK_SERVER_VERSION.len()].copy_from_slice(MOCK_SERVER_VERSION.as_bytes());
        payload.extend_from_slice(&version);
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.push(19);
        payload.extend_from_slice(&[0x38, 0x0d, 0x00, 0x08, 0x00, 0x12, 0x00]);
        payload.push(1); // CRC32
        self.event(FORMAT_DESCRIPTION_EVENT, 0, &payload, false)
    }

    pub fn write(&mut self, event: &MockEvent) -> Vec<u8> {
        match event {
            MockEvent::Query(sql) => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&11u32.to_le_bytes());
                payload.extend_from_slice(&0u32.to_le_bytes());
                payload.push(4);
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(b"shop\0");
                payload.extend_from_slice(sql.as_bytes());
                self.event(QUERY_EVENT, 0, &payload, true)
            }
            MockEvent::TableMap(table_id) => {
                let mut payload = table_id.to_le_bytes()[..6].to_vec();
                payload.extend_from_slice(&1u16.to_le_bytes());
                payload.extend_from_slice(b"\x04shop\0");
                payload.extend_from_slice(b"\x05items\0");
                payload.push(2);
                payload.extend_from_slice(&[MYSQL_TYPE_LONG, MYSQL_TYPE_VARCHAR]);
                payload.extend_from_slice(&[2, 0xff, 0x00]);
                payload.push(0b11);
                self.event(TABLE_MAP_EVENT, 0, &payload, true)
            }
            MockEvent::Insert(table_id, rows) => {
                let mut payload = table_id.to_le_bytes()[..6].to_vec();
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(&2u16.to_le_bytes());
                payload.push(2);
                payload.push(0b11);
                for (id, name) in rows {
                    payload.push(0x00);
                    payload.extend_from_slice(&id.to_le_bytes());
                    payload.push(name.len() as u8);
                    payload.extend_from_slice(name.as_bytes());
                }
                self.event(WRITE_ROWS_EVENT_V2, 0, &payload, true)
            }
            MockEvent::Xid(xid) => self.event(XID_EVENT, 0, &xid.to_le_bytes(), true),
        }
    }
}

fn greeting(connection_id: u32) -> Vec<u8> {
    // PROTOCOL_41 | SECURE_CONNECTION | PLUGIN_AUTH
    let capabilities: u32 = 0x0000_0200 | 0x0000_8000 | 0x0008_0000;

    let mut data = vec![10];
    data.extend_from_slice(MOCK_SERVER_VERSION.as_bytes());
    data.push(0);
    data.extend_from_slice(&connection_id.to_le_bytes());
    data.extend_from_slice(&SALT[..8]);
    data.push(0);
    data.extend_from_slice(&(capabilities as u16).to_le_bytes());
    data.push(45);
    data.extend_from_slice(&2u16.to_le_bytes());
    data.extend_from_slice(&((capabilities >> 16) as u16).to_le_bytes());
    data.push(21);
    data.extend_from_slice(&[0; 10]);
    data.extend_from_slice(&SALT[8..]);
    data.push(0);
    data.extend_from_slice(b"mysql_native_password\0");
    data
}

/// Auth bytes of a handshake response.
fn auth_response(packet: &[u8]) -> Vec<u8> {
    // capabilities, max packet, charset, filler
    let rest = &packet[32..];
    let user_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let rest = &rest[user_end + 1..];
    let len = rest[0] as usize;
    rest[1..1 + len].to_vec()
}

fn scramble(password: &str, salt: &[u8]) -> Vec<u8> {
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

fn ok_packet() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

fn eof_packet() -> Vec<u8> {
    vec![0xfe, 0x00, 0x00, 0x02, 0x00]
}

fn error_packet(code: u16, state: &str, message: &str) -> Vec<u8> {
    let mut packet = vec![0xff];
    packet.extend_from_slice(&code.to_le_bytes());
    packet.push(b'#');
    packet.extend_from_slice(state.as_bytes());
    packet.extend_from_slice(message.as_bytes());
    packet
}

fn lenenc_str(out: &mut Vec<u8>, value: &str) {
    out.push(value.len() as u8);
    out.extend_from_slice(value.as_bytes());
}

fn result_set(columns: &[&str], rows: &[Vec<String>]) -> Vec<Vec<u8>> {
    let mut packets = vec![vec![columns.len() as u8]];
    for column in columns {
        let mut def = Vec::new();
        lenenc_str(&mut def, "def");
        lenenc_str(&mut def, "");
        lenenc_str(&mut def, "");
        lenenc_str(&mut def, "");
        lenenc_str(&mut def, column);
        lenenc_str(&mut def, column);
        def.push(0x0c);
        def.extend_from_slice(&[45, 0, 255, 0, 0, 0, 253, 0, 0, 0, 0, 0]);
        packets.push(def);
    }
    packets.push(eof_packet());
    for row in rows {
        let mut packet = Vec::new();
        for field in row {
            lenenc_str(&mut packet, field);
        }
        packets.push(packet);
    }
    packets.push(eof_packet());
    packets
}

async fn write_packet(socket: &mut TcpStream, seq: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut packet = (payload.len() as u32).to_le_bytes()[..3].to_vec();
    packet.push(seq);
    packet.extend_from_slice(payload);
    socket.write_all(&packet).await
}

async fn read_packet(socket: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    socket.read_exact(&mut header).await?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len];
    socket.read_exact(&mut payload).await?;
    Ok((header[3], payload))
}
