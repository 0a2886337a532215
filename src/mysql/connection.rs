use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::reassembly::{MAX_PACKET_LEN, PACKET_HEADER_LEN};
use super::types::ChecksumAlgorithm;
use super::wire::{lossy_string, parse_error_packet, server_error, Reader};
use crate::config::ConnectionParams;
use crate::{Error, Result};

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

const UTF8MB4_GENERAL_CI: u8 = 45;

const NATIVE_PASSWORD: &str = "mysql_native_password";
const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

const OK_PACKET: u8 = 0x00;
const MORE_DATA: u8 = 0x01;
const NULL_VALUE: u8 = 0xFB;
const EOF_PACKET: u8 = 0xFE;
const ERR_PACKET: u8 = 0xFF;

const FAST_AUTH_SUCCESS: u8 = 0x03;
const FULL_AUTH_REQUIRED: u8 = 0x04;

/// Greeting sent by the server when a client connects.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub character_set: u8,
    pub status_flags: u16,
    /// Authentication salt, both parts joined.
    pub auth_data: Vec<u8>,
    pub auth_plugin: String,
}

impl Handshake {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let protocol_version = reader.u8("protocol version")?;
        if protocol_version != 10 {
            return Err(Error::Protocol(format!(
                "unsupported handshake protocol version {}",
                protocol_version
            )));
        }

        let server_version = lossy_string(reader.null_terminated());
        let connection_id = reader.u32_le("connection id")?;
        let mut auth_data = reader.take(8, "auth data")?.to_vec();
        reader.skip(1, "filler")?;
        let cap_lower = u32::from(reader.u16_le("capability flags")?);

        // Servers may end the greeting here.
        if reader.is_empty() {
            return Ok(Self {
                protocol_version,
                server_version,
                connection_id,
                capabilities: cap_lower,
                character_set: 0,
                status_flags: 0,
                auth_data,
                auth_plugin: NATIVE_PASSWORD.to_string(),
            });
        }

        let character_set = reader.u8("character set")?;
        let status_flags = reader.u16_le("status flags")?;
        let cap_upper = u32::from(reader.u16_le("capability flags")?);
        let capabilities = (cap_upper << 16) | cap_lower;
        let auth_data_len = usize::from(reader.u8("auth data length")?);
        reader.skip(10, "reserved")?;

        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = auth_data_len.saturating_sub(8).max(13).min(reader.remaining());
            let part2 = reader.take(part2_len, "auth data")?;
            let end = part2.iter().position(|&b| b == 0).unwrap_or(part2.len());
            auth_data.extend_from_slice(&part2[..end]);
        }

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            lossy_string(reader.null_terminated())
        } else {
            NATIVE_PASSWORD.to_string()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capabilities,
            character_set,
            status_flags,
            auth_data,
            auth_plugin,
        })
    }
}

/// A plain protocol connection to a MySQL server.
///
/// Used both as the replication connection, which is handed over to the
/// binlog stream after `binlog_dump`, and for short lived metadata queries.
pub struct MysqlConnection {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server_version: String,
    connection_id: u32,
}

impl std::fmt::Debug for MysqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlConnection")
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl MysqlConnection {
    /// Connects and authenticates, giving up after `connect_timeout`.
    pub async fn connect(params: &ConnectionParams, connect_timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", params.host, params.port);
        info!("Connecting to MySQL at {}", addr);

        timeout(connect_timeout, Self::connect_inner(&addr, params))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("connecting to {} took longer than {:?}", addr, connect_timeout),
            })?
    }

    async fn connect_inner(addr: &str, params: &ConnectionParams) -> Result<Self> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
        tcp.set_nodelay(true)?;

        let mut conn = Self {
            stream: BufReader::new(tcp),
            sequence_id: 0,
            server_version: String::new(),
            connection_id: 0,
        };

        let greeting = conn.read_packet().await?;
        if greeting.first() == Some(&ERR_PACKET) {
            let (code, message) = parse_error_packet(&greeting);
            return Err(Error::Connection(format!(
                "Server refused connection: {} - {}",
                code, message
            )));
        }
        let handshake = Handshake::parse(&greeting)?;
        conn.server_version = handshake.server_version.clone();
        conn.connection_id = handshake.connection_id;

        info!(
            "Connected to MySQL {} (connection_id={})",
            handshake.server_version, handshake.connection_id
        );
        debug!("Auth plugin: {}", handshake.auth_plugin);

        conn.authenticate(params, &handshake).await?;
        Ok(conn)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    async fn authenticate(&mut self, params: &ConnectionParams, handshake: &Handshake) -> Result<()> {
        let client_flags = CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_LONG_PASSWORD
            | CLIENT_TRANSACTIONS
            | CLIENT_PLUGIN_AUTH;

        let plugin = match handshake.auth_plugin.as_str() {
            NATIVE_PASSWORD | CACHING_SHA2_PASSWORD => handshake.auth_plugin.as_str(),
            other => {
                warn!("Unknown auth plugin: {}, trying {}", other, NATIVE_PASSWORD);
                NATIVE_PASSWORD
            }
        };
        let auth_response = scramble(plugin, &params.password, &handshake.auth_data)?;

        let mut response = BytesMut::with_capacity(128 + params.username.len());
        response.put_u32_le(client_flags);
        response.put_u32_le(MAX_PACKET_LEN as u32);
        response.put_u8(UTF8MB4_GENERAL_CI);
        response.put_bytes(0, 23);
        response.put_slice(params.username.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        response.put_slice(plugin.as_bytes());
        response.put_u8(0);

        self.write_packet(&response).await?;
        self.finish_auth(plugin, params).await
    }

    async fn finish_auth(&mut self, plugin: &str, params: &ConnectionParams) -> Result<()> {
        let mut plugin = plugin.to_string();
        loop {
            let resp = self.read_packet().await?;
            match resp.first() {
                Some(&OK_PACKET) => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                Some(&ERR_PACKET) => {
                    let (code, message) = parse_error_packet(&resp);
                    return Err(Error::Authentication(format!("{} - {}", code, message)));
                }
                Some(&EOF_PACKET) => {
                    let mut reader = Reader::new(&resp[1..]);
                    plugin = lossy_string(reader.null_terminated());
                    let salt = reader.rest();
                    let salt = salt.strip_suffix(&[0u8]).unwrap_or(salt);
                    debug!("Auth switch to plugin: {}", plugin);

                    let auth_response = scramble(&plugin, &params.password, salt)?;
                    self.write_packet(&auth_response).await?;
                }
                Some(&MORE_DATA) if plugin == CACHING_SHA2_PASSWORD => match resp.get(1) {
                    Some(&FAST_AUTH_SUCCESS) => {
                        debug!("Fast auth success");
                    }
                    Some(&FULL_AUTH_REQUIRED) => {
                        return Err(Error::Authentication(format!(
                            "{} full authentication requires a secure connection",
                            CACHING_SHA2_PASSWORD
                        )));
                    }
                    other => {
                        return Err(Error::Authentication(format!(
                            "unexpected {} state {:?}",
                            CACHING_SHA2_PASSWORD, other
                        )));
                    }
                },
                Some(other) => {
                    return Err(Error::Protocol(format!(
                        "unexpected auth response 0x{:02X}",
                        other
                    )));
                }
                None => return Err(Error::Protocol("empty auth response".to_string())),
            }
        }
    }

    /// Reads one logical packet, joining continuation packets.
    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PACKET_HEADER_LEN];
            self.stream.read_exact(&mut header).await?;
            let len = usize::from(header[0])
                | usize::from(header[1]) << 8
                | usize::from(header[2]) << 16;
            self.sequence_id = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream.read_exact(&mut payload[start..]).await?;

            if len < MAX_PACKET_LEN {
                return Ok(payload);
            }
        }
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len >= MAX_PACKET_LEN {
            return Err(Error::Protocol(format!("Packet too large: {} bytes", len)));
        }

        let mut packet = Vec::with_capacity(PACKET_HEADER_LEN + len);
        packet.extend_from_slice(&(len as u32).to_le_bytes()[..3]);
        packet.push(self.sequence_id);
        packet.extend_from_slice(data);

        let stream = self.stream.get_mut();
        stream.write_all(&packet).await?;
        stream.flush().await?;
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    async fn command(&mut self, command: u8, body: &[u8]) -> Result<()> {
        self.sequence_id = 0;
        let mut packet = Vec::with_capacity(body.len() + 1);
        packet.push(command);
        packet.extend_from_slice(body);
        self.write_packet(&packet).await
    }

    /// Runs a statement, discarding any result set.
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        self.query_rows(sql).await.map(|_| ())
    }

    /// Runs a statement and returns its rows as text, `None` for NULL.
    pub async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        debug!("Query: {}", sql);
        self.command(COM_QUERY, sql.as_bytes()).await?;

        let first = self.read_packet().await?;
        let column_count = match first.first() {
            Some(&OK_PACKET) => return Ok(Vec::new()),
            Some(&ERR_PACKET) => return Err(server_error(&first)),
            Some(_) => Reader::new(&first).packed_int("column count")? as usize,
            None => return Err(Error::Protocol("empty query response".to_string())),
        };

        // Column definitions.
        loop {
            let packet = self.read_packet().await?;
            if is_eof(&packet) {
                break;
            }
            if packet.first() == Some(&ERR_PACKET) {
                return Err(server_error(&packet));
            }
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.read_packet().await?;
            if is_eof(&packet) {
                break;
            }
            if packet.first() == Some(&ERR_PACKET) {
                return Err(server_error(&packet));
            }

            let mut reader = Reader::new(&packet);
            let mut row = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                if reader.peek_u8() == Some(NULL_VALUE) {
                    reader.skip(1, "NULL")?;
                    row.push(None);
                } else {
                    let len = reader.packed_int("field length")? as usize;
                    row.push(Some(lossy_string(reader.take(len, "field")?)));
                }
            }
            rows.push(row);
        }

        Ok(rows)
    }

    /// Current binlog file and position of the server.
    pub async fn fetch_master_status(&mut self) -> Result<(String, u64)> {
        let rows = match self.query_rows("SHOW MASTER STATUS").await {
            Ok(rows) => rows,
            Err(Error::Server { code, message }) => {
                debug!(
                    "SHOW MASTER STATUS failed ({} - {}), trying SHOW BINARY LOG STATUS",
                    code, message
                );
                self.query_rows("SHOW BINARY LOG STATUS").await?
            }
            Err(e) => return Err(e),
        };

        let row = rows.into_iter().next().ok_or_else(|| {
            Error::Protocol("Server reports no binary log; is log_bin enabled?".to_string())
        })?;
        let file = row.first().cloned().flatten().unwrap_or_default();
        let position = row
            .get(1)
            .cloned()
            .flatten()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::Protocol("Malformed binary log status".to_string()))?;
        Ok((file, position))
    }

    /// Every binary log on the server with its size in bytes.
    pub async fn fetch_binlogs_name_and_size(&mut self) -> Result<Vec<(String, u64)>> {
        let rows = self.query_rows("SHOW BINARY LOGS").await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let mut fields = row.into_iter();
                let name = fields.next().flatten()?;
                let size = fields.next().flatten()?.parse().ok()?;
                Some((name, size))
            })
            .collect())
    }

    /// Tells the server this client understands event checksums and returns
    /// the algorithm its events will carry.
    ///
    /// Servers without checksum support know neither variable, which is fine.
    pub async fn enable_checksum(&mut self) -> Result<ChecksumAlgorithm> {
        let rows = match self
            .query_rows("SHOW GLOBAL VARIABLES LIKE 'binlog_checksum'")
            .await
        {
            Ok(rows) => rows,
            Err(Error::Server { code, message }) => {
                debug!("Server has no binlog checksums ({} - {})", code, message);
                return Ok(ChecksumAlgorithm::None);
            }
            Err(e) => return Err(e),
        };

        let algorithm = rows
            .first()
            .and_then(|row| row.get(1).cloned().flatten())
            .map(|value| match value.to_ascii_uppercase().as_str() {
                "CRC32" => ChecksumAlgorithm::Crc32,
                "NONE" => ChecksumAlgorithm::None,
                _ => ChecksumAlgorithm::Undefined,
            })
            .unwrap_or(ChecksumAlgorithm::None);

        match algorithm {
            ChecksumAlgorithm::None => {}
            ChecksumAlgorithm::Crc32 => {
                self.query("SET @master_binlog_checksum = @@global.binlog_checksum")
                    .await?;
            }
            ChecksumAlgorithm::Undefined => {
                return Err(Error::Protocol(
                    "server uses an unknown binlog checksum algorithm".to_string(),
                ));
            }
        }

        debug!("Binlog checksum: {:?}", algorithm);
        Ok(algorithm)
    }

    pub async fn register_slave(&mut self, server_id: u32) -> Result<()> {
        let mut body = BytesMut::with_capacity(17);
        body.put_u32_le(server_id);
        body.put_u8(0); // hostname length
        body.put_u8(0); // user length
        body.put_u8(0); // password length
        body.put_u16_le(0); // port
        body.put_u32_le(0); // replication rank
        body.put_u32_le(0); // master id
        self.command(COM_REGISTER_SLAVE, &body).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(&OK_PACKET) => {
                info!("Registered as replica with server_id={}", server_id);
                Ok(())
            }
            Some(&ERR_PACKET) => Err(server_error(&resp)),
            _ => Err(Error::Protocol(
                "Unexpected response to COM_REGISTER_SLAVE".to_string(),
            )),
        }
    }

    /// Asks the server to stream events from `file` at `position`.
    ///
    /// From here on the connection carries the binlog stream; read it with
    /// [`read_stream`](Self::read_stream).
    pub async fn binlog_dump(&mut self, file: &str, position: u32, server_id: u32) -> Result<()> {
        let mut body = BytesMut::with_capacity(file.len() + 10);
        body.put_u32_le(position);
        body.put_u16_le(0); // flags
        body.put_u32_le(server_id);
        body.put_slice(file.as_bytes());
        self.command(COM_BINLOG_DUMP, &body).await?;

        info!("Started binlog dump from {}:{}", file, position);
        Ok(())
    }

    /// Reads raw stream bytes into `buf`, filling it completely.
    pub async fn read_stream(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).await?;
        Ok(())
    }
}

fn is_eof(packet: &[u8]) -> bool {
    packet.first() == Some(&EOF_PACKET) && packet.len() < 9
}

fn scramble(plugin: &str, password: &str, salt: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD => Ok(scramble_native(password, salt)),
        CACHING_SHA2_PASSWORD => Ok(scramble_caching_sha2(password, salt)),
        other => Err(Error::Authentication(format!(
            "Unsupported auth plugin: {}",
            other
        ))),
    }
}

/// `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`
pub(crate) fn scramble_native(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + salt)`
pub(crate) fn scramble_caching_sha2(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let hash1 = Sha256::digest(password.as_bytes());
    let hash2 = Sha256::digest(hash1);
    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(salt);
    let hash3 = hasher.finalize();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}
