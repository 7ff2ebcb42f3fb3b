use bytes::{Buf, BufMut, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::backend::{self, Message};
use postgres_protocol::message::frontend;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::sql::{quote_ident, quote_literal};
use super::types::format_lsn;
use crate::config::PostgresConfig;
use crate::{Error, Result};

/// Microseconds between the Unix epoch and 2000-01-01, the epoch of
/// replication protocol timestamps.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// A row returned by the simple query protocol, all values as text.
pub type SimpleRow = HashMap<String, Option<String>>;

/// A backend frame. `Message::parse` does not know CopyBothResponse (`W`),
/// so that one is split off the buffer here.
enum Backend {
    CopyBothResponse,
    Message(Message),
}

/// A connection opened with `replication=database`.
///
/// tokio-postgres cannot drive the CopyBoth sub-protocol, so this speaks the
/// wire protocol directly through `postgres-protocol`.
pub struct ReplicationConnection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl ReplicationConnection {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "Opening replication connection"
        );

        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| Error::Timeout {
            message: format!("connecting to {}:{}", config.host, config.port),
        })??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            buffer: BytesMut::with_capacity(8192),
        };

        let mut buf = BytesMut::new();
        frontend::startup_message(
            [
                ("user", config.username.as_str()),
                ("database", config.database.as_str()),
                ("replication", "database"),
                ("application_name", "schema-sync"),
                ("TimeZone", "UTC"),
            ],
            &mut buf,
        )?;
        conn.send(&buf).await?;
        conn.authenticate(&config.username, &config.password).await?;
        conn.wait_ready().await?;

        debug!("Replication connection ready");
        Ok(conn)
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Wraps an already connected socket; used by tests with a scripted server.
    #[cfg(test)]
    pub(crate) fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(8192),
        }
    }

    async fn read_message(&mut self) -> Result<Message> {
        match self.read_backend().await? {
            Backend::Message(message) => Ok(message),
            Backend::CopyBothResponse => Err(Error::Protocol(
                "unexpected CopyBothResponse".to_string(),
            )),
        }
    }

    async fn read_backend(&mut self) -> Result<Backend> {
        loop {
            if self.buffer.first() == Some(&b'W') {
                if self.buffer.len() >= 5 {
                    let len = i32::from_be_bytes([
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                        self.buffer[4],
                    ]);
                    if len < 4 {
                        return Err(Error::Protocol(format!(
                            "invalid CopyBothResponse length {}",
                            len
                        )));
                    }
                    let frame_len = 1 + len as usize;
                    if self.buffer.len() >= frame_len {
                        self.buffer.advance(frame_len);
                        return Ok(Backend::CopyBothResponse);
                    }
                }
            } else if let Some(message) = Message::parse(&mut self.buffer)? {
                return Ok(Backend::Message(message));
            }
            let read = self.stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(Error::Connection(
                    "server closed the replication connection".to_string(),
                ));
            }
        }
    }

    async fn authenticate(&mut self, user: &str, password: &str) -> Result<()> {
        let mut scram: Option<sasl::ScramSha256> = None;

        loop {
            let mut buf = BytesMut::new();
            match self.read_message().await? {
                Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                Message::AuthenticationCleartextPassword => {
                    frontend::password_message(password.as_bytes(), &mut buf)?;
                    self.send(&buf).await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let hash =
                        authentication::md5_hash(user.as_bytes(), password.as_bytes(), body.salt());
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                    self.send(&buf).await?;
                }
                Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        supported |= mechanism == sasl::SCRAM_SHA_256;
                    }
                    if !supported {
                        return Err(Error::Authentication(
                            "server offers no supported SASL mechanism".to_string(),
                        ));
                    }
                    let client = sasl::ScramSha256::new(
                        password.as_bytes(),
                        sasl::ChannelBinding::unsupported(),
                    );
                    frontend::sasl_initial_response(sasl::SCRAM_SHA_256, client.message(), &mut buf)?;
                    self.send(&buf).await?;
                    scram = Some(client);
                }
                Message::AuthenticationSaslContinue(body) => {
                    let client = scram.as_mut().ok_or_else(|| {
                        Error::Protocol("SASL continue without SASL start".to_string())
                    })?;
                    client
                        .update(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    frontend::sasl_response(client.message(), &mut buf)?;
                    self.send(&buf).await?;
                }
                Message::AuthenticationSaslFinal(body) => {
                    let client = scram.as_mut().ok_or_else(|| {
                        Error::Protocol("SASL final without SASL start".to_string())
                    })?;
                    client
                        .finish(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                }
                Message::ErrorResponse(body) => {
                    return Err(Error::Authentication(database_error(&body).to_string()));
                }
                _ => {
                    return Err(Error::Protocol(
                        "unexpected message during authentication".to_string(),
                    ));
                }
            }
        }
    }

    async fn wait_ready(&mut self) -> Result<()> {
        loop {
            match self.read_message().await? {
                Message::ReadyForQuery(_) => return Ok(()),
                Message::ErrorResponse(body) => return Err(database_error(&body)),
                _ => {}
            }
        }
    }

    /// Runs a replication command or query with the simple query protocol.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<SimpleRow>> {
        debug!(sql = %sql, "Simple query on replication connection");
        let mut buf = BytesMut::new();
        frontend::query(sql, &mut buf)?;
        self.send(&buf).await?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::new();
        let mut failure = None;
        loop {
            match self.read_message().await? {
                Message::RowDescription(body) => {
                    columns = body
                        .fields()
                        .map(|field| Ok(field.name().to_string()))
                        .collect::<Vec<String>>()?;
                }
                Message::DataRow(body) => {
                    let data = body.buffer();
                    let mut ranges = body.ranges();
                    let mut row = SimpleRow::new();
                    let mut index = 0;
                    while let Some(range) = ranges.next()? {
                        let value = range.map(|r| String::from_utf8_lossy(&data[r]).into_owned());
                        if let Some(name) = columns.get(index) {
                            row.insert(name.clone(), value);
                        }
                        index += 1;
                    }
                    rows.push(row);
                }
                Message::ErrorResponse(body) => failure = Some(database_error(&body)),
                Message::ReadyForQuery(_) => break,
                _ => {}
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.into_iter().next().ok_or_else(|| {
            Error::Protocol("IDENTIFY_SYSTEM returned no rows".to_string())
        })?;
        let text = |name: &str| row.get(name).cloned().flatten();

        let info = SystemInfo {
            system_id: text("systemid").unwrap_or_default(),
            timeline: text("timeline").and_then(|t| t.parse().ok()).unwrap_or(1),
            xlogpos: text("xlogpos").unwrap_or_else(|| "0/0".to_string()),
            dbname: text("dbname"),
        };
        debug!(?info, "Identified system");
        Ok(info)
    }

    /// Switches the connection into streaming mode.
    ///
    /// A `start_lsn` of zero resumes from the slot's confirmed position.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        start_lsn: u64,
        publication: &str,
        proto_version: u8,
    ) -> Result<ReplicationStream> {
        let sql = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '{}', publication_names {})",
            quote_ident(slot_name),
            format_lsn(start_lsn),
            proto_version,
            quote_literal(&quote_ident(publication)),
        );
        info!(slot = %slot_name, lsn = %format_lsn(start_lsn), "Starting replication");

        let mut buf = BytesMut::new();
        frontend::query(&sql, &mut buf)?;
        self.send(&buf).await?;

        loop {
            match self.read_backend().await? {
                Backend::CopyBothResponse => {
                    debug!("Entered CopyBoth mode");
                    return Ok(ReplicationStream { conn: self });
                }
                Backend::Message(Message::ErrorResponse(body)) => {
                    return Err(database_error(&body))
                }
                Backend::Message(Message::NoticeResponse(_) | Message::ParameterStatus(_)) => {}
                Backend::Message(_) => {
                    return Err(Error::Protocol(
                        "unexpected response to START_REPLICATION".to_string(),
                    ));
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: String,
    pub dbname: Option<String>,
}

/// Builds an error from the code (`C`) and message (`M`) fields of an
/// ErrorResponse.
fn database_error(body: &backend::ErrorResponseBody) -> Error {
    let mut code = String::new();
    let mut message = String::new();
    let mut fields = body.fields();
    while let Ok(Some(field)) = fields.next() {
        match field.type_() {
            b'C' => code = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            b'M' => message = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            _ => {}
        }
    }
    Error::Database { code, message }
}

/// Messages the server sends inside the CopyBoth stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationMessage {
    XLogData {
        wal_start: u64,
        wal_end: u64,
        server_time: i64,
        data: Bytes,
    },
    Keepalive {
        wal_end: u64,
        server_time: i64,
        reply_requested: bool,
    },
}

impl ReplicationMessage {
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidMessage {
                message: "Empty message".to_string(),
            });
        }

        let tag = data.get_u8();
        match tag {
            b'w' => {
                if data.remaining() < 24 {
                    return Err(Error::InvalidMessage {
                        message: "Invalid XLogData header size".to_string(),
                    });
                }
                let wal_start = data.get_u64();
                let wal_end = data.get_u64();
                let server_time = data.get_i64();
                Ok(ReplicationMessage::XLogData {
                    wal_start,
                    wal_end,
                    server_time,
                    data,
                })
            }
            b'k' => {
                if data.remaining() < 17 {
                    return Err(Error::InvalidMessage {
                        message: "Invalid keepalive message size".to_string(),
                    });
                }
                Ok(ReplicationMessage::Keepalive {
                    wal_end: data.get_u64(),
                    server_time: data.get_i64(),
                    reply_requested: data.get_u8() != 0,
                })
            }
            _ => Err(Error::InvalidMessage {
                message: format!("Unknown message tag: {}", tag as char),
            }),
        }
    }
}

/// Standby status update reporting `lsn` as written, flushed and applied.
pub(crate) fn encode_status_update(lsn: u64, now_unix_micros: i64, reply: bool) -> BytesMut {
    let mut payload = BytesMut::with_capacity(34);
    payload.put_u8(b'r');
    payload.put_u64(lsn);
    payload.put_u64(lsn);
    payload.put_u64(lsn);
    payload.put_i64(now_unix_micros - PG_EPOCH_OFFSET_MICROS);
    payload.put_u8(u8::from(reply));
    payload
}

/// The streaming half of a replication connection.
pub struct ReplicationStream {
    conn: ReplicationConnection,
}

impl ReplicationStream {
    /// Next message, or `None` once the server ended the stream.
    ///
    /// Cancel safe: partially received messages stay buffered.
    pub async fn next_message(&mut self) -> Result<Option<ReplicationMessage>> {
        loop {
            match self.conn.read_message().await? {
                Message::CopyData(body) => {
                    return ReplicationMessage::parse(body.into_bytes()).map(Some);
                }
                Message::CopyDone => return Ok(None),
                Message::ErrorResponse(body) => return Err(database_error(&body)),
                Message::NoticeResponse(_) | Message::ParameterStatus(_) => {}
                _ => {
                    return Err(Error::Protocol(
                        "unexpected message in replication stream".to_string(),
                    ));
                }
            }
        }
    }

    pub async fn send_status_update(&mut self, lsn: u64) -> Result<()> {
        let payload = encode_status_update(lsn, chrono::Utc::now().timestamp_micros(), false);
        let mut buf = BytesMut::new();
        frontend::CopyData::new(&payload[..])?.write(&mut buf);
        self.conn.send(&buf).await?;
        debug!(lsn = %format_lsn(lsn), "Sent standby status update");
        Ok(())
    }

    pub async fn close(mut self) {
        let mut buf = BytesMut::new();
        frontend::copy_done(&mut buf);
        frontend::terminate(&mut buf);
        if let Err(e) = self.conn.send(&buf).await {
            warn!(error = %e, "Failed to end replication stream cleanly");
        }
        let _ = self.conn.stream.shutdown().await;
    }
}
