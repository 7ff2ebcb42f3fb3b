//! Builders for `pgoutput` messages used by the decoder and listener tests.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::connection::{ReplicationConnection, ReplicationStream};

/// One column of a mocked TupleData block.
#[derive(Debug, Clone)]
pub enum MockValue {
    Null,
    Unchanged,
    Text(String),
    Binary(Vec<u8>),
}

pub fn text(value: &str) -> MockValue {
    MockValue::Text(value.to_string())
}

#[derive(Debug, Clone)]
struct MockRelation {
    schema: String,
    table: String,
    columns: Vec<(String, u32, bool)>,
}

/// Produces pgoutput payloads (without the XLogData header).
pub struct MockMessageBuilder {
    timestamp: i64,
    relations: HashMap<u32, MockRelation>,
}

impl Default for MockMessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            // 2023-10-15 10:30:00 UTC, microseconds since 2000-01-01
            timestamp: 750_681_000_000_000,
            relations: HashMap::new(),
        }
    }

    pub fn add_relation(
        mut self,
        id: u32,
        schema: &str,
        table: &str,
        columns: Vec<(&str, u32, bool)>,
    ) -> Self {
        self.relations.insert(
            id,
            MockRelation {
                schema: schema.to_string(),
                table: table.to_string(),
                columns: columns
                    .into_iter()
                    .map(|(name, type_id, is_key)| (name.to_string(), type_id, is_key))
                    .collect(),
            },
        );
        self
    }

    pub fn begin(&self, final_lsn: u64, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(final_lsn);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit(&self, commit_lsn: u64, end_lsn: u64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(commit_lsn);
        buf.put_u64(end_lsn);
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    pub fn relation(&self, id: u32) -> Bytes {
        let relation = &self.relations[&id];
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(id);
        put_cstr(&mut buf, &relation.schema);
        put_cstr(&mut buf, &relation.table);
        buf.put_u8(b'd');
        buf.put_u16(relation.columns.len() as u16);
        for (name, type_id, is_key) in &relation.columns {
            buf.put_u8(u8::from(*is_key));
            put_cstr(&mut buf, name);
            buf.put_u32(*type_id);
            buf.put_i32(-1);
        }
        buf.freeze()
    }

    pub fn insert(&self, id: u32, values: &[MockValue]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, values);
        buf.freeze()
    }

    /// `old` is sent as a key tuple (`K`) when given.
    pub fn update(&self, id: u32, old: Option<&[MockValue]>, new: &[MockValue]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(id);
        if let Some(old) = old {
            buf.put_u8(b'K');
            put_tuple(&mut buf, old);
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, new);
        buf.freeze()
    }

    /// Update carrying the full old row (`REPLICA IDENTITY FULL`).
    pub fn update_full(&self, id: u32, old: &[MockValue], new: &[MockValue]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(id);
        buf.put_u8(b'O');
        put_tuple(&mut buf, old);
        buf.put_u8(b'N');
        put_tuple(&mut buf, new);
        buf.freeze()
    }

    pub fn delete(&self, id: u32, keys: &[MockValue]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(id);
        buf.put_u8(b'K');
        put_tuple(&mut buf, keys);
        buf.freeze()
    }

    pub fn truncate(&self, ids: &[u32]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(ids.len() as u32);
        buf.put_u8(0);
        for id in ids {
            buf.put_u32(*id);
        }
        buf.freeze()
    }

    /// Wraps a payload in an XLogData (`w`) header.
    pub fn xlog(&self, wal_start: u64, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(wal_start);
        buf.put_u64(wal_start);
        buf.put_i64(self.timestamp);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn keepalive(&self, wal_end: u64, reply_requested: bool) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(wal_end);
        buf.put_i64(self.timestamp);
        buf.put_u8(u8::from(reply_requested));
        buf.freeze()
    }
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[MockValue]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            MockValue::Null => buf.put_u8(b'n'),
            MockValue::Unchanged => buf.put_u8(b'u'),
            MockValue::Text(text) => {
                buf.put_u8(b't');
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            MockValue::Binary(data) => {
                buf.put_u8(b'b');
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
        }
    }
}

/// Server half of a loopback replication connection, driven by the test.
pub struct ScriptedServer {
    stream: TcpStream,
}

/// A client connection (past startup) wired to a scripted server.
pub async fn replication_pair() -> (ReplicationConnection, ScriptedServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (server, _) = accepted.unwrap();
    (
        ReplicationConnection::from_stream(client.unwrap()),
        ScriptedServer { stream: server },
    )
}

/// A connection already switched into CopyBoth mode.
pub async fn streaming_pair() -> (ReplicationStream, ScriptedServer) {
    let (conn, mut server) = replication_pair().await;
    let (stream, _) = tokio::join!(
        conn.start_replication("test_slot", 0, "test_pub", 1),
        async {
            server.expect_query().await;
            server.send_copy_both().await;
        }
    );
    (stream.unwrap(), server)
}

impl ScriptedServer {
    async fn send(&mut self, tag: u8, body: &[u8]) {
        let mut buf = BytesMut::new();
        buf.put_u8(tag);
        buf.put_i32(body.len() as i32 + 4);
        buf.put_slice(body);
        self.stream.write_all(&buf).await.unwrap();
    }

    /// Next frontend frame, or `None` once the client hung up.
    pub async fn read_frame(&mut self) -> Option<(u8, Bytes)> {
        let tag = self.stream.read_u8().await.ok()?;
        let len = self.stream.read_i32().await.ok()?;
        let mut body = vec![0; len as usize - 4];
        self.stream.read_exact(&mut body).await.ok()?;
        Some((tag, Bytes::from(body)))
    }

    /// Reads a simple query and returns its SQL.
    pub async fn expect_query(&mut self) -> String {
        let (tag, body) = self.read_frame().await.unwrap();
        assert_eq!(tag, b'Q');
        String::from_utf8_lossy(&body[..body.len() - 1]).into_owned()
    }

    /// CopyBothResponse with text format and no columns.
    pub async fn send_copy_both(&mut self) {
        self.send(b'W', &[0, 0, 0]).await;
    }

    pub async fn send_error(&mut self, code: &str, message: &str) {
        let mut body = BytesMut::new();
        body.put_u8(b'S');
        put_cstr(&mut body, "ERROR");
        body.put_u8(b'C');
        put_cstr(&mut body, code);
        body.put_u8(b'M');
        put_cstr(&mut body, message);
        body.put_u8(0);
        self.send(b'E', &body).await;
    }

    pub async fn send_copy_data(&mut self, payload: &[u8]) {
        self.send(b'd', payload).await;
    }

    pub async fn send_copy_done(&mut self) {
        self.send(b'c', &[]).await;
    }

    /// LSN of the next standby status update, skipping other frames.
    /// `None` when the client closed without sending one.
    pub async fn next_status_update(&mut self) -> Option<u64> {
        while let Some((tag, mut body)) = self.read_frame().await {
            if tag == b'd' && body.first() == Some(&b'r') {
                body.advance(1);
                return Some(body.get_u64());
            }
        }
        None
    }
}
