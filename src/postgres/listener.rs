//! Replication listener: streams `pgoutput` changes from a logical slot and
//! hands each committed transaction to the consumer, one at a time.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::connection::{ReplicationConnection, ReplicationMessage, ReplicationStream};
use super::decoder::{DecodedMessage, PgOutputDecoder};
use super::types::format_lsn;
use crate::config::PostgresConfig;
use crate::queue::AsyncQueue;
use crate::sync::Subscription;
use crate::types::{split_key_changes, Ack, TableOperation, Transaction};
use crate::{Error, Result};

/// A transaction assembled from Begin..Commit.
#[derive(Debug)]
pub struct CommittedTransaction {
    pub xid: u32,
    pub end_lsn: u64,
    pub operations: Vec<TableOperation>,
}

struct OpenTransaction {
    xid: u32,
    final_lsn: u64,
    operations: Vec<TableOperation>,
}

/// Groups decoded messages into transactions.
#[derive(Default)]
pub struct TransactionAssembler {
    current: Option<OpenTransaction>,
}

impl TransactionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction(&self) -> bool {
        self.current.is_some()
    }

    pub fn push(&mut self, message: DecodedMessage) -> Result<Option<CommittedTransaction>> {
        match message {
            DecodedMessage::Begin { final_lsn, xid, .. } => {
                if let Some(open) = &self.current {
                    return Err(Error::Protocol(format!(
                        "BEGIN for xid {} while xid {} is still open",
                        xid, open.xid
                    )));
                }
                self.current = Some(OpenTransaction {
                    xid,
                    final_lsn,
                    operations: Vec::new(),
                });
                Ok(None)
            }
            DecodedMessage::Change(operation) => match &mut self.current {
                Some(open) => {
                    open.operations.push(operation);
                    Ok(None)
                }
                None => Err(Error::Protocol(format!(
                    "{} on {} outside of a transaction",
                    operation.kind(),
                    operation.table_ref()
                ))),
            },
            DecodedMessage::Commit {
                commit_lsn,
                end_lsn,
                ..
            } => {
                let open = self.current.take().ok_or_else(|| {
                    Error::Protocol("COMMIT without a matching BEGIN".to_string())
                })?;
                if open.final_lsn != commit_lsn {
                    return Err(Error::Protocol(format!(
                        "COMMIT LSN {} does not match BEGIN LSN {}",
                        format_lsn(commit_lsn),
                        format_lsn(open.final_lsn)
                    )));
                }
                Ok(Some(CommittedTransaction {
                    xid: open.xid,
                    end_lsn,
                    operations: split_key_changes(open.operations),
                }))
            }
            DecodedMessage::Truncate { tables } => {
                let names: Vec<String> = tables.iter().map(ToString::to_string).collect();
                warn!(tables = ?names, "Ignoring TRUNCATE");
                Ok(None)
            }
            DecodedMessage::Relation(_) => Ok(None),
        }
    }
}

pub struct PgReplicationListener {
    config: PostgresConfig,
    queue_capacity: usize,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PgReplicationListener {
    pub fn new(config: PostgresConfig, queue_capacity: usize, cancel: CancellationToken) -> Self {
        Self {
            config,
            queue_capacity,
            cancel,
            task: Mutex::new(None),
        }
    }

    /// Connects, starts streaming from the slot's confirmed position and
    /// returns the transaction subscription.
    pub async fn start(&self) -> Result<Subscription> {
        let mut conn = ReplicationConnection::connect(&self.config).await?;
        let system = conn.identify_system().await?;
        info!(
            system_id = %system.system_id,
            timeline = system.timeline,
            xlogpos = %system.xlogpos,
            "Connected for replication"
        );

        let stream = conn
            .start_replication(
                &self.config.slot_name,
                0,
                &self.config.publication,
                self.config.proto_version,
            )
            .await?;
        info!(
            slot = %self.config.slot_name,
            publication = %self.config.publication,
            "Replication started"
        );

        let queue = Arc::new(AsyncQueue::bounded(self.queue_capacity, self.cancel.child_token()));
        let reader = Reader {
            stream,
            queue: queue.clone(),
            cancel: self.cancel.clone(),
            status_interval: Duration::from_secs(self.config.status_interval_secs.max(1)),
            decoder: PgOutputDecoder::new(),
            assembler: TransactionAssembler::new(),
            last_ack: 0,
        };
        let handle = tokio::spawn(reader.run());
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(Subscription::new(queue))
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
            debug!("Replication reader stopped");
        }
    }
}

impl Drop for PgReplicationListener {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Reader {
    stream: ReplicationStream,
    queue: Arc<AsyncQueue<Result<Transaction>>>,
    cancel: CancellationToken,
    status_interval: Duration,
    decoder: PgOutputDecoder,
    assembler: TransactionAssembler,
    last_ack: u64,
}

enum Step {
    Continue,
    Stop,
}

impl Reader {
    async fn run(mut self) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.stream.next_message() => message,
            };

            let step = match message {
                Ok(Some(message)) => self.handle(message).await,
                Ok(None) => Err(Error::Connection("replication stream ended".to_string())),
                Err(e) => Err(e),
            };

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => {
                    self.queue.abort();
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Replication stream failed");
                    self.queue.enqueue(Err(e));
                    break;
                }
            }
        }
        self.stream.close().await;
    }

    async fn handle(&mut self, message: ReplicationMessage) -> Result<Step> {
        match message {
            ReplicationMessage::XLogData { data, .. } => {
                let Some(decoded) = self.decoder.decode(&data)? else {
                    return Ok(Step::Continue);
                };
                match self.assembler.push(decoded)? {
                    Some(committed) => self.deliver(committed).await,
                    None => Ok(Step::Continue),
                }
            }
            ReplicationMessage::Keepalive {
                wal_end,
                reply_requested,
                ..
            } => {
                if reply_requested {
                    if !self.assembler.in_transaction() {
                        self.last_ack = self.last_ack.max(wal_end);
                    }
                    trace!(lsn = %format_lsn(self.last_ack), "Answering keepalive");
                    self.stream.send_status_update(self.last_ack).await?;
                }
                Ok(Step::Continue)
            }
        }
    }

    async fn deliver(&mut self, committed: CommittedTransaction) -> Result<Step> {
        let id = format_lsn(committed.end_lsn);
        if committed.operations.is_empty() {
            trace!(xid = committed.xid, lsn = %id, "Skipping empty transaction");
            self.last_ack = self.last_ack.max(committed.end_lsn);
            return Ok(Step::Continue);
        }

        if self.queue.ready().await.is_err() {
            return Ok(Step::Stop);
        }
        debug!(
            xid = committed.xid,
            lsn = %id,
            operations = committed.operations.len(),
            "Delivering transaction"
        );
        let (ack, rx) = Ack::channel();
        self.queue
            .enqueue(Ok(Transaction::new(id.clone(), committed.operations, ack)));

        if self.wait_for_ack(rx).await? {
            self.last_ack = committed.end_lsn;
            self.stream.send_status_update(committed.end_lsn).await?;
            Ok(Step::Continue)
        } else {
            warn!(lsn = %id, "Transaction was not consumed, stopping replication");
            Ok(Step::Stop)
        }
    }

    /// Waits for the consumer's answer, reporting the last acknowledged
    /// position periodically so the server keeps the connection.
    async fn wait_for_ack(&mut self, mut rx: oneshot::Receiver<bool>) -> Result<bool> {
        let mut ticker = interval_at(Instant::now() + self.status_interval, self.status_interval);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(false),
                consumed = &mut rx => return Ok(consumed.unwrap_or(false)),
                _ = ticker.tick() => {
                    self.stream.send_status_update(self.last_ack).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::test_utils::{
        streaming_pair, text, MockMessageBuilder, MockValue, ScriptedServer,
    };
    use crate::types::RowChange;

    fn decode_all(messages: &[bytes::Bytes]) -> Vec<Result<Option<CommittedTransaction>>> {
        let mut decoder = PgOutputDecoder::new();
        let mut assembler = TransactionAssembler::new();
        messages
            .iter()
            .filter_map(|m| match decoder.decode(m) {
                Ok(Some(decoded)) => Some(assembler.push(decoded)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            })
            .collect()
    }

    fn builder() -> MockMessageBuilder {
        MockMessageBuilder::new().add_relation(
            1,
            "public",
            "accounts",
            vec![("id", 23, true), ("balance", 20, false)],
        )
    }

    #[test]
    fn test_assembles_transaction() {
        let b = builder();
        let results = decode_all(
            &[
                b.relation(1),
                b.begin(0x100, 7),
                b.insert(1, &[text("1"), text("10")]),
                b.update(1, None, &[text("1"), text("20")]),
                b.commit(0x100, 0x180),
            ],
        );
        let committed: Vec<_> = results
            .into_iter()
            .filter_map(|r| r.unwrap())
            .collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].xid, 7);
        assert_eq!(committed[0].end_lsn, 0x180);
        assert_eq!(committed[0].operations.len(), 2);
    }

    #[test]
    fn test_splits_key_changing_updates() {
        let b = builder();
        let old = [text("1"), MockValue::Null];
        let results = decode_all(
            &[
                b.relation(1),
                b.begin(0x100, 7),
                b.update(1, Some(&old), &[text("2"), text("20")]),
                b.commit(0x100, 0x180),
            ],
        );
        let committed = results.into_iter().filter_map(|r| r.unwrap()).next().unwrap();
        assert_eq!(committed.operations.len(), 2);
        assert!(matches!(committed.operations[0].change, RowChange::Insert { .. }));
        match &committed.operations[1].change {
            RowChange::Delete { old_keys } => assert_eq!(old_keys["id"], 1),
            other => panic!("expected delete, got {:?}", other),
        }
    }

    #[test]
    fn test_change_outside_transaction_is_error() {
        let b = builder();
        let results = decode_all(&[b.relation(1), b.insert(1, &[text("1"), text("1")])]);
        assert!(matches!(results.last(), Some(Err(Error::Protocol(_)))));
    }

    #[test]
    fn test_commit_lsn_mismatch_is_error() {
        let b = builder();
        let results = decode_all(&[b.begin(0x100, 1), b.commit(0x200, 0x280)]);
        assert!(matches!(results.last(), Some(Err(Error::Protocol(_)))));
    }

    #[test]
    fn test_nested_begin_is_error() {
        let mut assembler = TransactionAssembler::new();
        let begin = |xid| DecodedMessage::Begin {
            final_lsn: 1,
            commit_time: 0,
            xid,
        };
        assert!(assembler.push(begin(1)).unwrap().is_none());
        assert!(assembler.in_transaction());
        assert!(assembler.push(begin(2)).is_err());
    }

    #[test]
    fn test_truncate_is_skipped() {
        let b = builder();
        let results = decode_all(
            &[b.relation(1), b.begin(0x10, 1), b.truncate(&[1]), b.commit(0x10, 0x20)],
        );
        let committed = results.into_iter().filter_map(|r| r.unwrap()).next().unwrap();
        assert!(committed.operations.is_empty());
    }

    async fn spawn_reader() -> (Subscription, ScriptedServer, JoinHandle<()>) {
        let (stream, server) = streaming_pair().await;
        let queue = Arc::new(AsyncQueue::bounded(4, CancellationToken::new()));
        let reader = Reader {
            stream,
            queue: queue.clone(),
            cancel: CancellationToken::new(),
            status_interval: Duration::from_secs(3600),
            decoder: PgOutputDecoder::new(),
            assembler: TransactionAssembler::new(),
            last_ack: 0,
        };
        let handle = tokio::spawn(reader.run());
        (Subscription::new(queue), server, handle)
    }

    async fn send_transaction(server: &mut ScriptedServer, b: &MockMessageBuilder) {
        for payload in [
            b.relation(1),
            b.begin(0x100, 7),
            b.insert(1, &[text("1"), text("10")]),
            b.commit(0x100, 0x180),
        ] {
            server.send_copy_data(&b.xlog(0x100, &payload)).await;
        }
    }

    #[tokio::test]
    async fn test_reader_confirms_commit_only_after_ack() {
        let (subscription, mut server, _handle) = spawn_reader().await;
        let b = builder();
        send_transaction(&mut server, &b).await;

        let transaction = subscription.next().await.unwrap().unwrap();
        assert_eq!(transaction.id, "0/180");
        assert_eq!(transaction.operations.len(), 1);

        // Nothing is confirmed while the consumer holds the transaction.
        let early = tokio::time::timeout(Duration::from_millis(100), server.read_frame()).await;
        assert!(early.is_err());

        transaction.ack.send(true);
        assert_eq!(server.next_status_update().await, Some(0x180));
    }

    #[tokio::test]
    async fn test_reader_stops_without_confirming_unconsumed_transaction() {
        for consumed in [Some(false), None] {
            let (subscription, mut server, handle) = spawn_reader().await;
            let b = builder();
            send_transaction(&mut server, &b).await;

            let transaction = subscription.next().await.unwrap().unwrap();
            match consumed {
                Some(answer) => transaction.ack.send(answer),
                None => drop(transaction),
            }

            assert!(subscription.next().await.is_none());
            assert_eq!(server.next_status_update().await, None);
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_keepalive_replies_only_when_requested() {
        let (_subscription, mut server, _handle) = spawn_reader().await;
        let b = builder();

        server.send_copy_data(&b.keepalive(0x100, false)).await;
        server.send_copy_data(&b.keepalive(0x80, true)).await;
        assert_eq!(server.next_status_update().await, Some(0x80));

        // Inside a transaction the server's position is not confirmed.
        server.send_copy_data(&b.xlog(0x200, &b.begin(0x200, 8))).await;
        server.send_copy_data(&b.keepalive(0x500, true)).await;
        assert_eq!(server.next_status_update().await, Some(0x80));
    }
}
