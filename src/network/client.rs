//! Replicator Client
//!
//! Buffers rows in memory and ships them to the collector from a background
//! task. `log` never blocks on the network: rows are appended to a per-stream
//! buffer, and a full buffer drops rows instead of waiting.
//!
//! Shipped batches stay in memory until the collector acknowledges them, and a
//! resent batch keeps its first message ids so the collector can skip what
//! it already stored.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use uuid::Uuid;

use super::protocol::{Message, WireMessage};
use super::{read_message, write_message, Component};
use crate::backend::{AvailabilityReport, LogBackend, LogRecord};
use crate::codec::LogId;
use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// Upper bound on payload bytes in one `Append`
const MAX_BATCH_BYTES: usize = 8 * 1024 * 1024;

/// Outcome of draining the buffer to the collector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Messages acknowledged by the collector
    pub acknowledged: usize,
    /// Messages the collector refused and that were discarded
    pub rejected: usize,
    /// Messages still held for a later attempt
    pub retained: usize,
    /// Last transport or protocol error, if the drain stopped early
    pub error: Option<String>,
}

impl SyncReport {
    /// Everything handed to the collector was stored
    pub fn is_complete(&self) -> bool {
        self.retained == 0 && self.rejected == 0 && self.error.is_none()
    }
}

enum Command {
    Flush(Option<oneshot::Sender<SyncReport>>),
    Stop(oneshot::Sender<SyncReport>),
}

/// State shared between callers and the sender task
struct Shared {
    session_id: Uuid,
    client_hostname: String,
    capacity: usize,
    buffer: Mutex<HashMap<(LogId, u16), BytesMut>>,
    /// Bytes in `buffer`, used to trigger an early send
    buffered_bytes: AtomicUsize,
    /// Bytes buffered or awaiting acknowledgment, reserved before buffering
    in_memory_bytes: AtomicUsize,
    available: AtomicBool,
    last_report: Mutex<AvailabilityReport>,
    dropped: AtomicU64,
}

impl Shared {
    fn set_availability(&self, report: AvailabilityReport) {
        let was = self.available.swap(report.available, Ordering::SeqCst);
        if was != report.available {
            tracing::info!(
                free_bytes = report.free_bytes,
                required_bytes = report.required_bytes,
                "Collector logging availability changed to {}",
                report.available
            );
        }
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = report;
    }

    /// Take everything buffered, one message per stream
    fn take(&self) -> Vec<WireMessage> {
        let drained: Vec<_> = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            self.buffered_bytes.store(0, Ordering::SeqCst);
            buffer.drain().collect()
        };

        drained
            .into_iter()
            .map(|((log_id, version), payload)| WireMessage::new(version, &log_id, payload.to_vec()))
            .collect()
    }
}

/// A batch awaiting acknowledgment
struct Batch {
    first_message_id: u64,
    records: Vec<WireMessage>,
    bytes: usize,
}

impl Batch {
    fn last_message_id(&self) -> u64 {
        self.first_message_id + self.records.len() as u64 - 1
    }
}

enum Outcome {
    Acked,
    Refused,
    Rejected(String),
}

/// Client side of the replication link
pub struct ReplicatorClient {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicatorClient {
    /// Start the client and its sender task. Must be called inside a tokio
    /// runtime.
    pub fn spawn(config: &ClientConfig, client_hostname: impl Into<String>) -> Self {
        let shared = Arc::new(Shared {
            session_id: Uuid::new_v4(),
            client_hostname: client_hostname.into(),
            capacity: config.buffer_capacity_bytes,
            buffer: Mutex::new(HashMap::new()),
            buffered_bytes: AtomicUsize::new(0),
            in_memory_bytes: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            last_report: Mutex::new(AvailabilityReport::assume_available()),
            dropped: AtomicU64::new(0),
        });

        let (tx, rx) = mpsc::channel(64);
        let sender = Sender {
            shared: Arc::clone(&shared),
            address: config.collector_address.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            stream: None,
            pending: VecDeque::new(),
            next_message_id: 1,
        };

        tracing::info!(
            session = %shared.session_id,
            collector = %config.collector_address,
            "Replicator client started"
        );

        let task = tokio::spawn(sender.run(rx, config.flush_interval()));

        Self {
            shared,
            commands: tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    /// Buffer a record for shipping. Drops it if the buffer is full.
    pub fn log(&self, record: &LogRecord) {
        let len = record.payload.len();
        let capacity = self.shared.capacity;
        let reserved = self.shared.in_memory_bytes.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |in_memory| {
                in_memory
                    .checked_add(len)
                    .filter(|&total| total <= capacity)
            },
        );

        if reserved.is_err() {
            let dropped = self.shared.dropped.fetch_add(1, Ordering::SeqCst) + 1;
            if dropped == 1 || dropped % 1000 == 0 {
                tracing::warn!(
                    "Replication buffer full ({} bytes), {} rows dropped so far",
                    self.shared.capacity,
                    dropped
                );
            }
            return;
        }

        let buffered = {
            let mut buffer = self.shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer
                .entry((record.log_id.clone(), record.protocol_version))
                .or_default()
                .extend_from_slice(&record.payload);
            self.shared.buffered_bytes.fetch_add(len, Ordering::SeqCst) + len
        };

        if buffered >= MAX_BATCH_BYTES {
            self.send_async();
        }
    }

    /// Ask the sender task to ship what is buffered without waiting for it
    pub fn send_async(&self) {
        match self.commands.try_send(Command::Flush(None)) {
            // A full queue already has a flush coming
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Replicator client is stopped; rows stay buffered");
            }
        }
    }

    /// Ship everything buffered and wait for the collector's reply. Also
    /// refreshes availability when there is nothing to send.
    pub async fn sync_memory(&self) -> Result<SyncReport> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(Some(tx)))
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Drain once more and stop the sender task
    pub async fn stop(&self) -> Result<SyncReport> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop(tx))
            .await
            .map_err(|_| Error::ShuttingDown)?;
        let report = rx.await.map_err(|_| Error::ShuttingDown)?;

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Internal(format!("Sender task failed: {}", e)))?;
        }
        Ok(report)
    }

    /// Availability as of the last completed round trip
    pub fn is_logging_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    pub fn availability_report(&self) -> AvailabilityReport {
        *self
            .shared
            .last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Rows dropped because the buffer was full
    pub fn dropped_rows(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    /// Payload bytes held in memory, buffered or awaiting acknowledgment
    pub fn buffered_bytes(&self) -> usize {
        self.shared.in_memory_bytes.load(Ordering::SeqCst)
    }
}

impl LogBackend for ReplicatorClient {
    fn name(&self) -> &str {
        "network"
    }

    fn log(&self, record: &LogRecord, _now: DateTime<Utc>) -> Result<()> {
        ReplicatorClient::log(self, record);
        Ok(())
    }

    fn is_logging_available(&self) -> bool {
        ReplicatorClient::is_logging_available(self)
    }

    fn availability_report(&self) -> AvailabilityReport {
        ReplicatorClient::availability_report(self)
    }
}

#[async_trait]
impl Component for ReplicatorClient {
    fn name(&self) -> &str {
        "replicator-client"
    }

    async fn stop(&self) -> Result<()> {
        let report = ReplicatorClient::stop(self).await?;
        if !report.is_complete() {
            tracing::warn!(
                "Replicator stopped with {} messages unsent: {}",
                report.retained,
                report.error.as_deref().unwrap_or("no error")
            );
        }
        Ok(())
    }
}

/// Background sender owned by the client task
struct Sender {
    shared: Arc<Shared>,
    address: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    stream: Option<TcpStream>,
    pending: VecDeque<Batch>,
    next_message_id: u64,
}

impl Sender {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, flush_interval: Duration) {
        let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Flush(reply)) => {
                            let report = self.drain().await;
                            if let Some(reply) = reply {
                                let _ = reply.send(report);
                            }
                        }
                        Some(Command::Stop(reply)) => {
                            let report = self.drain().await;
                            let _ = reply.send(report);
                            break;
                        }
                        None => {
                            // Client dropped without stop
                            self.drain().await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.drain().await;
                }
            }
        }

        tracing::debug!(session = %self.shared.session_id, "Replicator sender stopped");
    }

    /// Move buffered rows into numbered batches
    fn seal(&mut self) {
        let records = self.shared.take();
        if records.is_empty() {
            return;
        }

        let mut batch: Vec<WireMessage> = Vec::new();
        let mut batch_bytes = 0usize;

        for record in records {
            let len = record.payload.len();
            if !batch.is_empty() && batch_bytes + len > MAX_BATCH_BYTES {
                self.push_batch(std::mem::take(&mut batch), batch_bytes);
                batch_bytes = 0;
            }
            batch_bytes += len;
            batch.push(record);
        }
        self.push_batch(batch, batch_bytes);
    }

    fn push_batch(&mut self, records: Vec<WireMessage>, bytes: usize) {
        let first_message_id = self.next_message_id;
        self.next_message_id += records.len() as u64;
        self.pending.push_back(Batch {
            first_message_id,
            records,
            bytes,
        });
    }

    fn release(&mut self, batch: Batch) {
        self.shared
            .in_memory_bytes
            .fetch_sub(batch.bytes, Ordering::SeqCst);
    }

    async fn drain(&mut self) -> SyncReport {
        self.seal();
        let mut report = SyncReport::default();

        if self.pending.is_empty() {
            if let Err(e) = self.refresh_status().await {
                tracing::debug!("Status request to {} failed: {}", self.address, e);
                report.error = Some(e.to_string());
            }
            return report;
        }

        while let Some(batch) = self.pending.pop_front() {
            let count = batch.records.len();
            match self.send_batch(&batch).await {
                Ok(Outcome::Acked) => {
                    report.acknowledged += count;
                    self.release(batch);
                }
                Ok(Outcome::Rejected(reason)) => {
                    let e = Error::Rejected(reason);
                    tracing::error!("Dropping {} messages: {}", count, e);
                    report.rejected += count;
                    report.error = Some(e.to_string());
                    self.release(batch);
                }
                Ok(Outcome::Refused) => {
                    self.pending.push_front(batch);
                    report.error = Some("Collector could not store the batch".into());
                    break;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!("Shipping to {} failed, will retry: {}", self.address, e);
                    } else {
                        tracing::error!("Shipping to {} failed: {}", self.address, e);
                    }
                    self.pending.push_front(batch);
                    self.stream = None;
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        report.retained = self.pending.iter().map(|b| b.records.len()).sum();
        report
    }

    async fn send_batch(&mut self, batch: &Batch) -> Result<Outcome> {
        let request = Message::Append {
            session_id: self.shared.session_id,
            client_hostname: self.shared.client_hostname.clone(),
            first_message_id: batch.first_message_id,
            records: batch.records.clone(),
        };

        match self.request(&request).await? {
            Message::Ack {
                acknowledged,
                last_message_id,
                availability,
            } => {
                self.shared.set_availability(availability);
                if !acknowledged {
                    return Ok(Outcome::Refused);
                }
                if last_message_id < batch.last_message_id() {
                    return Err(Error::Protocol(format!(
                        "Ack for {} does not cover batch ending at {}",
                        last_message_id,
                        batch.last_message_id()
                    )));
                }
                Ok(Outcome::Acked)
            }
            Message::Rejected { reason } => Ok(Outcome::Rejected(reason)),
            Message::Error { code, message } => Err(Error::Protocol(format!(
                "Collector error {:?}: {}",
                code, message
            ))),
            other => Err(Error::Protocol(format!(
                "Unexpected reply {}",
                other.type_name()
            ))),
        }
    }

    async fn refresh_status(&mut self) -> Result<()> {
        match self.request(&Message::StatusRequest).await {
            Ok(Message::StatusResponse { availability, .. }) => {
                self.shared.set_availability(availability);
                Ok(())
            }
            Ok(other) => Err(Error::Protocol(format!(
                "Unexpected reply {}",
                other.type_name()
            ))),
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    /// One request/response on the shared connection, reconnecting if needed
    async fn request(&mut self, message: &Message) -> Result<Message> {
        if self.stream.is_none() {
            self.stream = Some(self.connect().await?);
        }
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(Error::Internal("No collector connection".into())),
        };

        let exchange = async {
            write_message(&mut *stream, message).await?;
            read_message(&mut *stream).await
        };

        match timeout(self.request_timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                self.stream = None;
                Err(e)
            }
            Err(_) => {
                self.stream = None;
                Err(Error::ConnectionTimeout(self.address.clone()))
            }
        }
    }

    /// Connect to the collector
    async fn connect(&self) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(&self.address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                tracing::debug!("Connected to collector {}", self.address);
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PROTOCOL_VERSION;
    use crate::bucket::TimeBucketer;
    use crate::clock::ManualClock;
    use crate::codec::TypeTag;
    use crate::config::{Compression, DiskConfig};
    use crate::disk::{DiskBackend, FixedProbe};
    use crate::network::{CollectorServer, ControlState};
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    fn record(payload: &[u8]) -> LogRecord {
        let log_id = LogId::new(
            "clicks",
            "click",
            "web-1",
            BTreeMap::new(),
            vec!["url".into()],
            vec![TypeTag::String.into()],
        )
        .unwrap();
        LogRecord {
            protocol_version: PROTOCOL_VERSION,
            log_id,
            payload: payload.to_vec(),
        }
    }

    fn client_config(address: String) -> ClientConfig {
        ClientConfig {
            enabled: true,
            collector_address: address,
            flush_interval_ms: 60_000,
            connect_timeout_ms: 500,
            request_timeout_ms: 2_000,
            ..ClientConfig::default()
        }
    }

    async fn collector(dir: &Path, probe: Arc<FixedProbe>) -> (Arc<CollectorServer>, String) {
        let config = DiskConfig {
            base_dir: dir.join("logs"),
            filename_pattern: "{LOG_TYPE}-{CLIENT_HOST}".into(),
            compression: Compression::None,
            required_free_space_bytes: 100,
            ..DiskConfig::default()
        };
        let disk = DiskBackend::new(&config, TimeBucketer::new(12).unwrap(), "collector-1")
            .unwrap()
            .with_probe(probe);
        let control = ControlState::load(dir.join("control.json"), 16).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap(),
        ));
        let server = Arc::new(CollectorServer::new(
            "127.0.0.1:0",
            "collector-1",
            Arc::new(disk),
            control,
            clock,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task_server = Arc::clone(&server);
        tokio::spawn(async move { task_server.serve(listener).await });
        (server, addr)
    }

    fn stored(server: &CollectorServer) -> Vec<u8> {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap();
        let path = server.disk().path_for(&record(b"").log_id, now).unwrap();
        fs::read(path).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_rows_reach_collector() {
        let dir = tempdir().unwrap();
        let (server, addr) = collector(dir.path(), Arc::new(FixedProbe::new(1000))).await;
        let client = ReplicatorClient::spawn(&client_config(addr), "web-1");

        client.log(&record(b"a;"));
        client.log(&record(b"b;"));
        let report = client.sync_memory().await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.acknowledged, 1);
        assert_eq!(stored(&server), b"a;b;");
        assert_eq!(client.buffered_bytes(), 0);

        client.stop().await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_async_then_sync() {
        let dir = tempdir().unwrap();
        let (server, addr) = collector(dir.path(), Arc::new(FixedProbe::new(1000))).await;
        let client = ReplicatorClient::spawn(&client_config(addr), "web-1");

        client.log(&record(b"x;"));
        client.send_async();
        // Commands are handled in order, so the sync observes the send
        client.sync_memory().await.unwrap();
        assert_eq!(stored(&server), b"x;");

        client.stop().await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_availability_lags_one_round_trip() {
        let dir = tempdir().unwrap();
        let probe = Arc::new(FixedProbe::new(1000));
        let (server, addr) = collector(dir.path(), probe.clone()).await;
        let client = ReplicatorClient::spawn(&client_config(addr), "web-1");

        assert!(client.is_logging_available());

        probe.set(10);
        // Not observed until a round trip completes
        assert!(client.is_logging_available());
        client.log(&record(b"a;"));
        client.sync_memory().await.unwrap();
        assert!(!client.is_logging_available());
        assert_eq!(client.availability_report().free_bytes, 10);

        probe.set(1000);
        assert!(!client.is_logging_available());
        // An empty buffer still refreshes through a status request
        client.sync_memory().await.unwrap();
        assert!(client.is_logging_available());

        client.stop().await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_collector_retains_rows() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = ReplicatorClient::spawn(&client_config(addr), "web-1");
        client.log(&record(b"a;"));
        let report = client.sync_memory().await.unwrap();

        assert_eq!(report.retained, 1);
        assert!(report.error.is_some());
        assert_eq!(client.buffered_bytes(), 2);
        // Nothing observed, so the last known value stands
        assert!(client.is_logging_available());
    }

    #[tokio::test]
    async fn test_retry_after_collector_comes_up() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = ReplicatorClient::spawn(&client_config(addr.clone()), "web-1");
        client.log(&record(b"a;"));
        assert_eq!(client.sync_memory().await.unwrap().retained, 1);
        client.log(&record(b"b;"));

        // Bring a collector up on the same port
        let config = DiskConfig {
            base_dir: dir.path().join("logs"),
            filename_pattern: "{LOG_TYPE}-{CLIENT_HOST}".into(),
            compression: Compression::None,
            required_free_space_bytes: 0,
            ..DiskConfig::default()
        };
        let disk = DiskBackend::new(&config, TimeBucketer::new(12).unwrap(), "c").unwrap();
        let server = Arc::new(CollectorServer::new(
            addr.clone(),
            "c",
            Arc::new(disk),
            ControlState::load(dir.path().join("control.json"), 16).unwrap(),
            Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap(),
            )),
        ));
        let listener = TcpListener::bind(&addr).await.unwrap();
        let task_server = Arc::clone(&server);
        tokio::spawn(async move { task_server.serve(listener).await });

        let report = client.sync_memory().await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.acknowledged, 2);
        // Older batch first
        assert_eq!(stored(&server), b"a;b;");

        client.stop().await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_full_buffer_drops_rows() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = ClientConfig {
            buffer_capacity_bytes: 4,
            ..client_config(addr)
        };
        let client = ReplicatorClient::spawn(&config, "web-1");

        client.log(&record(b"ab"));
        client.log(&record(b"cd"));
        client.log(&record(b"ef"));

        assert_eq!(client.dropped_rows(), 1);
        assert_eq!(client.buffered_bytes(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_producers_never_exceed_capacity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = ClientConfig {
            buffer_capacity_bytes: 100,
            ..client_config(addr)
        };
        let client = Arc::new(ReplicatorClient::spawn(&config, "web-1"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = Arc::clone(&client);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        client.log(&record(b"x"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(client.buffered_bytes(), 100);
        assert_eq!(client.dropped_rows(), 300);
    }

    #[tokio::test]
    async fn test_stop_drains_buffer() {
        let dir = tempdir().unwrap();
        let (server, addr) = collector(dir.path(), Arc::new(FixedProbe::new(1000))).await;
        let client = ReplicatorClient::spawn(&client_config(addr), "web-1");

        client.log(&record(b"last;"));
        let report = client.stop().await.unwrap();

        assert_eq!(report.acknowledged, 1);
        assert_eq!(stored(&server), b"last;");
        assert!(matches!(client.sync_memory().await, Err(Error::ShuttingDown)));

        server.shutdown();
    }
}
