//! Collector Server
//!
//! Accepts shipping clients and writes their rows to the local disk backend.
//!
//! An `Append` is acknowledged only after every touched stream has been
//! flushed and fsynced and the session cursor has been persisted. Messages at
//! or below the cursor are skipped, so a client that resends after a lost ack
//! (or after a collector restart) does not produce duplicates.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use super::control::ControlState;
use super::protocol::{is_supported_version, ErrorCode, Message, WireMessage};
use super::{read_frame, write_message, Component, Frame};
use crate::backend::AvailabilityReport;
use crate::clock::Clock;
use crate::codec::LogId;
use crate::disk::DiskBackend;
use crate::error::{Error, Result};

/// State shared by every connection
struct ServerState {
    hostname: String,
    disk: Arc<DiskBackend>,
    control: Mutex<ControlState>,
    clock: Arc<dyn Clock>,
}

/// Network server that receives rows from replicating clients
pub struct CollectorServer {
    /// Bind address
    bind_address: String,
    state: Arc<ServerState>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl CollectorServer {
    /// Create a new collector server
    pub fn new(
        bind_address: impl Into<String>,
        hostname: impl Into<String>,
        disk: Arc<DiskBackend>,
        control: ControlState,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address: bind_address.into(),
            state: Arc::new(ServerState {
                hostname: hostname.into(),
                disk,
                control: Mutex::new(control),
                clock,
            }),
            shutdown: shutdown_tx,
        }
    }

    pub fn disk(&self) -> &Arc<DiskBackend> {
        &self.state.disk
    }

    /// Bind the configured address and serve until shut down
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shut down
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Collector listening on {}", local_addr);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let state = Arc::clone(&self.state);
                            let shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(state, socket, addr, shutdown).await {
                                    tracing::warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        if let Err(e) = self.state.disk.close_all() {
            tracing::error!("Failed to close bucket files: {}", e);
        }
        tracing::info!("Collector on {} stopped", local_addr);
        Ok(())
    }

    /// Signal the accept loop and open connections to stop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Process one request and produce its reply
    pub async fn handle_message(&self, message: Message) -> Message {
        self.state.handle(message).await
    }
}

#[async_trait]
impl Component for CollectorServer {
    fn name(&self) -> &str {
        "collector"
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown();
        self.state.disk.flush_all()
    }
}

/// Handle a single connection
async fn handle_connection(
    state: Arc<ServerState>,
    socket: TcpStream,
    peer_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = shutdown.changed() => break,
        };

        let response = match frame {
            Ok(Frame::Message(message)) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                state.handle(message).await
            }
            Ok(Frame::UnsupportedVersion(version)) => {
                tracing::warn!("Rejecting frame version {} from {}", version, peer_addr);
                Message::Rejected {
                    reason: Error::UnsupportedProtocolVersion(version).to_string(),
                }
            }
            Ok(Frame::Corrupt { code, reason }) => {
                tracing::warn!("Bad frame from {}: {}", peer_addr, reason);
                Message::Error {
                    code,
                    message: reason,
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading from {}: {}", peer_addr, e);
                break;
            }
        };

        write_message(&mut writer, &response).await?;
    }

    Ok(())
}

impl ServerState {
    async fn handle(&self, message: Message) -> Message {
        match message {
            Message::Append {
                session_id,
                client_hostname,
                first_message_id,
                records,
            } => {
                self.handle_append(session_id, client_hostname, first_message_id, records)
                    .await
            }
            Message::StatusRequest => Message::StatusResponse {
                server_hostname: self.hostname.clone(),
                availability: self.availability(),
            },
            other => Message::Error {
                code: ErrorCode::Unexpected,
                message: format!("Collector does not accept {}", other.type_name()),
            },
        }
    }

    fn availability(&self) -> AvailabilityReport {
        self.disk.availability_report()
    }

    fn ack(&self, acknowledged: bool, last_message_id: u64) -> Message {
        Message::Ack {
            acknowledged,
            last_message_id,
            availability: self.availability(),
        }
    }

    async fn handle_append(
        &self,
        session_id: Uuid,
        client_hostname: String,
        first_message_id: u64,
        records: Vec<WireMessage>,
    ) -> Message {
        if let Some(bad) = records
            .iter()
            .find(|r| !is_supported_version(r.protocol_version))
        {
            tracing::warn!(
                "Rejecting append from {} ({}): protocol version {}",
                client_hostname,
                session_id,
                bad.protocol_version
            );
            return Message::Rejected {
                reason: Error::UnsupportedProtocolVersion(bad.protocol_version).to_string(),
            };
        }

        let cursor = self.control.lock().await.last_acknowledged(&session_id);
        if records.is_empty() {
            return self.ack(true, cursor);
        }

        let last_message_id = match first_message_id.checked_add(records.len() as u64 - 1) {
            Some(id) if first_message_id > 0 => id,
            _ => {
                return Message::Error {
                    code: ErrorCode::Decode,
                    message: format!("Invalid first message id {}", first_message_id),
                }
            }
        };

        if last_message_id <= cursor {
            tracing::debug!(
                "Skipping redelivered messages {}..={} from {} ({})",
                first_message_id,
                last_message_id,
                client_hostname,
                session_id
            );
            return self.ack(true, cursor);
        }

        let now = self.clock.now();

        // Group fresh messages by stream, keeping arrival order within each
        let mut groups: Vec<(LogId, Vec<u8>)> = Vec::new();
        let mut index: HashMap<LogId, usize> = HashMap::new();
        let mut skipped = 0usize;

        for (offset, wire) in records.into_iter().enumerate() {
            let message_id = first_message_id + offset as u64;
            if message_id <= cursor {
                continue;
            }

            let record = match wire.into_record() {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(
                        "Dropping message {} from {} ({}): {}",
                        message_id,
                        client_hostname,
                        session_id,
                        e
                    );
                    skipped += 1;
                    continue;
                }
            };

            if let Err(e) = self.disk.path_for(&record.log_id, now) {
                tracing::error!(
                    "Dropping message {} for {} from {}: {}",
                    message_id,
                    record.log_id,
                    client_hostname,
                    e
                );
                skipped += 1;
                continue;
            }

            match index.get(&record.log_id) {
                Some(&i) => groups[i].1.extend_from_slice(&record.payload),
                None => {
                    index.insert(record.log_id.clone(), groups.len());
                    groups.push((record.log_id, record.payload));
                }
            }
        }

        let writes = groups.into_iter().map(|(log_id, payload)| {
            let disk = Arc::clone(&self.disk);
            tokio::task::spawn_blocking(move || {
                disk.write(&log_id, &payload, now)?;
                disk.flush(&log_id)
            })
        });

        let failure = match try_join_all(writes).await {
            Ok(results) => results.into_iter().find_map(|r| r.err()),
            Err(e) => Some(Error::Internal(format!("Write task failed: {}", e))),
        };

        if let Some(e) = failure {
            tracing::error!(
                "Append {}..={} from {} ({}) not stored: {}",
                first_message_id,
                last_message_id,
                client_hostname,
                session_id,
                e
            );
            return self.ack(false, cursor);
        }

        let advanced = self.control.lock().await.advance(
            session_id,
            &client_hostname,
            last_message_id,
            now,
        );

        match advanced {
            Ok(acked) => {
                tracing::debug!(
                    "Stored messages {}..={} from {} ({}), {} dropped",
                    first_message_id,
                    last_message_id,
                    client_hostname,
                    session_id,
                    skipped
                );
                self.ack(true, acked)
            }
            Err(e) => {
                tracing::error!("Failed to persist cursor for {}: {}", session_id, e);
                self.ack(false, cursor)
            }
        }
    }
}
