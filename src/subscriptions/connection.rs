//! Server side of one subscription connection.
//!
//! The connection loops over fetch cycles: take the active lock, let the
//! processor build and record a batch, send it, and wait for the client's
//! acknowledgement. When there is nothing to send it waits for new
//! documents, heartbeating the client while it does.

use super::cancel::CancellationToken;
use super::processor::SubscriptionProcessor;
use super::protocol::{decode, is_heartbeat, ClientMessage, ServerMessage, Transport};
use super::state::ConnectionCoordination;
use super::types::{OpeningStrategy, ProcessedItem, SubscriptionWorkerOptions};
use crate::config::ServerConfig;
use crate::error::{Result, SubscriptionError};
use crate::types::{BatchId, Timestamp};
use crossbeam_channel::{select, Receiver};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// What a connection is doing right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Handshake,
    Fetching,
    WaitingForDocuments,
    WaitingForAcknowledgement,
    Completed,
}

/// Counters kept for diagnostics.
#[derive(Clone, Debug)]
pub struct ConnectionStats {
    pub connection_id: u64,
    pub strategy: OpeningStrategy,
    pub worker_id: Option<String>,
    pub phase: ConnectionPhase,
    pub batch_count: u64,
    pub documents_sent: u64,
    pub total_batch_bytes: u64,
    pub last_error: Option<String>,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

/// Diagnostics of one connection: counters plus a bounded status history.
#[derive(Debug)]
pub struct ConnectionInfo {
    stats: Mutex<ConnectionStats>,
    history: Mutex<VecDeque<String>>,
    history_len: usize,
}

impl ConnectionInfo {
    pub fn new(connection_id: u64, options: &SubscriptionWorkerOptions, history_len: usize) -> Self {
        let info = Self {
            stats: Mutex::new(ConnectionStats {
                connection_id,
                strategy: options.strategy,
                worker_id: options.worker_id.clone(),
                phase: ConnectionPhase::Handshake,
                batch_count: 0,
                documents_sent: 0,
                total_batch_bytes: 0,
                last_error: None,
                started_at: Timestamp::now(),
                completed_at: None,
            }),
            history: Mutex::new(VecDeque::with_capacity(history_len)),
            history_len: history_len.max(1),
        };
        info.push(format!(
            "[CREATE] connection {} for '{}' with strategy {:?}",
            connection_id, options.subscription_name, options.strategy
        ));
        info
    }

    fn push(&self, entry: String) {
        let mut history = self.history.lock();
        if history.len() == self.history_len {
            history.pop_front();
        }
        history.push_back(entry);
    }

    pub fn add_info(&self, message: impl AsRef<str>) {
        self.push(format!("[INFO] {}", message.as_ref()));
    }

    pub fn add_failure(&self, error: &SubscriptionError) {
        self.push(format!("[FAIL] {}", error));
        self.stats.lock().last_error = Some(error.to_string());
    }

    pub fn set_phase(&self, phase: ConnectionPhase) {
        self.stats.lock().phase = phase;
    }

    fn batch_sent(&self, documents: usize, bytes: usize) {
        let mut stats = self.stats.lock();
        stats.batch_count += 1;
        stats.documents_sent += documents as u64;
        stats.total_batch_bytes += bytes as u64;
    }

    pub fn complete(&self) {
        let mut stats = self.stats.lock();
        stats.phase = ConnectionPhase::Completed;
        stats.completed_at = Some(Timestamp::now());
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.lock().clone()
    }

    /// Oldest entry first.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().iter().cloned().collect()
    }
}

/// Drives the protocol for one accepted client.
pub struct SubscriptionConnection {
    id: u64,
    options: SubscriptionWorkerOptions,
    processor: SubscriptionProcessor,
    coordination: Arc<ConnectionCoordination>,
    cancel: CancellationToken,
    info: Arc<ConnectionInfo>,
    heartbeat_interval: Duration,
    active_lock_timeout: Duration,
    active_lock_lease: Duration,
    active_batch: Option<BatchId>,
}

impl SubscriptionConnection {
    pub fn new(
        id: u64,
        options: SubscriptionWorkerOptions,
        processor: SubscriptionProcessor,
        coordination: Arc<ConnectionCoordination>,
        cancel: CancellationToken,
        info: Arc<ConnectionInfo>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            id,
            options,
            processor,
            coordination,
            cancel,
            info,
            heartbeat_interval: config.heartbeat_interval,
            active_lock_timeout: config.active_lock_timeout,
            active_lock_lease: config.active_lock_lease,
            active_batch: None,
        }
    }

    pub fn info(&self) -> &Arc<ConnectionInfo> {
        &self.info
    }

    /// Serve batches until the connection ends. Always returns the reason it ended.
    pub fn run(&mut self, transport: &Transport) -> Result<()> {
        info!(
            connection = self.id,
            subscription = %self.options.subscription_name,
            strategy = ?self.options.strategy,
            "subscription connection started"
        );
        let more_docs = self.coordination.subscribe_more_docs();
        let result = self.process(transport, &more_docs);

        if let Some(batch) = self.active_batch.take() {
            if let Err(e) = self.processor.drop_batch(batch) {
                warn!(connection = self.id, batch = batch.0, error = %e, "failed to return batch to resend");
            }
        }
        self.coordination.release_subscription_active_lock(self.id);

        if let Err(e) = &result {
            if e.is_transport() {
                self.info.add_info(format!("connection ended: {}", e));
            } else {
                self.info.add_failure(e);
            }
        }
        self.info.complete();
        result
    }

    fn process(&mut self, transport: &Transport, more_docs: &Receiver<()>) -> Result<()> {
        loop {
            self.check_cancelled()?;
            self.info.set_phase(ConnectionPhase::Fetching);

            if !self.coordination.wait_for_subscription_active_lock(
                self.id,
                self.active_lock_timeout,
                self.active_lock_lease,
            ) {
                trace!(connection = self.id, "active lock is held by another connection");
                self.wait_for_more_docs(transport, more_docs)?;
                continue;
            }
            let produced = self.produce_batch();
            self.coordination.release_subscription_active_lock(self.id);
            let (items, batch) = produced?;

            if items.is_empty() {
                if self.options.close_when_no_docs_left && self.processor.no_docs_left() {
                    return Err(SubscriptionError::Closed {
                        message: format!(
                            "no documents left to send for subscription '{}'",
                            self.options.subscription_name
                        ),
                        can_reconnect: false,
                        no_docs_left: true,
                    });
                }
                if self.processor.found_about_more_docs() {
                    self.coordination.notify_has_more_docs();
                }
                self.wait_for_more_docs(transport, more_docs)?;
                continue;
            }

            let batch = batch.ok_or_else(|| {
                SubscriptionError::InvalidState("a batch with documents was not recorded".into())
            })?;
            self.active_batch = Some(batch);
            self.send_batch(transport, &items, batch)?;
            self.wait_for_ack(transport)?;
        }
    }

    fn produce_batch(&mut self) -> Result<(Vec<ProcessedItem>, Option<BatchId>)> {
        let items = self.processor.get_batch()?;
        let batch = self.processor.record_batch()?;
        Ok((items, batch))
    }

    fn send_batch(&mut self, transport: &Transport, items: &[ProcessedItem], batch: BatchId) -> Result<()> {
        let mut bytes = 0;
        for item in items {
            bytes += item.document.size();
            transport.send(&ServerMessage::data(item.to_wire(), item.error.clone()))?;
        }
        transport.send(&ServerMessage::end_of_batch())?;
        self.info.batch_sent(items.len(), bytes);
        debug!(
            connection = self.id,
            batch = batch.0,
            count = items.len(),
            bytes,
            last_change_vector = %self.processor.last_change_vector_in_batch(),
            "batch sent"
        );
        Ok(())
    }

    fn wait_for_ack(&mut self, transport: &Transport) -> Result<()> {
        self.info.set_phase(ConnectionPhase::WaitingForAcknowledgement);
        let frames = transport.frames().clone();
        let cancelled = self.cancel.receiver();
        loop {
            select! {
                recv(frames) -> frame => {
                    let frame = frame.map_err(|_| {
                        SubscriptionError::ConnectionDown("client disconnected".into())
                    })?;
                    if is_heartbeat(&frame) {
                        continue;
                    }
                    match decode::<ClientMessage>(&frame)? {
                        ClientMessage::Acknowledge { .. } => {
                            if let Some(batch) = self.active_batch {
                                self.processor.acknowledge_batch(batch)?;
                                self.active_batch = None;
                                trace!(connection = self.id, batch = batch.0, "batch acknowledged");
                            }
                            transport.send(&ServerMessage::confirm())?;
                            return Ok(());
                        }
                        ClientMessage::DisposedNotification => {
                            return Err(SubscriptionError::Cancelled);
                        }
                    }
                },
                recv(cancelled) -> _ => return Err(self.cancellation_reason()),
                default(self.heartbeat_interval) => self.heartbeat(transport)?,
            }
        }
    }

    /// Wait once for new documents, a heartbeat interval at most.
    fn wait_for_more_docs(&mut self, transport: &Transport, more_docs: &Receiver<()>) -> Result<()> {
        self.info.set_phase(ConnectionPhase::WaitingForDocuments);
        let frames = transport.frames().clone();
        let cancelled = self.cancel.receiver();
        select! {
            recv(more_docs) -> _ => Ok(()),
            recv(cancelled) -> _ => Err(self.cancellation_reason()),
            recv(frames) -> frame => match frame {
                Ok(frame) if is_heartbeat(&frame) => Ok(()),
                Ok(frame) => match decode::<ClientMessage>(&frame)? {
                    ClientMessage::DisposedNotification => Err(SubscriptionError::Cancelled),
                    ClientMessage::Acknowledge { .. } => Err(SubscriptionError::InvalidOperation(
                        "acknowledgement received with no batch in flight".into(),
                    )),
                },
                Err(_) => Err(SubscriptionError::ConnectionDown("client disconnected".into())),
            },
            default(self.heartbeat_interval) => self.heartbeat(transport),
        }
    }

    fn heartbeat(&self, transport: &Transport) -> Result<()> {
        transport.send_heartbeat()?;
        self.coordination
            .renew_subscription_active_lock(self.id, self.active_lock_lease);
        self.processor.noop_ack()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(self.cancellation_reason())
        } else {
            Ok(())
        }
    }

    fn cancellation_reason(&self) -> SubscriptionError {
        self.cancel.take_reason().unwrap_or(SubscriptionError::Cancelled)
    }
}
