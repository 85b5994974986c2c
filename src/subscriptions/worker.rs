//! Client side of a subscription.
//!
//! A [`SubscriptionWorker`] connects, hands every batch to a
//! [`BatchHandler`], acknowledges it, and reconnects according to the
//! status the server ends the connection with.

use super::cancel::CancellationToken;
use super::protocol::{decode, is_heartbeat, ClientMessage, MessageType, ServerMessage, Transport};
use super::types::{BatchItem, SubscriptionWorkerOptions};
use crate::change_vector::ChangeVector;
use crate::error::{Result, SubscriptionError};
use crossbeam_channel::select;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long the worker waits on a silent connection before giving up on it.
/// Servers heartbeat every second, so silence this long means the peer is gone.
const SILENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens a connection to a subscription host and returns the client end.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Transport>;
}

/// A batch as the worker received it.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionBatch {
    pub items: Vec<BatchItem>,
}

impl SubscriptionBatch {
    /// Merge of every item's change vector, sent back with the acknowledgement.
    pub fn last_change_vector(&self) -> ChangeVector {
        ChangeVector::merge_all(self.items.iter().map(|item| &item.change_vector))
    }
}

pub trait BatchHandler: Send {
    /// Process a batch. Returning an error stops the worker without acknowledging.
    fn handle(&mut self, batch: &SubscriptionBatch) -> Result<()>;

    /// The server recorded the acknowledgement of `batch`.
    fn confirmed(&mut self, _batch: &SubscriptionBatch) {}
}

impl<F> BatchHandler for F
where
    F: FnMut(&SubscriptionBatch) -> Result<()> + Send,
{
    fn handle(&mut self, batch: &SubscriptionBatch) -> Result<()> {
        self(batch)
    }
}

/// What the worker does after a connection ends with an error.
#[derive(Debug, PartialEq, Eq)]
enum Reaction {
    Stop,
    ReconnectNow,
    ReconnectLater,
}

fn reaction(error: &SubscriptionError) -> Reaction {
    match error {
        SubscriptionError::ChangeVectorUpdateConcurrency(_) => Reaction::ReconnectNow,
        SubscriptionError::DoesNotBelongToNode { .. } => Reaction::ReconnectLater,
        SubscriptionError::Closed { can_reconnect, .. } => {
            if *can_reconnect {
                Reaction::ReconnectLater
            } else {
                Reaction::Stop
            }
        }
        SubscriptionError::InUse(_)
        | SubscriptionError::DoesNotExist(_)
        | SubscriptionError::DatabaseDoesNotExist(_)
        | SubscriptionError::InvalidState(_)
        | SubscriptionError::Subscriber(_) => Reaction::Stop,
        _ => Reaction::ReconnectLater,
    }
}

pub struct SubscriptionWorker {
    options: SubscriptionWorkerOptions,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
}

impl SubscriptionWorker {
    pub fn new(options: SubscriptionWorkerOptions, connector: Arc<dyn Connector>) -> Self {
        Self::with_cancellation(options, connector, CancellationToken::new())
    }

    pub fn with_cancellation(
        options: SubscriptionWorkerOptions,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            connector,
            cancel,
        }
    }

    pub fn options(&self) -> &SubscriptionWorkerOptions {
        &self.options
    }

    /// Cancelling the token disposes the worker.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run until cancelled or until the server ends the subscription for good.
    ///
    /// Returns `Ok` when cancelled or when the server closed the connection
    /// because no documents were left.
    pub fn run<H: BatchHandler + ?Sized>(&self, handler: &mut H) -> Result<()> {
        let mut failing_since: Option<Instant> = None;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let error = match self.process_connection(handler, &mut failing_since) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if let SubscriptionError::Closed {
                no_docs_left: true, ..
            } = error
            {
                info!(subscription = %self.options.subscription_name, "no documents left, worker done");
                return Ok(());
            }

            let reaction = reaction(&error);
            if reaction == Reaction::Stop {
                warn!(
                    subscription = %self.options.subscription_name,
                    error = %error,
                    "subscription worker stopped"
                );
                return Err(error);
            }

            let since = *failing_since.get_or_insert_with(Instant::now);
            if since.elapsed() > self.options.max_erroneous_period {
                warn!(
                    subscription = %self.options.subscription_name,
                    error = %error,
                    "subscription worker failed for too long"
                );
                return Err(error);
            }

            debug!(
                subscription = %self.options.subscription_name,
                error = %error,
                reaction = ?reaction,
                "reconnecting"
            );
            if reaction == Reaction::ReconnectLater
                && self.cancel.sleep(self.options.time_to_wait_before_connection_retry)
            {
                return Ok(());
            }
        }
    }

    /// Run on a named thread.
    pub fn spawn<H: BatchHandler + 'static>(self, mut handler: H) -> Result<WorkerHandle> {
        let cancel = self.cancel.clone();
        let name = format!("subscription-worker-{}", self.options.subscription_name);
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || self.run(&mut handler))?;
        Ok(WorkerHandle {
            cancel,
            thread: Some(thread),
        })
    }

    fn process_connection<H: BatchHandler + ?Sized>(
        &self,
        handler: &mut H,
        failing_since: &mut Option<Instant>,
    ) -> Result<()> {
        let transport = self.connector.connect()?;
        transport.send(&self.options)?;

        let mut batch = SubscriptionBatch::default();
        let mut awaiting_confirm: Option<SubscriptionBatch> = None;
        let frames = transport.frames().clone();
        let cancelled = self.cancel.receiver();

        loop {
            let frame = select! {
                recv(frames) -> frame => match frame {
                    Ok(frame) => frame,
                    Err(_) => return Err(SubscriptionError::ConnectionDown("server closed the connection".into())),
                },
                recv(cancelled) -> _ => {
                    let _ = transport.send(&ClientMessage::DisposedNotification);
                    return Ok(());
                },
                default(SILENCE_TIMEOUT) => {
                    return Err(SubscriptionError::ConnectionDown("server stopped responding".into()));
                }
            };
            if is_heartbeat(&frame) {
                continue;
            }

            let message: ServerMessage = decode(&frame)?;
            match message.kind {
                MessageType::ConnectionStatus | MessageType::Error => {
                    if let Some(error) = message.to_error() {
                        return Err(error);
                    }
                    debug!(subscription = %self.options.subscription_name, "connection accepted");
                }
                MessageType::Data => {
                    let data = message.data.ok_or_else(|| {
                        SubscriptionError::Deserialization("data message without data".into())
                    })?;
                    let mut item: BatchItem = serde_json::from_value(data)
                        .map_err(|e| SubscriptionError::Deserialization(e.to_string()))?;
                    if item.exception.is_none() {
                        item.exception = message.exception;
                    }
                    batch.items.push(item);
                }
                MessageType::EndOfBatch => {
                    let received = std::mem::take(&mut batch);
                    handler.handle(&received).map_err(|e| {
                        if e.is_transport() {
                            e
                        } else {
                            SubscriptionError::Subscriber(e.to_string())
                        }
                    })?;
                    transport.send(&ClientMessage::Acknowledge {
                        change_vector: Some(received.last_change_vector().to_string()),
                    })?;
                    awaiting_confirm = Some(received);
                }
                MessageType::Confirm => {
                    if let Some(confirmed) = awaiting_confirm.take() {
                        handler.confirmed(&confirmed);
                    }
                    *failing_since = None;
                }
            }
        }
    }
}

/// A worker running on its own thread.
pub struct WorkerHandle {
    cancel: CancellationToken,
    thread: Option<JoinHandle<Result<()>>>,
}

impl WorkerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| thread.is_finished())
            .unwrap_or(true)
    }

    /// Wait for the worker to stop and return how it ended.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| SubscriptionError::InvalidOperation("worker thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
