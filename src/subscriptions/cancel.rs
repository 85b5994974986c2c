//! Cooperative cancellation for blocking waits.
//!
//! A token exposes a channel that disconnects when the token is cancelled,
//! so it can sit in a `select!` next to the channel being waited on.

use crate::error::{Result, SubscriptionError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct Inner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
    reason: Mutex<Option<SubscriptionError>>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self, reason: Option<SubscriptionError>) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reason) = reason {
            *self.reason.lock() = Some(reason);
        }
        self.trigger.lock().take();
        for child in self.children.lock().drain(..) {
            if let Some(child) = child.upgrade() {
                child.cancel(None);
            }
        }
    }
}

#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
                reason: Mutex::new(None),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A token cancelled together with this one (but not the other way around).
    pub fn child(&self) -> Self {
        let child = Self::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }
        let mut children = self.inner.children.lock();
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        drop(children);
        // Cancelled between the check and the registration.
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel(None);
    }

    /// Cancel and remember why; the first reason wins.
    pub fn cancel_with(&self, reason: SubscriptionError) {
        self.inner.cancel(Some(reason));
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SubscriptionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Disconnects on cancellation; use as a `select!` arm.
    pub fn receiver(&self) -> Receiver<()> {
        self.inner.signal.clone()
    }

    pub fn take_reason(&self) -> Option<SubscriptionError> {
        self.inner.reason.lock().take()
    }

    /// Sleep for `duration` unless cancelled first. Returns true if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        match self.inner.signal.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            _ => true,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
