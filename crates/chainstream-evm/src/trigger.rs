//! Waking the drain after a tick.
//!
//! A trigger is a hint, not a handoff: the drain also runs on its own
//! schedule, so a lost trigger only delays delivery.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use chainstream_core::error::StreamError;

use crate::retry::{retry, RetryPolicy};

#[async_trait]
pub trait DrainTrigger: Send + Sync {
    async fn trigger(&self) -> Result<(), StreamError>;
}

/// Wakes an in-process drain worker through a channel of capacity one.
///
/// A wake-up that is already pending counts as success: the worker will
/// drain everything that is queued by the time it runs.
#[derive(Clone)]
pub struct ChannelTrigger {
    tx: mpsc::Sender<()>,
}

impl ChannelTrigger {
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DrainTrigger for ChannelTrigger {
    async fn trigger(&self) -> Result<(), StreamError> {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => {
                Err(StreamError::Queue("drain worker is not running".into()))
            }
        }
    }
}

/// Retries another trigger with backoff.
pub struct RetryingTrigger {
    inner: Arc<dyn DrainTrigger>,
    policy: RetryPolicy,
}

impl RetryingTrigger {
    pub fn new(inner: Arc<dyn DrainTrigger>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl DrainTrigger for RetryingTrigger {
    async fn trigger(&self) -> Result<(), StreamError> {
        retry(&self.policy, "drain trigger", || self.inner.trigger()).await
    }
}
