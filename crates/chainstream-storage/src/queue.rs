//! In-process FIFO queue with content-based dedup.
//!
//! Mirrors the FIFO-queue semantics the engine is built against:
//!
//! - messages of one group key are delivered in send order, and a group is
//!   held back while one of its messages is in flight
//! - a send whose dedup key was accepted within the dedup window is dropped
//! - received messages stay invisible until acknowledged or until the
//!   visibility timeout lapses, after which they are delivered again

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace};

use chainstream_core::error::StreamError;
use chainstream_core::queue::{BatchLimits, OutgoingMessage, QueueTransport, ReceivedMessage};

struct Entry {
    message_id: String,
    group_key: String,
    body: String,
    receive_count: u32,
    /// Set while in flight.
    lease: Option<Lease>,
}

struct Lease {
    receipt_handle: String,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Entry>,
    /// dedup key → message id and acceptance time.
    accepted: HashMap<String, (String, Instant)>,
    next_id: u64,
    next_handle: u64,
}

/// In-memory [`QueueTransport`].
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    visibility_timeout: Duration,
    dedup_window: Duration,
    limits: BatchLimits,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    /// 30s visibility timeout and a 5 minute dedup window.
    pub fn new() -> Self {
        Self::with_timeouts(Duration::from_secs(30), Duration::from_secs(300))
    }

    pub fn with_timeouts(visibility_timeout: Duration, dedup_window: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            visibility_timeout,
            dedup_window,
            limits: BatchLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, QueueState>>, StreamError> {
        self.queues
            .lock()
            .map_err(|_| StreamError::Queue("queue lock poisoned".into()))
    }

    /// Messages not yet acknowledged, in flight or not.
    pub fn len(&self, queue: &str) -> usize {
        self.lock()
            .map(|q| q.get(queue).map_or(0, |s| s.messages.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Bodies of every unacknowledged message in queue order, without receiving them.
    pub fn peek_bodies(&self, queue: &str) -> Vec<String> {
        self.lock()
            .map(|q| {
                q.get(queue)
                    .map(|s| s.messages.iter().map(|e| e.body.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn enqueue(&self, state: &mut QueueState, message: OutgoingMessage, now: Instant) -> String {
        let window = self.dedup_window;
        state
            .accepted
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < window);

        if let Some((id, _)) = state.accepted.get(&message.dedup_key) {
            trace!(dedup_key = %message.dedup_key, "duplicate send dropped");
            return id.clone();
        }

        state.next_id += 1;
        let message_id = format!("msg-{}", state.next_id);
        state
            .accepted
            .insert(message.dedup_key, (message_id.clone(), now));
        state.messages.push_back(Entry {
            message_id: message_id.clone(),
            group_key: message.group_key,
            body: message.body,
            receive_count: 0,
            lease: None,
        });
        message_id
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn send(&self, queue: &str, message: OutgoingMessage) -> Result<String, StreamError> {
        let mut queues = self.lock()?;
        let state = queues.entry(queue.to_string()).or_default();
        let id = self.enqueue(state, message, Instant::now());
        debug!(queue, message_id = %id, "message sent");
        Ok(id)
    }

    async fn send_batch(
        &self,
        queue: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<(), StreamError> {
        if messages.len() > self.limits.max_entries {
            return Err(StreamError::Queue(format!(
                "batch of {} entries exceeds the limit of {}",
                messages.len(),
                self.limits.max_entries
            )));
        }
        let bytes: usize = messages.iter().map(OutgoingMessage::size).sum();
        if bytes > self.limits.max_bytes {
            return Err(StreamError::Queue(format!(
                "batch of {bytes} bytes exceeds the limit of {}",
                self.limits.max_bytes
            )));
        }
        let mut ids = HashSet::new();
        if !messages.iter().all(|m| ids.insert(m.id.as_str())) {
            return Err(StreamError::Queue("batch entry ids must be distinct".into()));
        }

        let mut queues = self.lock()?;
        let state = queues.entry(queue.to_string()).or_default();
        let now = Instant::now();
        let count = messages.len();
        for message in messages {
            self.enqueue(state, message, now);
        }
        debug!(queue, count, "batch sent");
        Ok(())
    }

    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<ReceivedMessage>, StreamError> {
        let mut queues = self.lock()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for entry in state.messages.iter_mut() {
            if out.len() >= max {
                break;
            }
            let in_flight = entry.lease.as_ref().map_or(false, |l| l.visible_at > now);
            if in_flight || blocked.contains(&entry.group_key) {
                blocked.insert(entry.group_key.clone());
                continue;
            }
            state.next_handle += 1;
            let receipt_handle = format!("{}#{}", entry.message_id, state.next_handle);
            entry.receive_count += 1;
            entry.lease = Some(Lease {
                receipt_handle: receipt_handle.clone(),
                visible_at: now + self.visibility_timeout,
            });
            out.push(ReceivedMessage {
                message_id: entry.message_id.clone(),
                receipt_handle,
                body: entry.body.clone(),
                receive_count: entry.receive_count,
            });
        }
        Ok(out)
    }

    async fn ack(&self, queue: &str, message: &ReceivedMessage) -> Result<(), StreamError> {
        let mut queues = self.lock()?;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| StreamError::Queue(format!("unknown queue {queue}")))?;
        let pos = state.messages.iter().position(|e| {
            e.lease
                .as_ref()
                .map_or(false, |l| l.receipt_handle == message.receipt_handle)
        });
        match pos {
            Some(i) => {
                state.messages.remove(i);
                Ok(())
            }
            None => Err(StreamError::Queue(format!(
                "receipt handle {} is stale or unknown",
                message.receipt_handle
            ))),
        }
    }

    fn batch_limits(&self) -> BatchLimits {
        self.limits
    }
}
