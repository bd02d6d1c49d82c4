//! Queue publishing.
//!
//! This module provides:
//!
//! - [`QueueTransport`]: trait for sending message batches to a named queue
//! - [`QueuePublisher`]: batching and bounded retry on top of a transport
//! - [`InMemoryQueue`]: in-process transport for tests and `docflow run`
//! - [`HttpQueue`]: JSON-over-HTTP broker transport
//!
//! ## Batching
//!
//! Messages are packed greedily, in input order, into batches whose wire
//! size stays within [`QueueTransport::max_batch_bytes`]. The wire size
//! counts the transport's [`BatchFraming`]: a fixed envelope per batch plus
//! a separator between messages. A single message that does not fit on its
//! own is [`Error::MessageTooLarge`] and nothing is sent.
//!
//! ## Retry
//!
//! Only [`Error::is_transient`] failures are retried, for at most
//! `max_attempts` attempts per call, sleeping `backoff * attempt` (capped at
//! 10 s) in between. A retry resumes at the first batch the transport has
//! not acknowledged.

pub mod http;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Error, Result};

pub use http::HttpQueue;
pub use memory::InMemoryQueue;

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Bytes a transport adds around the messages of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchFraming {
    /// Fixed bytes per batch.
    pub envelope: usize,
    /// Bytes between two consecutive messages.
    pub separator: usize,
}

impl BatchFraming {
    pub const NONE: BatchFraming = BatchFraming {
        envelope: 0,
        separator: 0,
    };
}

/// A message broker that accepts batches of serialized messages.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Largest wire size of one batch, framing included.
    fn max_batch_bytes(&self) -> usize;

    fn batch_framing(&self) -> BatchFraming {
        BatchFraming::NONE
    }

    /// Enqueue every message of `batch` on `queue`, or none of them.
    async fn send_batch(&self, queue: &str, batch: &[String]) -> Result<()>;
}

/// Split serialized messages into size-bounded batches.
pub fn split_batches(messages: Vec<String>, max_bytes: usize) -> Result<Vec<Vec<String>>> {
    split_batches_framed(messages, max_bytes, BatchFraming::NONE)
}

/// Split serialized messages into batches whose framed size fits
/// `max_bytes`.
pub fn split_batches_framed(
    messages: Vec<String>,
    max_bytes: usize,
    framing: BatchFraming,
) -> Result<Vec<Vec<String>>> {
    let payload_limit = max_bytes.saturating_sub(framing.envelope);
    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_bytes = 0usize;

    for message in messages {
        let size = message.len();
        if size > payload_limit {
            return Err(Error::MessageTooLarge {
                size,
                limit: payload_limit,
            });
        }
        let added = if current.is_empty() {
            size
        } else {
            size + framing.separator
        };
        if !current.is_empty() && current_bytes + added > payload_limit {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
            current_bytes += size;
        } else {
            current_bytes += added;
        }
        current.push(message);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

/// Publishes messages to one named queue.
#[derive(Clone)]
pub struct QueuePublisher {
    transport: Arc<dyn QueueTransport>,
    queue: String,
    max_attempts: u32,
    backoff: Duration,
}

impl QueuePublisher {
    pub fn new(transport: Arc<dyn QueueTransport>, queue: impl Into<String>) -> Self {
        Self {
            transport,
            queue: queue.into(),
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt).min(MAX_BACKOFF)
    }

    /// Serialize and enqueue `items`. Returns how many were sent; an empty
    /// input returns 0 without touching the transport.
    pub async fn send<T: Serialize>(&self, items: &[T]) -> Result<usize> {
        if items.is_empty() {
            tracing::info!(queue = %self.queue, "no messages to send");
            return Ok(0);
        }
        let messages = items
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.send_serialized(messages).await
    }

    pub async fn send_serialized(&self, messages: Vec<String>) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        let total = messages.len();
        let batches = split_batches_framed(
            messages,
            self.transport.max_batch_bytes(),
            self.transport.batch_framing(),
        )?;

        let mut next = 0usize;
        let mut attempt = 1u32;
        while next < batches.len() {
            match self.transport.send_batch(&self.queue, &batches[next]).await {
                Ok(()) => {
                    tracing::debug!(
                        queue = %self.queue,
                        batch = next,
                        size = batches[next].len(),
                        "batch acknowledged"
                    );
                    next += 1;
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_for(attempt);
                    tracing::warn!(
                        queue = %self.queue,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient queue failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        queue = %self.queue,
                        attempt,
                        sent_batches = next,
                        error = %e,
                        "failed to publish messages"
                    );
                    return Err(e);
                }
            }
        }

        tracing::info!(
            queue = %self.queue,
            count = total,
            batches = batches.len(),
            "published messages"
        );
        Ok(total)
    }
}
