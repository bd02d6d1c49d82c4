//! In-memory [`QueueTransport`].
//!
//! Records every acknowledged batch per queue and keeps a pending FIFO that
//! [`InMemoryQueue::take`] drains. Failures can be scripted for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::QueueTransport;

#[derive(Default)]
struct State {
    batches: HashMap<String, Vec<Vec<String>>>,
    pending: HashMap<String, VecDeque<String>>,
    send_calls: usize,
    /// Successful calls still allowed before scripted failures start.
    succeed_first: usize,
    fail_remaining: usize,
    fail_transient: bool,
}

pub struct InMemoryQueue {
    max_batch_bytes: usize,
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new(max_batch_bytes: usize) -> Self {
        Self {
            max_batch_bytes,
            state: Mutex::new(State::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> Option<R> {
        self.state.lock().ok().map(|mut s| f(&mut s))
    }

    /// Fail the next `n` sends, transiently or permanently.
    pub fn fail_next(&self, n: usize, transient: bool) {
        self.fail_after(0, n, transient);
    }

    /// Let `ok` sends through, then fail the following `n`.
    pub fn fail_after(&self, ok: usize, n: usize, transient: bool) {
        self.with_state(|s| {
            s.succeed_first = ok;
            s.fail_remaining = n;
            s.fail_transient = transient;
        });
    }

    /// Drain every pending message of `queue`, oldest first.
    pub fn take(&self, queue: &str) -> Vec<String> {
        self.with_state(|s| {
            s.pending
                .get_mut(queue)
                .map(|q| q.drain(..).collect())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    /// Pop at most one pending message.
    pub fn pop(&self, queue: &str) -> Option<String> {
        self.with_state(|s| s.pending.get_mut(queue).and_then(VecDeque::pop_front))
            .flatten()
    }

    pub fn pending_len(&self, queue: &str) -> usize {
        self.with_state(|s| s.pending.get(queue).map_or(0, VecDeque::len))
            .unwrap_or_default()
    }

    /// Every acknowledged batch for `queue`, in send order.
    pub fn batches(&self, queue: &str) -> Vec<Vec<String>> {
        self.with_state(|s| s.batches.get(queue).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Total `send_batch` calls, failed ones included.
    pub fn send_calls(&self) -> usize {
        self.with_state(|s| s.send_calls).unwrap_or_default()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    async fn send_batch(&self, queue: &str, batch: &[String]) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::storage("in-memory queue lock poisoned"))?;
        state.send_calls += 1;

        if state.succeed_first > 0 {
            state.succeed_first -= 1;
        } else if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(if state.fail_transient {
                Error::TransientInfra(format!("scripted failure sending to '{}'", queue))
            } else {
                Error::ExternalService(format!("scripted failure sending to '{}'", queue))
            });
        }

        let size: usize = batch.iter().map(String::len).sum();
        if size > self.max_batch_bytes {
            return Err(Error::MessageTooLarge {
                size,
                limit: self.max_batch_bytes,
            });
        }

        state
            .batches
            .entry(queue.to_string())
            .or_default()
            .push(batch.to_vec());
        state
            .pending
            .entry(queue.to_string())
            .or_default()
            .extend(batch.iter().cloned());
        Ok(())
    }
}
