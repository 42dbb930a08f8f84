// Ordered hand-off buffer between a stream's network task and application readers.
//
// The producer never blocks: the server only sends what the client granted, so
// the permit budget bounds the queue. Readers block on `next_event` until an
// event arrives or the consumer reaches a terminal state.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::StreamError;

type CloseListener = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub enum ConsumerState {
    Active,
    Failed(StreamError),
    Closed,
}

pub struct EventConsumer<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

struct Inner<T> {
    queue: VecDeque<T>,
    state: ConsumerState,
    close_listeners: Vec<CloseListener>,
}

impl<T> Default for EventConsumer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventConsumer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                state: ConsumerState::Active,
                close_listeners: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Append an event. Ignored once the consumer is failed or closed.
    pub fn push(&self, event: T) -> bool {
        let len = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, ConsumerState::Active) {
                return false;
            }
            inner.queue.push_back(event);
            inner.queue.len()
        };
        metrics::gauge!("logline_client_consumer_queue_len").set(len as f64);
        self.notify.notify_one();
        true
    }

    /// Wait for the next event.
    ///
    /// Returns `Ok(None)` once the consumer is closed and `Err` with the
    /// recorded cause once it has failed. Events still buffered at that point
    /// are discarded.
    pub async fn next_event(&self) -> Result<Option<T>, StreamError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not lost.
            notified.as_mut().enable();
            if let Some(outcome) = self.try_next() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`next_event`](Self::next_event); `None` means
    /// nothing is buffered yet.
    pub fn try_next(&self) -> Option<Result<Option<T>, StreamError>> {
        let mut inner = self.inner.lock();
        match &inner.state {
            ConsumerState::Closed => return Some(Ok(None)),
            ConsumerState::Failed(cause) => return Some(Err(cause.clone())),
            ConsumerState::Active => {}
        }
        let event = inner.queue.pop_front()?;
        let len = inner.queue.len();
        drop(inner);
        metrics::gauge!("logline_client_consumer_queue_len").set(len as f64);
        Some(Ok(Some(event)))
    }

    /// Look at the head of the queue without consuming it.
    pub fn peek(&self) -> Result<Option<T>, StreamError>
    where
        T: Clone,
    {
        let inner = self.inner.lock();
        match &inner.state {
            ConsumerState::Closed => Ok(None),
            ConsumerState::Failed(cause) => Err(cause.clone()),
            ConsumerState::Active => Ok(inner.queue.front().cloned()),
        }
    }

    /// Wait up to `timeout` for an event to become available.
    pub async fn has_next_available(&self, timeout: Duration) -> Result<bool, StreamError> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let inner = self.inner.lock();
                    match &inner.state {
                        ConsumerState::Closed => return Ok(false),
                        ConsumerState::Failed(cause) => return Err(cause.clone()),
                        ConsumerState::Active if !inner.queue.is_empty() => return Ok(true),
                        ConsumerState::Active => {}
                    }
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => {
                // Peeking must not swallow the wake-up meant for a reader.
                if matches!(result, Ok(true)) {
                    self.notify.notify_one();
                }
                result
            }
            Err(_) => Ok(false),
        }
    }

    /// Move to `FAILED`. Only the first call has an effect; close listeners
    /// are not invoked.
    pub fn fail(&self, cause: StreamError) -> bool {
        {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, ConsumerState::Active) {
                return false;
            }
            tracing::debug!(error = %cause, "event consumer failed");
            inner.state = ConsumerState::Failed(cause);
            inner.queue.clear();
            inner.close_listeners.clear();
        }
        metrics::counter!("logline_client_stream_failures_total").increment(1);
        metrics::gauge!("logline_client_consumer_queue_len").set(0.0);
        self.notify.notify_waiters();
        true
    }

    /// Move to `CLOSED` and run every registered close listener once.
    pub fn close(&self) -> bool {
        let listeners = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, ConsumerState::Active) {
                return false;
            }
            inner.state = ConsumerState::Closed;
            inner.queue.clear();
            std::mem::take(&mut inner.close_listeners)
        };
        metrics::gauge!("logline_client_consumer_queue_len").set(0.0);
        self.notify.notify_waiters();
        for listener in listeners {
            listener();
        }
        true
    }

    /// Register cleanup to run when the consumer is closed. Runs immediately
    /// when already closed; dropped when the consumer has failed.
    pub fn register_close_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ConsumerState::Active) {
            inner.close_listeners.push(Box::new(listener));
            return;
        }
        let closed = matches!(inner.state, ConsumerState::Closed);
        drop(inner);
        if closed {
            listener();
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.lock().state.clone()
    }

    pub fn buffered(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

impl<T> std::fmt::Debug for EventConsumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EventConsumer")
            .field("state", &inner.state)
            .field("buffered", &inner.queue.len())
            .finish()
    }
}
