/*!
 * Transport abstraction.
 *
 * Every substrate (TCP, TCP+TLS, WebSocket) exposes the same contract:
 * connect, disconnect, terminate, best-effort send, and TLS upgrade.
 * A supervisor task per transport reconnects with jittered exponential
 * backoff and drives the queue's online gate; the read path feeds
 * inbound bytes through the tokenizer and routes messages to the current
 * task's parser or the driver's `received` callback.
 */
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::queue::QueueHandle;
use crate::task::Task;
use crate::tokenizer::Tokenizer;

mod tcp;
mod tls;
mod websocket;

pub use tcp::TcpTransport;
pub use tls::{TlsSettings, TlsVerify};
pub use websocket::WebSocketTransport;

/// Driver callback for inbound data no parser claimed
pub type ReceivedCallback = Arc<dyn Fn(&[u8], Option<Arc<Task>>) + Send + Sync>;

/// Uniform send/receive contract over any substrate
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection and start the reader.
    ///
    /// Idempotent; returns once the transport is online or the timeout
    /// expires. The supervisor keeps retrying in the background either
    /// way, unless the failure is non-retryable.
    async fn connect(&self, connect_timeout: Duration) -> Result<()>;

    /// Close the socket; the reader observes EOF and reconnection takes
    /// over
    async fn disconnect(&self);

    /// Sticky shutdown: closes the socket and stops reconnecting. Later
    /// `connect` calls are no-ops.
    async fn terminate(&self);

    /// Best-effort write. Returns `Ok(0)` when no socket is present; the
    /// in-flight task then times out and retries.
    async fn send(&self, bytes: &[u8]) -> Result<usize>;

    /// The read-path dispatcher owned by this transport
    fn dispatcher(&self) -> &Arc<Dispatcher>;

    /// Register `task`'s response parser as current, then write.
    async fn send_task(&self, bytes: &[u8], task: Arc<Task>) -> Result<usize> {
        self.dispatcher().register_task(task);
        self.send(bytes).await
    }

    /// Upgrade the session to TLS. Only valid after `connect` on
    /// substrates that support upgrade; idempotent if already started.
    async fn start_tls(&self, settings: TlsSettings) -> Result<()>;

    /// Execute a remote command; only meaningful on SSH substrates.
    async fn exec(&self, _command: &[u8]) -> Result<Vec<u8>> {
        Err(Error::unsupported("exec is only available on SSH transports"))
    }
}

/// Read path shared by every substrate.
///
/// Holds the framing tokenizer and routes each extracted message to the
/// current task's parser, falling back to the driver's `received`
/// callback. User-code failures are caught and logged; the reader never
/// dies from them.
pub struct Dispatcher {
    queue: QueueHandle,
    received: ReceivedCallback,
    tokenizer: Mutex<Option<Tokenizer>>,
    /// Self-handle for spawning per-message processing tasks
    this: Weak<Dispatcher>,
}

impl Dispatcher {
    /// Create a dispatcher for one transport
    pub fn new(
        queue: QueueHandle,
        received: ReceivedCallback,
        tokenizer: Option<Tokenizer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            queue,
            received,
            tokenizer: Mutex::new(tokenizer),
            this: this.clone(),
        })
    }

    /// Register a task as in-flight, arming its deadline
    pub fn register_task(&self, task: Arc<Task>) {
        self.queue.register_in_flight(task);
    }

    /// Discard any partial frame (called between reconnect attempts)
    pub fn clear_buffer(&self) {
        if let Some(tokenizer) = self
            .tokenizer
            .lock()
            .expect("dispatcher tokenizer lock poisoned")
            .as_mut()
        {
            tokenizer.clear();
        }
    }

    /// Feed a slice read from the wire through the framing rule.
    ///
    /// A single extracted message is processed inline on the reader;
    /// multiple messages are dispatched on independent tasks so a slow
    /// parser cannot head-of-line block its successors.
    pub fn process(&self, data: &[u8]) {
        let extracted = {
            let mut guard = self
                .tokenizer
                .lock()
                .expect("dispatcher tokenizer lock poisoned");
            guard.as_mut().map(|tokenizer| tokenizer.extract(data))
        };

        let messages = match extracted {
            None => {
                self.process_message(data);
                return;
            }
            Some(Ok(messages)) => messages,
            Some(Err(e)) => {
                warn!("Tokenizer error, buffer dropped: {}", e);
                return;
            }
        };

        match messages.len() {
            0 => {}
            1 => self.process_message(&messages[0]),
            _ => {
                for message in messages {
                    let Some(this) = self.this.upgrade() else { return };
                    tokio::spawn(async move {
                        this.process_message(&message);
                    });
                }
            }
        }
    }

    /// Deliver one complete message.
    ///
    /// Goes to the current task's parser when one is registered,
    /// otherwise to the driver's `received` callback.
    pub fn process_message(&self, data: &[u8]) {
        let current = self.queue.current_task();

        if let Some(task) = current.as_ref() {
            if task.has_parser() {
                let result = task.parse(data);
                self.queue.apply_parse_result(task, result);
                return;
            }
        }

        let received = &self.received;
        let outcome = catch_unwind(AssertUnwindSafe(|| received(data, current)));
        if outcome.is_err() {
            error!("received callback panicked; reader continues");
        }
    }
}

/// Jittered exponential backoff for reconnect loops
pub(crate) struct Backoff {
    current: Duration,
    base: Duration,
    max: Duration,
    jitter_ms: u64,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration, jitter_ms: u64) -> Self {
        Self {
            current: base,
            base,
            max,
            jitter_ms,
        }
    }

    /// The next delay to sleep; doubles up to the cap, ±half the jitter
    pub(crate) fn next_delay(&mut self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            let offset = rand::random::<u64>() % self.jitter_ms;
            Duration::from_millis(offset)
        } else {
            Duration::ZERO
        };
        let half_jitter = Duration::from_millis(self.jitter_ms / 2);
        let delay = self.current.saturating_sub(half_jitter) + jitter;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Reset after a successful connection
    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Queue;
    use crate::task::{ParseResult, Task};
    use crate::tokenizer::Framing;
    use modlink_core::types::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_received() -> ReceivedCallback {
        Arc::new(|_data, _task| {})
    }

    #[tokio::test]
    async fn test_process_without_tokenizer_passes_raw_bytes() {
        let queue = Queue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let received: ReceivedCallback = Arc::new(move |data, _task| {
            seen_in.lock().unwrap().push(data.to_vec());
        });
        let dispatcher = Dispatcher::new(queue.handle(), received, None);

        dispatcher.process(b"raw bytes");
        assert_eq!(seen.lock().unwrap().as_slice(), &[b"raw bytes".to_vec()]);
    }

    #[tokio::test]
    async fn test_process_frames_before_delivery() {
        let queue = Queue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let received: ReceivedCallback = Arc::new(move |data, _task| {
            seen_in.lock().unwrap().push(data.to_vec());
        });
        let dispatcher = Dispatcher::new(
            queue.handle(),
            received,
            Some(Tokenizer::new(Framing::Delimiter(b"\n".to_vec()))),
        );

        dispatcher.process(b"one\ntwo");
        assert_eq!(seen.lock().unwrap().as_slice(), &[b"one\n".to_vec()]);

        dispatcher.clear_buffer();
        dispatcher.process(b"three\n");
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_current_task_parser_takes_priority() {
        let queue = Queue::new();
        let fallback_hits = Arc::new(AtomicUsize::new(0));
        let hits = fallback_hits.clone();
        let received: ReceivedCallback = Arc::new(move |_data, _task| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let dispatcher = Dispatcher::new(queue.handle(), received, None);

        let command = Task::builder("parse-me")
            .parser(|_data, _task| ParseResult::Success(Value::Bool(true)))
            .build();
        let task = command.task().clone();
        dispatcher.register_task(task);

        dispatcher.process_message(b"response");
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 0);
        assert!(queue.handle().current_task().is_none());
    }

    #[tokio::test]
    async fn test_received_callback_panic_is_contained() {
        let queue = Queue::new();
        let received: ReceivedCallback = Arc::new(|_data, _task| panic!("driver bug"));
        let dispatcher = Dispatcher::new(queue.handle(), received, None);

        // Must not propagate
        dispatcher.process(b"boom");
        dispatcher.process(b"again");
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            0, // no jitter, deterministic
        );

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            500,
        );

        for _ in 0..20 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(750));
            assert!(delay < Duration::from_millis(1250));
        }
    }
}
