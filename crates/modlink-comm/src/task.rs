/*!
 * Command tasks.
 *
 * A task is one outstanding command against a device: its payload, its
 * deadline, an optional response parser, and a completion slot that
 * resolves exactly once. Tasks are created by the driver, enqueued, are
 * in-flight at most once at a time, and are never reused.
 */
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::error;

use modlink_core::types::{Priority, Value};

/// Terminal result observed on a task's completion slot
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The response parser produced a value
    Success(Value),
    /// The task was aborted with a reason
    Abort(String),
    /// The deadline expired with no retries remaining
    Timeout,
    /// The task failed with an error
    Error(String),
}

impl TaskOutcome {
    /// Whether the outcome is a success
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// Verdict of a response parser on an inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// The response is complete; the task succeeds with this value
    Success(Value),
    /// Re-enqueue the task at the head of its lane (retries permitting)
    Retry(String),
    /// Terminal failure
    Abort(String),
    /// More bytes are expected; the task stays in-flight and its
    /// deadline is re-armed from this moment
    Continue,
}

/// Parser routing inbound bytes to a task result
pub type ResponseParser = Arc<dyn Fn(&[u8], &Task) -> ParseResult + Send + Sync>;

type PayloadFn = Box<dyn FnOnce() -> Vec<u8> + Send>;

enum Payload {
    /// Producer not yet invoked
    Producer(PayloadFn),
    /// Produced bytes, cached for retries
    Ready(Vec<u8>),
}

/// One outstanding command
pub struct Task {
    name: String,
    priority: Priority,
    retries: AtomicU32,
    timeout: Duration,
    delay_before: Option<Duration>,
    clear_queue: bool,
    payload: Mutex<Option<Payload>>,
    parser: Option<ResponseParser>,
    completion: Mutex<Option<oneshot::Sender<TaskOutcome>>>,
}

impl Task {
    /// Start building a task
    pub fn builder<S: AsRef<str>>(name: S) -> TaskBuilder {
        TaskBuilder::new(name.as_ref())
    }

    /// The task's human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The lane this task dispatches from
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Retries remaining
    pub fn retries_remaining(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    /// The deadline armed on each dispatch
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Optional sleep before the payload is sent
    pub fn delay_before(&self) -> Option<Duration> {
        self.delay_before
    }

    /// Whether dispatching this task drops all other pending tasks
    pub fn clear_queue(&self) -> bool {
        self.clear_queue
    }

    /// Whether a response parser is attached
    pub fn has_parser(&self) -> bool {
        self.parser.is_some()
    }

    /// Produce the payload bytes.
    ///
    /// The producer runs exactly once; the bytes are cached so a retry
    /// re-sends the same payload.
    pub(crate) fn payload_bytes(&self) -> Vec<u8> {
        let mut guard = self.payload.lock().expect("task payload lock poisoned");
        let bytes = match guard.take() {
            Some(Payload::Producer(produce)) => produce(),
            Some(Payload::Ready(bytes)) => bytes,
            None => Vec::new(),
        };
        *guard = Some(Payload::Ready(bytes.clone()));
        bytes
    }

    /// Run the response parser on an inbound message.
    ///
    /// A panic inside the parser becomes `Abort`, never a dead reader.
    pub(crate) fn parse(&self, data: &[u8]) -> ParseResult {
        let Some(parser) = self.parser.as_ref() else {
            return ParseResult::Continue;
        };
        match catch_unwind(AssertUnwindSafe(|| parser(data, self))) {
            Ok(result) => result,
            Err(_) => {
                error!("Response parser panicked for task {}", self.name);
                ParseResult::Abort(format!("parser panicked for task {}", self.name))
            }
        }
    }

    /// Consume one retry; false when none remain
    pub(crate) fn take_retry(&self) -> bool {
        self.retries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .is_ok()
    }

    /// Resolve the completion slot; only the first call wins
    pub fn complete(&self, outcome: TaskOutcome) -> bool {
        let sender = self
            .completion
            .lock()
            .expect("task completion lock poisoned")
            .take();
        match sender {
            Some(sender) => {
                // The caller may have dropped the future; that is fine
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Complete with a success value; permitted only once
    pub fn success(&self, value: Value) -> bool {
        self.complete(TaskOutcome::Success(value))
    }

    /// Complete as aborted; idempotent
    pub fn abort<S: AsRef<str>>(&self, reason: S) -> bool {
        self.complete(TaskOutcome::Abort(reason.as_ref().to_string()))
    }

    /// Whether the completion slot has resolved
    pub fn is_complete(&self) -> bool {
        self.completion
            .lock()
            .expect("task completion lock poisoned")
            .is_none()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("retries", &self.retries_remaining())
            .field("timeout", &self.timeout)
            .field("clear_queue", &self.clear_queue)
            .finish()
    }
}

/// A built task paired with its completion future
pub struct Command {
    pub(crate) task: Arc<Task>,
    pub(crate) future: CommandFuture,
}

impl Command {
    /// The task carried by this command
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }
}

/// Resolves to the task's [`TaskOutcome`]
pub struct CommandFuture {
    receiver: oneshot::Receiver<TaskOutcome>,
}

impl Future for CommandFuture {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(TaskOutcome::Error(
                "task dropped without completing".to_string(),
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Builder for [`Task`]
pub struct TaskBuilder {
    name: String,
    priority: Priority,
    retries: u32,
    timeout: Duration,
    delay_before: Option<Duration>,
    clear_queue: bool,
    payload: Option<Payload>,
    parser: Option<ResponseParser>,
}

impl TaskBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            priority: Priority::Normal,
            retries: 3,
            timeout: Duration::from_secs(5),
            delay_before: None,
            clear_queue: false,
            payload: None,
            parser: None,
        }
    }

    /// Set the dispatch priority
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the number of retries
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the per-dispatch deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sleep this long before sending
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_before = Some(delay);
        self
    }

    /// Drop all other pending tasks when this one dispatches
    pub fn clear_queue(mut self) -> Self {
        self.clear_queue = true;
        self
    }

    /// Set the payload bytes
    pub fn payload<B: Into<Vec<u8>>>(mut self, bytes: B) -> Self {
        self.payload = Some(Payload::Ready(bytes.into()));
        self
    }

    /// Set a payload producer, invoked once when the task is about to be
    /// sent
    pub fn payload_with<F>(mut self, produce: F) -> Self
    where
        F: FnOnce() -> Vec<u8> + Send + 'static,
    {
        self.payload = Some(Payload::Producer(Box::new(produce)));
        self
    }

    /// Attach a response parser
    pub fn parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(&[u8], &Task) -> ParseResult + Send + Sync + 'static,
    {
        self.parser = Some(Arc::new(parser));
        self
    }

    /// Build the task and its completion future
    pub fn build(self) -> Command {
        let (sender, receiver) = oneshot::channel();
        let task = Arc::new(Task {
            name: self.name,
            priority: self.priority,
            retries: AtomicU32::new(self.retries),
            timeout: self.timeout,
            delay_before: self.delay_before,
            clear_queue: self.clear_queue,
            payload: Mutex::new(self.payload),
            parser: self.parser,
            completion: Mutex::new(Some(sender)),
        });
        Command {
            task,
            future: CommandFuture { receiver },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let command = Task::builder("power_on").build();
        let task = command.task();
        assert_eq!(task.name(), "power_on");
        assert_eq!(task.priority(), Priority::Normal);
        assert_eq!(task.retries_remaining(), 3);
        assert!(!task.clear_queue());
        assert!(!task.has_parser());
    }

    #[test]
    fn test_payload_producer_runs_once() {
        use std::sync::atomic::AtomicUsize;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let command = Task::builder("query")
            .payload_with(move || {
                calls_in.fetch_add(1, Ordering::SeqCst);
                b"QRY?\r".to_vec()
            })
            .build();

        let task = command.task();
        assert_eq!(task.payload_bytes(), b"QRY?\r");
        assert_eq!(task.payload_bytes(), b"QRY?\r");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_resolves_once() {
        let Command { task, future } = Task::builder("once").build();

        assert!(task.success(Value::Bool(true)));
        assert!(!task.abort("late"));
        assert!(task.is_complete());

        assert_eq!(future.await, TaskOutcome::Success(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_dropped_task_yields_error_outcome() {
        let Command { task, future } = Task::builder("dropped").build();
        drop(task);
        assert!(matches!(future.await, TaskOutcome::Error(_)));
    }

    #[test]
    fn test_take_retry_counts_down() {
        let command = Task::builder("retry").retries(2).build();
        let task = command.task();

        assert!(task.take_retry());
        assert!(task.take_retry());
        assert!(!task.take_retry());
        assert_eq!(task.retries_remaining(), 0);
    }

    #[test]
    fn test_parser_panic_becomes_abort() {
        let command = Task::builder("bad-parser")
            .parser(|_data, _task| panic!("driver bug"))
            .build();

        let result = command.task().parse(b"anything");
        assert!(matches!(result, ParseResult::Abort(_)));
    }

    #[test]
    fn test_parser_receives_bytes() {
        let command = Task::builder("echo")
            .parser(|data, _task| {
                ParseResult::Success(Value::String(String::from_utf8_lossy(data).to_string()))
            })
            .build();

        let result = command.task().parse(b"OK");
        assert_eq!(result, ParseResult::Success(Value::String("OK".into())));
    }
}
