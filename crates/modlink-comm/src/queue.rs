/*!
 * The command queue.
 *
 * Tasks are dispatched against the transport in strict priority order,
 * FIFO within a priority, with at most one task in-flight. Dispatch is
 * gated on the transport's `online` flag; going offline blocks dispatch
 * but never drains lanes or aborts the in-flight task, because the
 * transport's reconnection is expected to recover the session (the armed
 * deadline drives a retry if it does not).
 */
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use modlink_core::types::Priority;

use crate::task::{Command, CommandFuture, ParseResult, Task, TaskOutcome};
use crate::transport::Transport;

/// Observable queue state, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// No task pending or in-flight
    Idle,
    /// Tasks pending but the transport is offline
    AwaitingOnline,
    /// Honouring a task's pre-send delay
    Delaying,
    /// A task has been sent and its deadline is armed
    InFlight,
    /// The last dispatch timed out and the task was requeued
    TimedOutRetrying,
    /// The queue has been terminated
    Terminated,
}

/// The last completed task, kept for retry bookkeeping
#[derive(Debug, Clone)]
pub struct CompletedTask {
    /// The task's name
    pub name: String,
    /// How it completed
    pub outcome: TaskOutcome,
}

#[derive(Default)]
struct Lanes {
    high: VecDeque<Arc<Task>>,
    normal: VecDeque<Arc<Task>>,
    low: VecDeque<Arc<Task>>,
}

impl Lanes {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<Arc<Task>> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn pop_next(&mut self) -> Option<Arc<Task>> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn drain_all(&mut self) -> Vec<Arc<Task>> {
        self.high
            .drain(..)
            .chain(self.normal.drain(..))
            .chain(self.low.drain(..))
            .collect()
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

struct InFlight {
    task: Arc<Task>,
    deadline: Instant,
}

struct QueueInner {
    lanes: Mutex<Lanes>,
    current: Mutex<Option<InFlight>>,
    state: Mutex<QueueState>,
    previous: Mutex<Option<CompletedTask>>,
    online_tx: watch::Sender<bool>,
    notify: Notify,
    terminated: AtomicBool,
}

impl QueueInner {
    fn set_state(&self, state: QueueState) {
        *self.state.lock().expect("queue state lock poisoned") = state;
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn record(&self, task: &Task, outcome: TaskOutcome) {
        task.complete(outcome.clone());
        *self.previous.lock().expect("queue previous lock poisoned") = Some(CompletedTask {
            name: task.name().to_string(),
            outcome,
        });
    }

    /// Take the in-flight slot if it still holds `task`
    fn clear_current(&self, task: &Arc<Task>) -> bool {
        let mut current = self.current.lock().expect("queue current lock poisoned");
        match current.as_ref() {
            Some(in_flight) if Arc::ptr_eq(&in_flight.task, task) => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    fn current_task(&self) -> Option<Arc<Task>> {
        self.current
            .lock()
            .expect("queue current lock poisoned")
            .as_ref()
            .map(|in_flight| in_flight.task.clone())
    }

    fn deadline_of(&self, task: &Arc<Task>) -> Option<Instant> {
        let current = self.current.lock().expect("queue current lock poisoned");
        current
            .as_ref()
            .filter(|in_flight| Arc::ptr_eq(&in_flight.task, task))
            .map(|in_flight| in_flight.deadline)
    }

    fn register_in_flight(&self, task: Arc<Task>) {
        let deadline = Instant::now() + task.timeout();
        *self.current.lock().expect("queue current lock poisoned") =
            Some(InFlight { task, deadline });
    }

    fn requeue_front(&self, task: Arc<Task>) {
        let mut lanes = self.lanes.lock().expect("queue lanes lock poisoned");
        lanes.lane_mut(task.priority()).push_front(task);
    }

    fn drain_pending(&self, reason: &str) {
        let drained = {
            let mut lanes = self.lanes.lock().expect("queue lanes lock poisoned");
            lanes.drain_all()
        };
        for task in drained {
            trace!("Aborting pending task {}: {}", task.name(), reason);
            self.record(&task, TaskOutcome::Abort(reason.to_string()));
        }
    }

    fn abort_in_flight(&self, reason: &str) {
        let taken = self
            .current
            .lock()
            .expect("queue current lock poisoned")
            .take();
        if let Some(in_flight) = taken {
            self.record(&in_flight.task, TaskOutcome::Abort(reason.to_string()));
        }
        self.notify.notify_one();
    }

    /// Route a parser verdict back into queue state
    fn apply_parse_result(&self, task: &Arc<Task>, result: ParseResult) {
        match result {
            ParseResult::Continue => {
                // Re-arm the deadline from this moment; the parser stays
                // attached and the task stays in-flight
                let mut current = self.current.lock().expect("queue current lock poisoned");
                if let Some(in_flight) = current.as_mut() {
                    if Arc::ptr_eq(&in_flight.task, task) {
                        in_flight.deadline = Instant::now() + task.timeout();
                    }
                }
            }
            ParseResult::Success(value) => {
                if self.clear_current(task) {
                    self.record(task, TaskOutcome::Success(value));
                }
            }
            ParseResult::Abort(reason) => {
                if self.clear_current(task) {
                    self.record(task, TaskOutcome::Abort(reason));
                }
            }
            ParseResult::Retry(reason) => {
                if self.clear_current(task) {
                    if task.take_retry() {
                        debug!("Task {} retrying: {}", task.name(), reason);
                        self.requeue_front(task.clone());
                    } else {
                        self.record(task, TaskOutcome::Abort(reason));
                    }
                }
            }
        }
        self.notify.notify_one();
    }
}

/// Non-owning handle given to transports and the read-path dispatcher
#[derive(Clone)]
pub struct QueueHandle {
    inner: Arc<QueueInner>,
}

impl QueueHandle {
    /// Raise or lower the online gate
    pub fn set_online(&self, online: bool) {
        self.inner.online_tx.send_replace(online);
        self.inner.notify.notify_one();
    }

    /// Whether dispatch is currently gated open
    pub fn is_online(&self) -> bool {
        *self.inner.online_tx.borrow()
    }

    /// The task currently in-flight, if any
    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.inner.current_task()
    }

    /// Register a task as in-flight and arm its deadline
    pub fn register_in_flight(&self, task: Arc<Task>) {
        self.inner.register_in_flight(task);
    }

    /// Route a parser verdict back into queue state
    pub fn apply_parse_result(&self, task: &Arc<Task>, result: ParseResult) {
        self.inner.apply_parse_result(task, result);
    }

    /// Abort the in-flight task (transport-initiated, e.g. TLS failure)
    pub fn abort_in_flight(&self, reason: &str) {
        self.inner.abort_in_flight(reason);
    }
}

/// Priority-aware executor of tasks against a transport
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
    worker: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Queue {
    /// Create an idle queue; call [`Queue::start`] to begin dispatching
    pub fn new() -> Self {
        let (online_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                lanes: Mutex::new(Lanes::default()),
                current: Mutex::new(None),
                state: Mutex::new(QueueState::Idle),
                previous: Mutex::new(None),
                online_tx,
                notify: Notify::new(),
                terminated: AtomicBool::new(false),
            }),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// A non-owning handle for the transport and dispatcher
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            inner: self.inner.clone(),
        }
    }

    /// Start the dispatch worker against `transport`
    pub fn start(&self, transport: Arc<dyn Transport>) {
        let mut worker = self.worker.lock().expect("queue worker lock poisoned");
        if worker.is_some() {
            warn!("Queue worker already started");
            return;
        }
        *worker = Some(tokio::spawn(run_worker(self.inner.clone(), transport)));
    }

    /// Enqueue a command; the returned future resolves with its outcome
    pub fn send(&self, command: Command) -> CommandFuture {
        let Command { task, future } = command;
        if self.inner.is_terminated() {
            self.inner.record(&task, TaskOutcome::Abort("terminated".to_string()));
            return future;
        }
        if task.clear_queue() {
            // Displace every pending task now; the in-flight one is left
            // to run to its own completion
            self.inner.drain_pending("cleared");
        }
        {
            let mut lanes = self.inner.lanes.lock().expect("queue lanes lock poisoned");
            lanes.lane_mut(task.priority()).push_back(task);
        }
        self.inner.notify.notify_one();
        future
    }

    /// Number of pending tasks across all lanes
    pub fn len(&self) -> usize {
        self.inner
            .lanes
            .lock()
            .expect("queue lanes lock poisoned")
            .len()
    }

    /// Whether no tasks are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observable queue state
    pub fn state(&self) -> QueueState {
        *self.inner.state.lock().expect("queue state lock poisoned")
    }

    /// Whether the online gate is open
    pub fn is_online(&self) -> bool {
        *self.inner.online_tx.borrow()
    }

    /// The last completed task
    pub fn previous(&self) -> Option<CompletedTask> {
        self.inner
            .previous
            .lock()
            .expect("queue previous lock poisoned")
            .clone()
    }

    /// Stop dispatching; the in-flight task and every pending task
    /// complete as `Abort("terminated")`
    pub fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        self.inner.abort_in_flight("terminated");
        self.inner.drain_pending("terminated");
        self.inner.set_state(QueueState::Terminated);
        self.inner.notify.notify_one();
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(inner: Arc<QueueInner>, transport: Arc<dyn Transport>) {
    let mut online_rx = inner.online_tx.subscribe();

    loop {
        if inner.is_terminated() {
            break;
        }

        if !*online_rx.borrow() {
            inner.set_state(QueueState::AwaitingOnline);
            tokio::select! {
                _ = online_rx.changed() => {}
                _ = inner.notify.notified() => {}
            }
            continue;
        }

        let popped = {
            let mut lanes = inner.lanes.lock().expect("queue lanes lock poisoned");
            lanes.pop_next()
        };
        let Some(task) = popped else {
            inner.set_state(QueueState::Idle);
            tokio::select! {
                _ = inner.notify.notified() => {}
                _ = online_rx.changed() => {}
            }
            continue;
        };

        if task.is_complete() {
            // Aborted while pending (terminate or clear_queue race)
            continue;
        }

        if task.clear_queue() {
            inner.drain_pending("cleared");
        }

        if let Some(delay) = task.delay_before() {
            inner.set_state(QueueState::Delaying);
            tokio::time::sleep(delay).await;
            if inner.is_terminated() {
                inner.record(&task, TaskOutcome::Abort("terminated".to_string()));
                break;
            }
        }

        let payload = task.payload_bytes();
        inner.set_state(QueueState::InFlight);
        trace!("Dispatching task {}", task.name());

        if let Err(e) = transport.send_task(&payload, task.clone()).await {
            // The transport refused the task outright (terminated, TLS
            // failure); a plain missing socket reports Ok(0) instead and
            // lets the deadline drive a retry
            debug!("Transport rejected task {}: {}", task.name(), e);
            inner.clear_current(&task);
            inner.record(&task, TaskOutcome::Abort("disconnect".to_string()));
            continue;
        }

        await_completion(&inner, &task).await;
    }

    inner.abort_in_flight("terminated");
    inner.drain_pending("terminated");
    inner.set_state(QueueState::Terminated);
}

/// Wait until the in-flight task completes, retries, or times out.
///
/// A parser returning `Continue` moves the deadline forward; the loop
/// re-reads it on every wake-up.
async fn await_completion(inner: &Arc<QueueInner>, task: &Arc<Task>) {
    loop {
        let Some(deadline) = inner.deadline_of(task) else {
            // No longer in-flight: completed or requeued by the parser
            return;
        };

        tokio::select! {
            _ = inner.notify.notified() => {
                // Completion, retry, terminate, or a re-armed deadline;
                // loop around and re-read
            }
            _ = tokio::time::sleep_until(deadline) => {
                if inner.clear_current(task) {
                    if task.take_retry() {
                        debug!("Task {} timed out; retrying", task.name());
                        inner.set_state(QueueState::TimedOutRetrying);
                        inner.requeue_front(task.clone());
                    } else {
                        debug!("Task {} timed out; retries exhausted", task.name());
                        inner.record(task, TaskOutcome::Timeout);
                    }
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Dispatcher, ReceivedCallback};
    use async_trait::async_trait;
    use modlink_core::types::Value;
    use std::time::Duration;

    /// Transport that records sends and never responds on its own
    struct SilentTransport {
        dispatcher: Arc<Dispatcher>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl SilentTransport {
        fn new(handle: QueueHandle) -> Arc<Self> {
            let received: ReceivedCallback = Arc::new(|_data, _task| {});
            Arc::new(Self {
                dispatcher: Dispatcher::new(handle, received, None),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for SilentTransport {
        async fn connect(&self, _timeout: Duration) -> crate::error::Result<()> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn terminate(&self) {}

        async fn send(&self, bytes: &[u8]) -> crate::error::Result<usize> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(bytes.len())
        }

        fn dispatcher(&self) -> &Arc<Dispatcher> {
            &self.dispatcher
        }

        async fn start_tls(
            &self,
            _settings: crate::transport::TlsSettings,
        ) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn online_queue() -> (Queue, Arc<SilentTransport>) {
        let queue = Queue::new();
        let transport = SilentTransport::new(queue.handle());
        queue.start(transport.clone());
        queue.handle().set_online(true);
        (queue, transport)
    }

    #[tokio::test]
    async fn test_timeout_retries_then_exhausts() {
        let (queue, transport) = online_queue();

        let start = std::time::Instant::now();
        let outcome = queue
            .send(
                Task::builder("never-answered")
                    .payload(b"PING\r".to_vec())
                    .timeout(Duration::from_millis(100))
                    .retries(2)
                    .build(),
            )
            .await;

        // Dispatched at ~0, ~100, ~200 ms, then completed
        assert_eq!(outcome, TaskOutcome::Timeout);
        assert_eq!(transport.sent_count(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(280), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_parser_success_completes_task() {
        let (queue, transport) = online_queue();

        let future = queue.send(
            Task::builder("query")
                .payload(b"QRY?\r".to_vec())
                .timeout(Duration::from_secs(1))
                .parser(|data, _task| {
                    ParseResult::Success(Value::String(
                        String::from_utf8_lossy(data).trim().to_string(),
                    ))
                })
                .build(),
        );

        // Wait for the dispatch, then feed a response through the reader
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.dispatcher().process_message(b"42\r");

        assert_eq!(future.await, TaskOutcome::Success(Value::String("42".into())));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[tokio::test]
    async fn test_parser_continue_rearms_deadline() {
        let (queue, transport) = online_queue();

        let future = queue.send(
            Task::builder("chunked")
                .payload(b"READ\r".to_vec())
                .timeout(Duration::from_millis(200))
                .retries(0)
                .parser(|data, _task| {
                    if data.ends_with(b"!") {
                        ParseResult::Success(Value::String("OK".into()))
                    } else {
                        ParseResult::Continue
                    }
                })
                .build(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        // First chunk keeps the task in-flight and re-arms the deadline
        transport.dispatcher().process_message(b"partial");
        // Well past the original deadline, but within the re-armed one
        tokio::time::sleep(Duration::from_millis(180)).await;
        transport.dispatcher().process_message(b"done!");

        assert_eq!(future.await, TaskOutcome::Success(Value::String("OK".into())));
        // Only the one dispatch: Continue never re-sends
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_parser_retry_requeues_at_head() {
        let (queue, transport) = online_queue();

        let future = queue.send(
            Task::builder("flaky")
                .payload(b"GO\r".to_vec())
                .timeout(Duration::from_secs(1))
                .retries(1)
                .parser(|data, _task| {
                    if data == b"busy" {
                        ParseResult::Retry("device busy".into())
                    } else {
                        ParseResult::Success(Value::Bool(true))
                    }
                })
                .build(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.dispatcher().process_message(b"busy");
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.dispatcher().process_message(b"ok");

        assert_eq!(future.await, TaskOutcome::Success(Value::Bool(true)));
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_aborts_with_reason() {
        let (queue, transport) = online_queue();

        let future = queue.send(
            Task::builder("always-busy")
                .payload(b"GO\r".to_vec())
                .timeout(Duration::from_secs(1))
                .retries(0)
                .parser(|_data, _task| ParseResult::Retry("device busy".into()))
                .build(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.dispatcher().process_message(b"busy");

        assert_eq!(future.await, TaskOutcome::Abort("device busy".into()));
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_clear_queue_drops_pending_only() {
        let (queue, transport) = online_queue();

        // A dispatches and stays in-flight until it times out
        let fut_a = queue.send(
            Task::builder("a")
                .payload(b"A".to_vec())
                .timeout(Duration::from_millis(150))
                .retries(0)
                .build(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fut_b = queue.send(
            Task::builder("b")
                .payload(b"B".to_vec())
                .timeout(Duration::from_millis(150))
                .retries(0)
                .build(),
        );
        let fut_c = queue.send(
            Task::builder("c")
                .payload(b"C".to_vec())
                .timeout(Duration::from_millis(150))
                .retries(0)
                .clear_queue()
                .build(),
        );

        // B is displaced without ever being dispatched
        assert_eq!(fut_b.await, TaskOutcome::Abort("cleared".into()));
        // A was in-flight and runs to its own completion
        assert_eq!(fut_a.await, TaskOutcome::Timeout);
        // C dispatches next
        assert_eq!(fut_c.await, TaskOutcome::Timeout);

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![b"A".to_vec(), b"C".to_vec()]);
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let queue = Queue::new();
        let transport = SilentTransport::new(queue.handle());
        queue.start(transport.clone());

        // Enqueue while offline so ordering is decided before dispatch
        let fut_low = queue.send(
            Task::builder("low")
                .priority(Priority::Low)
                .payload(b"L".to_vec())
                .timeout(Duration::from_millis(50))
                .retries(0)
                .build(),
        );
        let fut_normal = queue.send(
            Task::builder("normal")
                .payload(b"N".to_vec())
                .timeout(Duration::from_millis(50))
                .retries(0)
                .build(),
        );
        let fut_high = queue.send(
            Task::builder("high")
                .priority(Priority::High)
                .payload(b"H".to_vec())
                .timeout(Duration::from_millis(50))
                .retries(0)
                .build(),
        );

        queue.handle().set_online(true);
        let _ = fut_high.await;
        let _ = fut_normal.await;
        let _ = fut_low.await;

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![b"H".to_vec(), b"N".to_vec(), b"L".to_vec()]);
    }

    #[tokio::test]
    async fn test_offline_blocks_dispatch_without_draining() {
        let (queue, transport) = online_queue();
        queue.handle().set_online(false);

        let _future = queue.send(
            Task::builder("parked")
                .payload(b"P".to_vec())
                .timeout(Duration::from_millis(100))
                .build(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.sent_count(), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.state(), QueueState::AwaitingOnline);
    }

    #[tokio::test]
    async fn test_delay_before_send() {
        let (queue, transport) = online_queue();

        let start = std::time::Instant::now();
        let future = queue.send(
            Task::builder("delayed")
                .payload(b"D".to_vec())
                .delay(Duration::from_millis(100))
                .timeout(Duration::from_millis(50))
                .retries(0)
                .build(),
        );

        let _ = future.await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_drains_everything() {
        let (queue, _transport) = online_queue();

        let fut_a = queue.send(
            Task::builder("in-flight")
                .payload(b"A".to_vec())
                .timeout(Duration::from_secs(10))
                .build(),
        );
        let fut_b = queue.send(
            Task::builder("pending")
                .payload(b"B".to_vec())
                .timeout(Duration::from_secs(10))
                .build(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.terminate();

        assert_eq!(fut_a.await, TaskOutcome::Abort("terminated".into()));
        assert_eq!(fut_b.await, TaskOutcome::Abort("terminated".into()));
        assert_eq!(queue.state(), QueueState::Terminated);

        // Sends after terminate complete immediately
        let outcome = queue
            .send(Task::builder("late").payload(b"L".to_vec()).build())
            .await;
        assert_eq!(outcome, TaskOutcome::Abort("terminated".into()));
    }

    #[tokio::test]
    async fn test_at_most_one_in_flight() {
        let (queue, transport) = online_queue();

        let fut_a = queue.send(
            Task::builder("first")
                .payload(b"1".to_vec())
                .timeout(Duration::from_millis(100))
                .retries(0)
                .build(),
        );
        let fut_b = queue.send(
            Task::builder("second")
                .payload(b"2".to_vec())
                .timeout(Duration::from_millis(100))
                .retries(0)
                .build(),
        );

        // While the first is in-flight the second must not dispatch
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent_count(), 1);

        let _ = fut_a.await;
        let _ = fut_b.await;
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_previous_records_last_completion() {
        let (queue, _transport) = online_queue();

        let _ = queue
            .send(
                Task::builder("short")
                    .payload(b"S".to_vec())
                    .timeout(Duration::from_millis(50))
                    .retries(0)
                    .build(),
            )
            .await;

        let previous = queue.previous().expect("previous task recorded");
        assert_eq!(previous.name, "short");
        assert_eq!(previous.outcome, TaskOutcome::Timeout);
    }
}
