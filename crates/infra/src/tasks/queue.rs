//! Task queue: dispatch, bounded execution, retry, health reporting.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use meridian_core::TaskId;
use meridian_events::{Envelope, Stream};

use crate::config::TaskQueueConfig;
use crate::event_bus::{BusError, EventBus, HandlerVerdict, PublishOptions, SubscribeOptions};

use super::types::{TaskDefinition, TaskResult, TaskStats};

/// Fixed consumer group the queue subscribes under. Worker processes sharing
/// it compete for distinct tasks.
pub const TASK_QUEUE_GROUP: &str = "task-queue";

/// Handler invoked per task attempt. `Ok` carries the task's output value.
pub type TaskHandler = Arc<dyn Fn(&TaskDefinition) -> Result<JsonValue, String> + Send + Sync>;

#[derive(Debug, Error)]
pub enum TaskQueueError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("failed to encode task: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Default, Clone)]
struct Counters {
    processed: u64,
    succeeded: u64,
    failed: u64,
    retried: u64,
}

/// Shared state between the subscription handler, the scheduler and worker
/// threads.
struct QueueCore {
    bus: Arc<EventBus>,
    config: TaskQueueConfig,
    handlers: RwLock<HashMap<String, TaskHandler>>,
    /// In-flight executions, keyed by task id. The cap is enforced against
    /// this set, not a fixed worker pool.
    running: Mutex<HashSet<TaskId>>,
    counters: Mutex<Counters>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// A deferred dispatch: scheduled-for-later tasks and back-pressure
/// re-attempts both land here.
struct Deferred {
    due: Instant,
    seq: u64,
    task: TaskDefinition,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    // Reversed: BinaryHeap is a max-heap, we want the earliest due first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.due.cmp(&self.due).then(other.seq.cmp(&self.seq))
    }
}

/// Delay queue owned by the task queue. Replaces ad-hoc one-shot timers so
/// `stop()` can cancel every outstanding deferral by joining one thread.
struct SchedulerState {
    heap: Mutex<BinaryHeap<Deferred>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        }
    }

    fn defer(&self, due: Instant, task: TaskDefinition) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().unwrap().push(Deferred { due, seq, task });
        self.wakeup.notify_all();
    }

    fn stop(&self) {
        // Taken under the heap lock: the loop holds it from shutdown check to
        // wait, so the notify can't slip into that window and get lost.
        let _heap = self.heap.lock().unwrap();
        self.shutdown.store(true, Ordering::SeqCst);
        self.wakeup.notify_all();
    }
}

fn scheduler_loop(state: Arc<SchedulerState>, core: Arc<QueueCore>) {
    let mut heap = state.heap.lock().unwrap();
    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let now = Instant::now();
        match heap.peek().map(|d| d.due) {
            Some(due) if due <= now => {
                if let Some(deferred) = heap.pop() {
                    drop(heap);
                    dispatch(&core, deferred.task, &state);
                    heap = state.heap.lock().unwrap();
                }
            }
            Some(due) => {
                let (guard, _timed_out) = state.wakeup.wait_timeout(heap, due - now).unwrap();
                heap = guard;
            }
            None => {
                heap = state.wakeup.wait(heap).unwrap();
            }
        }
    }
}

/// Route one received task: defer, back-pressure, abandon, or execute.
fn dispatch(core: &Arc<QueueCore>, task: TaskDefinition, scheduler: &Arc<SchedulerState>) {
    if let Some(at) = task.scheduled_for {
        let now = Utc::now();
        if at > now {
            let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
            debug!(
                task_id = %task.id,
                task_type = %task.task_type,
                delay_ms = delay.as_millis() as u64,
                "task deferred until its scheduled time"
            );
            scheduler.defer(Instant::now() + delay, task);
            return;
        }
    }

    {
        let mut running = core.running.lock().unwrap();
        if running.len() >= core.config.max_concurrent {
            drop(running);
            debug!(task_id = %task.id, "concurrency cap reached; deferring");
            scheduler.defer(Instant::now() + core.config.backpressure_delay, task);
            return;
        }
        if !core.handlers.read().unwrap().contains_key(&task.task_type) {
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                "no handler registered; task abandoned"
            );
            return;
        }
        running.insert(task.id);
    }

    let worker_core = Arc::clone(core);
    let handle = thread::Builder::new()
        .name(format!("task-{}", task.task_type))
        .spawn(move || execute(worker_core, task))
        .expect("failed to spawn task worker thread");

    let mut workers = core.workers.lock().unwrap();
    workers.retain(|h| !h.is_finished());
    workers.push(handle);
}

/// Worker-thread body: run the retry loop, settle counters, log the outcome.
fn execute(core: Arc<QueueCore>, task: TaskDefinition) {
    let handler = core.handlers.read().unwrap().get(&task.task_type).cloned();
    let Some(handler) = handler else {
        // Registration raced with dispatch; same treatment as unroutable.
        warn!(task_id = %task.id, task_type = %task.task_type, "handler vanished before execution");
        core.running.lock().unwrap().remove(&task.id);
        return;
    };

    let result = run_with_retries(&core, &handler, &task);

    {
        let mut counters = core.counters.lock().unwrap();
        counters.processed += 1;
        if result.success {
            counters.succeeded += 1;
        } else {
            counters.failed += 1;
        }
    }
    core.running.lock().unwrap().remove(&task.id);

    if result.success {
        info!(
            task_id = %result.task_id,
            task_type = %task.task_type,
            execution_time_ms = result.execution_time_ms,
            retry_count = result.retry_count,
            "task completed"
        );
    } else {
        error!(
            task_id = %result.task_id,
            task_type = %task.task_type,
            execution_time_ms = result.execution_time_ms,
            retry_count = result.retry_count,
            error = ?result.error,
            "task failed"
        );
        publish_task_failed(&core, &task, &result);
    }
}

/// Internal retry loop, local to one execution: attempts never re-enter the
/// bus. A task with `max_retries = 2` runs exactly 3 times.
fn run_with_retries(core: &Arc<QueueCore>, handler: &TaskHandler, task: &TaskDefinition) -> TaskResult {
    let started = Instant::now();
    let mut retries: u32 = 0;

    loop {
        match handler(task) {
            Ok(output) => {
                return TaskResult {
                    task_id: task.id,
                    success: true,
                    output: Some(output),
                    error: None,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    retry_count: retries,
                };
            }
            Err(reason) => {
                if retries >= task.max_retries {
                    return TaskResult {
                        task_id: task.id,
                        success: false,
                        output: None,
                        error: Some(reason),
                        execution_time_ms: started.elapsed().as_millis() as u64,
                        retry_count: retries,
                    };
                }
                retries += 1;
                let delay = task.retry.delay_for_attempt(retries);
                debug!(
                    task_id = %task.id,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "task attempt failed; backing off"
                );
                core.counters.lock().unwrap().retried += 1;
                thread::sleep(delay);
            }
        }
    }
}

/// Terminal failures surface on the system stream as well as in logs/stats.
/// Best-effort: a publish failure is logged, never escalated.
fn publish_task_failed(core: &QueueCore, task: &TaskDefinition, result: &TaskResult) {
    let data = json!({
        "id": task.id,
        "task_type": task.task_type,
        "error": result.error.clone().unwrap_or_default(),
        "retry_count": result.retry_count,
    });
    let mut envelope = Envelope::new(Stream::System, "task.failed", 1, data);
    if let Some(correlation) = task.correlation_id {
        envelope = envelope.correlated(correlation);
    }
    if let Some(user) = task.user_id {
        envelope = envelope.from_user(user);
    }
    if let Err(e) = core.bus.publish(envelope, PublishOptions::default()) {
        warn!(task_id = %task.id, error = %e, "failed to publish task.failed event");
    }
}

fn publish_health(core: &Arc<QueueCore>) {
    let running = core.running.lock().unwrap().len();
    let counters = core.counters.lock().unwrap().clone();
    let status = if running >= core.config.max_concurrent {
        "degraded"
    } else {
        "healthy"
    };

    let data = json!({
        "service": "task-queue",
        "status": status,
        "running": running,
        "processed": counters.processed,
        "succeeded": counters.succeeded,
        "failed": counters.failed,
        "retried": counters.retried,
        "memory_bytes": resident_memory_bytes(),
    });
    let envelope = Envelope::new(Stream::System, "system.service.health", 1, data);
    if let Err(e) = core.bus.publish(envelope, PublishOptions::default()) {
        warn!(error = %e, "failed to publish health event");
    }
}

fn resident_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        // /proc/self/statm: total and resident set size, in pages.
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
            {
                return pages * 4096;
            }
        }
    }
    0
}

struct HealthHandle {
    shutdown: mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

/// Typed background-task execution with bounded concurrency, configurable
/// retry/backoff and scheduling, built entirely on the event bus.
pub struct TaskQueue {
    core: Arc<QueueCore>,
    scheduler: Arc<SchedulerState>,
    scheduler_thread: Mutex<Option<thread::JoinHandle<()>>>,
    health: Mutex<Option<HealthHandle>>,
    started: AtomicBool,
}

impl TaskQueue {
    pub fn new(bus: Arc<EventBus>, config: TaskQueueConfig) -> Self {
        Self {
            core: Arc::new(QueueCore {
                bus,
                config,
                handlers: RwLock::new(HashMap::new()),
                running: Mutex::new(HashSet::new()),
                counters: Mutex::new(Counters::default()),
                workers: Mutex::new(Vec::new()),
            }),
            scheduler: Arc::new(SchedulerState::new()),
            scheduler_thread: Mutex::new(None),
            health: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Associate a handler with a task type; re-registration overwrites.
    pub fn register_handler<H>(&self, task_type: impl Into<String>, handler: H)
    where
        H: Fn(&TaskDefinition) -> Result<JsonValue, String> + Send + Sync + 'static,
    {
        let task_type = task_type.into();
        debug!(task_type = %task_type, "task handler registered");
        self.core
            .handlers
            .write()
            .unwrap()
            .insert(task_type, Arc::new(handler));
    }

    /// Subscribe to the system stream for task events, start the deferral
    /// scheduler and the periodic health reporter.
    pub fn start(&self) -> Result<(), TaskQueueError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let state = Arc::clone(&self.scheduler);
        let core = Arc::clone(&self.core);
        let join = thread::Builder::new()
            .name("task-scheduler".to_string())
            .spawn(move || scheduler_loop(state, core))
            .expect("failed to spawn task scheduler thread");
        *self.scheduler_thread.lock().unwrap() = Some(join);

        let core = Arc::clone(&self.core);
        let scheduler = Arc::clone(&self.scheduler);
        self.core.bus.subscribe(
            Stream::System,
            &["task.queued", "task.retry", "task.schedule"],
            move |envelope: &Envelope| {
                match serde_json::from_value::<TaskDefinition>(envelope.data().clone()) {
                    Ok(task) => {
                        dispatch(&core, task, &scheduler);
                        HandlerVerdict::Handled
                    }
                    Err(e) => HandlerVerdict::Failed(format!("undecodable task payload: {e}")),
                }
            },
            SubscribeOptions::group(TASK_QUEUE_GROUP)
                .with_consumer(self.core.config.consumer_name.clone()),
        )?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let core = Arc::clone(&self.core);
        let interval = core.config.health_interval;
        let join = thread::Builder::new()
            .name("task-health".to_string())
            .spawn(move || {
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => publish_health(&core),
                        _ => break,
                    }
                }
            })
            .expect("failed to spawn task health thread");
        *self.health.lock().unwrap() = Some(HealthHandle {
            shutdown: shutdown_tx,
            join,
        });

        info!(
            max_concurrent = self.core.config.max_concurrent,
            consumer = %self.core.config.consumer_name,
            "task queue started"
        );
        Ok(())
    }

    /// Stop the health reporter and scheduler, then join in-flight workers.
    /// The bus subscription winds down with the bus itself on disconnect.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.health.lock().unwrap().take() {
            let _ = handle.shutdown.send(());
            let _ = handle.join.join();
        }

        self.scheduler.stop();
        if let Some(join) = self.scheduler_thread.lock().unwrap().take() {
            let _ = join.join();
        }

        let workers: Vec<_> = self.core.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }

        info!("task queue stopped");
    }

    /// Publish the task for execution and return its id immediately; the
    /// call never waits for execution.
    pub fn queue_task(&self, task: TaskDefinition) -> Result<TaskId, TaskQueueError> {
        self.enqueue(task, "task.queued")
    }

    /// Like [`TaskQueue::queue_task`], with execution deferred until `at`.
    pub fn schedule_task(
        &self,
        task: TaskDefinition,
        at: DateTime<Utc>,
    ) -> Result<TaskId, TaskQueueError> {
        self.enqueue(task.scheduled_at(at), "task.schedule")
    }

    fn enqueue(&self, task: TaskDefinition, event_type: &str) -> Result<TaskId, TaskQueueError> {
        // Fresh identity per enqueue: resubmitting a finished definition is a
        // new task.
        let task = TaskDefinition {
            id: TaskId::new(),
            created_at: Utc::now(),
            ..task
        };
        let task_id = task.id;

        let data = serde_json::to_value(&task)?;
        let mut envelope = Envelope::new(Stream::System, event_type, 1, data);
        if let Some(correlation) = task.correlation_id {
            envelope = envelope.correlated(correlation);
        }
        if let Some(user) = task.user_id {
            envelope = envelope.from_user(user);
        }
        self.core.bus.publish(envelope, PublishOptions::default())?;

        info!(
            task_id = %task_id,
            task_type = %task.task_type,
            event_type,
            "task enqueued"
        );
        Ok(task_id)
    }

    /// Snapshot of the aggregate counters and the in-flight count.
    pub fn stats(&self) -> TaskStats {
        let counters = self.core.counters.lock().unwrap().clone();
        TaskStats {
            processed: counters.processed,
            succeeded: counters.succeeded,
            failed: counters.failed,
            retried: counters.retried,
            running: self.core.running.lock().unwrap().len(),
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::types::RetryConfig;
    use crate::config::BusConfig;
    use crate::event_bus::InMemoryLog;
    use std::sync::atomic::AtomicU32;

    fn fixture(max_concurrent: usize) -> (Arc<EventBus>, TaskQueue) {
        let bus = Arc::new(EventBus::new(
            Arc::new(InMemoryLog::new()),
            BusConfig {
                default_block_ms: 20,
                error_pause_ms: 10,
                ..BusConfig::default()
            },
        ));
        bus.connect().expect("connect");

        let queue = TaskQueue::new(
            Arc::clone(&bus),
            TaskQueueConfig {
                max_concurrent,
                backpressure_delay: Duration::from_millis(20),
                health_interval: Duration::from_secs(3600),
                consumer_name: "test-worker".to_string(),
            },
        );
        (bus, queue)
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn failing_task_runs_initial_attempt_plus_max_retries() {
        let (bus, queue) = fixture(4);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        queue.register_handler("flaky", move |_task| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("simulated failure".to_string())
        });
        queue.start().expect("start");

        queue
            .queue_task(
                TaskDefinition::new("flaky", json!({}))
                    .with_max_retries(2)
                    .with_retry(RetryConfig::fixed(2, 5)),
            )
            .expect("queue");

        assert!(wait_until(Duration::from_secs(5), || {
            queue.stats().processed == 1
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.retried, 2);

        // Terminal failure also lands on the system stream: task.queued +
        // task.failed.
        assert!(wait_until(Duration::from_secs(2), || {
            bus.stream_info(Stream::System).unwrap().length == 2
        }));

        queue.stop();
        bus.disconnect();
    }

    #[test]
    fn successful_task_reports_output_and_counters() {
        let (bus, queue) = fixture(4);

        queue.register_handler("echo", |task: &TaskDefinition| {
            Ok(json!({"echoed": task.payload}))
        });
        queue.start().expect("start");

        queue
            .queue_task(TaskDefinition::new("echo", json!({"n": 7})))
            .expect("queue");

        assert!(wait_until(Duration::from_secs(5), || {
            queue.stats().succeeded == 1
        }));
        let stats = queue.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.retried, 0);
        assert_eq!(stats.running, 0);

        queue.stop();
        bus.disconnect();
    }

    #[test]
    fn concurrency_cap_serializes_execution() {
        let (bus, queue) = fixture(1);
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let in_flight_h = Arc::clone(&in_flight);
        let max_seen_h = Arc::clone(&max_seen);
        queue.register_handler("slow", move |_task| {
            let now = in_flight_h.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen_h.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            in_flight_h.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({}))
        });
        queue.start().expect("start");

        queue
            .queue_task(TaskDefinition::new("slow", json!({"n": 1})))
            .expect("queue");
        queue
            .queue_task(TaskDefinition::new("slow", json!({"n": 2})))
            .expect("queue");

        assert!(wait_until(Duration::from_secs(5), || {
            queue.stats().processed == 2
        }));
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);

        queue.stop();
        bus.disconnect();
    }

    #[test]
    fn scheduled_task_waits_for_its_instant() {
        let (bus, queue) = fixture(4);
        let invoked_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        let sink = Arc::clone(&invoked_at);
        queue.register_handler("later", move |_task| {
            *sink.lock().unwrap() = Some(Instant::now());
            Ok(json!({}))
        });
        queue.start().expect("start");

        let queued_at = Instant::now();
        queue
            .schedule_task(
                TaskDefinition::new("later", json!({})),
                Utc::now() + chrono::Duration::milliseconds(400),
            )
            .expect("schedule");

        thread::sleep(Duration::from_millis(200));
        assert!(invoked_at.lock().unwrap().is_none(), "ran before its scheduled time");

        assert!(wait_until(Duration::from_secs(5), || {
            invoked_at.lock().unwrap().is_some()
        }));
        let ran_at = invoked_at.lock().unwrap().expect("invoked");
        assert!(ran_at.duration_since(queued_at) >= Duration::from_millis(400));

        queue.stop();
        bus.disconnect();
    }

    #[test]
    fn unroutable_task_is_logged_and_abandoned() {
        let (bus, queue) = fixture(4);
        queue.start().expect("start");

        queue
            .queue_task(TaskDefinition::new("ghost", json!({})))
            .expect("queue");

        thread::sleep(Duration::from_millis(300));
        let stats = queue.stats();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.failed, 0);
        // No task.failed either; only the original task.queued is on the
        // stream.
        assert_eq!(bus.stream_info(Stream::System).unwrap().length, 1);

        queue.stop();
        bus.disconnect();
    }

    #[test]
    fn queue_task_returns_before_execution_finishes() {
        let (bus, queue) = fixture(4);
        queue.register_handler("slow", |_task| {
            thread::sleep(Duration::from_millis(300));
            Ok(json!({}))
        });
        queue.start().expect("start");

        let started = Instant::now();
        queue
            .queue_task(TaskDefinition::new("slow", json!({})))
            .expect("queue");
        assert!(started.elapsed() < Duration::from_millis(200));

        assert!(wait_until(Duration::from_secs(5), || {
            queue.stats().processed == 1
        }));
        queue.stop();
        bus.disconnect();
    }

    #[test]
    fn health_reporter_publishes_status() {
        let bus = Arc::new(EventBus::new(
            Arc::new(InMemoryLog::new()),
            BusConfig {
                default_block_ms: 20,
                error_pause_ms: 10,
                ..BusConfig::default()
            },
        ));
        bus.connect().expect("connect");

        let queue = TaskQueue::new(
            Arc::clone(&bus),
            TaskQueueConfig {
                max_concurrent: 2,
                backpressure_delay: Duration::from_millis(20),
                health_interval: Duration::from_millis(50),
                consumer_name: "health-worker".to_string(),
            },
        );

        let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            Stream::System,
            &["system.service.health"],
            move |envelope| {
                sink.lock().unwrap().push(envelope.clone());
                HandlerVerdict::Handled
            },
            SubscribeOptions::group("monitors"),
        )
        .expect("subscribe");

        queue.start().expect("start");

        assert!(wait_until(Duration::from_secs(5), || {
            !seen.lock().unwrap().is_empty()
        }));
        let health = seen.lock().unwrap()[0].clone();
        assert_eq!(health.data()["service"], json!("task-queue"));
        assert_eq!(health.data()["status"], json!("healthy"));

        queue.stop();
        bus.disconnect();
    }
}
