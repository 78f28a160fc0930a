//! Publish/subscribe orchestration over the stream log.
//!
//! Delivery contract: at-least-once from the log to a consumer group, and
//! at-most-once per handler invocation for a delivered message (a handler
//! failure is logged and the message is still acknowledged). Handlers must be
//! idempotent; application-level retry belongs to the task queue, not here.
//! The one exception is an entry that cannot even be unmarshaled: it is left
//! un-acknowledged so the store's pending-entry redelivery retries it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, mpsc};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use meridian_core::CorrelationId;
use meridian_events::{Envelope, SchemaError, Stream, WireError, schema, wire};

use crate::config::BusConfig;

use super::log::{GroupInfo, LogEntry, LogError, StreamInfo, StreamLog};
use super::memory::InMemoryLog;

/// Consumer group created on every stream at connect time.
pub const DEFAULT_GROUP: &str = "default";

/// Event bus failure taxonomy.
#[derive(Debug, Error)]
pub enum BusError {
    /// Operation attempted outside the connected lifecycle window.
    #[error("event bus is not connected")]
    NotConnected,

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Store(#[from] LogError),

    /// A correlation wait exceeded its window. The caller decides whether to
    /// retry.
    #[error("timed out after {timeout:?} waiting for {event_type}")]
    Timeout {
        event_type: String,
        timeout: Duration,
    },
}

/// What a handler tells the consume loop after seeing an envelope.
#[derive(Debug)]
pub enum HandlerVerdict {
    /// Processed (or deliberately ignored). The loop moves on.
    Handled,
    /// Remove this handler after the current message (one-shot handlers).
    Unsubscribe,
    /// Processing failed. Logged with context; the message is still
    /// acknowledged.
    Failed(String),
}

/// Handler invoked for every matching envelope, serially per message.
pub type EventHandler = Arc<dyn Fn(&Envelope) -> HandlerVerdict + Send + Sync>;

/// Options for [`EventBus::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Override the configured retention cap for this append.
    pub max_len: Option<usize>,
}

/// Options for [`EventBus::subscribe`].
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub group: String,
    /// Consumer name within the group; defaults to a unique per-call name.
    pub consumer: String,
    /// Entries read per loop iteration (default from [`BusConfig`]).
    pub count: Option<usize>,
    /// Blocking read window per iteration (default from [`BusConfig`]).
    pub block_ms: Option<u64>,
    /// Where a newly created group starts: `"0"` = full history, `"$"` = new
    /// entries only.
    pub start_id: String,
}

impl SubscribeOptions {
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            group: name.into(),
            consumer: format!("consumer-{}", Uuid::now_v7()),
            count: None,
            block_ms: None,
            start_id: "0".to_string(),
        }
    }

    pub fn with_consumer(mut self, name: impl Into<String>) -> Self {
        self.consumer = name.into();
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_block_ms(mut self, block_ms: u64) -> Self {
        self.block_ms = Some(block_ms);
        self
    }

    pub fn starting_at(mut self, start_id: impl Into<String>) -> Self {
        self.start_id = start_id.into();
        self
    }
}

/// Handlers are registered under the stream plus the exact set of event
/// types they subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandlerKey {
    stream: Stream,
    types: BTreeSet<String>,
}

impl HandlerKey {
    fn new(stream: Stream, event_types: &[&str]) -> Self {
        Self {
            stream,
            types: event_types.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[derive(Clone)]
struct RegisteredHandler {
    id: u64,
    handler: EventHandler,
}

type HandlerRegistry = Arc<RwLock<HashMap<HandlerKey, Vec<RegisteredHandler>>>>;
type LoopIdentity = (Stream, String, String);

/// Reliable publish/subscribe over an external ordered log.
///
/// Lifecycle: *disconnected → connected → disconnected*. Every operation
/// fails with [`BusError::NotConnected`] outside the connected window.
/// Consume loops are supervised threads owned by the bus; `disconnect` joins
/// all of them before returning.
pub struct EventBus {
    log: Arc<dyn StreamLog>,
    config: BusConfig,
    connected: Arc<AtomicBool>,
    handlers: HandlerRegistry,
    next_handler_id: AtomicU64,
    loops: Mutex<Vec<thread::JoinHandle<()>>>,
    active_loops: Mutex<HashSet<LoopIdentity>>,
}

impl EventBus {
    pub fn new(log: Arc<dyn StreamLog>, config: BusConfig) -> Self {
        Self {
            log,
            config,
            connected: Arc::new(AtomicBool::new(false)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_handler_id: AtomicU64::new(1),
            loops: Mutex::new(Vec::new()),
            active_loops: Mutex::new(HashSet::new()),
        }
    }

    /// Bus over an in-memory log, for tests and local development.
    pub fn in_memory(config: BusConfig) -> Self {
        Self::new(Arc::new(InMemoryLog::new()), config)
    }

    /// Bus over Redis Streams.
    #[cfg(feature = "redis")]
    pub fn redis(config: BusConfig) -> Result<Self, BusError> {
        let log = super::redis_streams::RedisLog::new(&config)?;
        Ok(Self::new(Arc::new(log), config))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Establish log connections and eagerly create the default consumer
    /// group on every known stream (pre-existing groups are fine; any other
    /// creation failure is fatal).
    pub fn connect(&self) -> Result<(), BusError> {
        if self.is_connected() {
            return Ok(());
        }
        self.log.connect()?;
        for stream in Stream::ALL {
            self.log.create_group(stream, DEFAULT_GROUP, "0")?;
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("event bus connected");
        Ok(())
    }

    /// Flip to disconnected and join every consume loop. Loops observe the
    /// flag within one blocking-read window.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<_> = self.loops.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.active_loops.lock().unwrap().clear();
        self.log.disconnect();
        info!("event bus disconnected");
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }

    /// Validate, marshal and durably append one envelope. Returns the
    /// store-assigned message id.
    pub fn publish(&self, envelope: Envelope, options: PublishOptions) -> Result<String, BusError> {
        self.ensure_connected()?;
        schema::validate(&envelope)?;

        let fields = wire::marshal(&envelope);
        let max_len = options.max_len.or(self.config.max_stream_len);
        let message_id = self.log.append(envelope.stream(), &fields, max_len)?;

        info!(
            event_id = %envelope.id(),
            message_id = %message_id,
            stream = %envelope.stream(),
            event_type = %envelope.event_type(),
            correlation_id = ?envelope.correlation_id(),
            "event published"
        );
        Ok(message_id)
    }

    /// Register a handler for `event_types` on `stream` and start a consume
    /// loop for `(stream, group, consumer)` unless one is already running.
    ///
    /// Multiple handlers may share a `(stream, type-set)` key; each is
    /// invoked independently per message. Returns the handler registration
    /// id.
    pub fn subscribe<H>(
        &self,
        stream: Stream,
        event_types: &[&str],
        handler: H,
        options: SubscribeOptions,
    ) -> Result<u64, BusError>
    where
        H: Fn(&Envelope) -> HandlerVerdict + Send + Sync + 'static,
    {
        self.ensure_connected()?;
        self.log.create_group(stream, &options.group, &options.start_id)?;

        let key = HandlerKey::new(stream, event_types);
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push(RegisteredHandler {
                id: handler_id,
                handler: Arc::new(handler),
            });

        let identity: LoopIdentity = (stream, options.group.clone(), options.consumer.clone());
        let mut active = self.active_loops.lock().unwrap();
        if !active.contains(&identity) {
            active.insert(identity);
            let worker = ConsumeLoop {
                log: Arc::clone(&self.log),
                connected: Arc::clone(&self.connected),
                handlers: Arc::clone(&self.handlers),
                key,
                stream,
                group: options.group.clone(),
                consumer: options.consumer.clone(),
                count: options.count.unwrap_or(self.config.default_read_count),
                block_ms: options.block_ms.unwrap_or(self.config.default_block_ms),
                pause: Duration::from_millis(self.config.error_pause_ms),
            };
            let join = thread::Builder::new()
                .name(format!("consume-{}-{}", stream, options.group))
                .spawn(move || worker.run())
                .expect("failed to spawn consume loop thread");
            self.loops.lock().unwrap().push(join);
        }
        drop(active);

        debug!(
            stream = %stream,
            group = %options.group,
            consumer = %options.consumer,
            event_types = ?event_types,
            "subscription registered"
        );
        Ok(handler_id)
    }

    /// Block until an event of `event_type` with the given correlation id
    /// arrives on `stream`, or fail with [`BusError::Timeout`].
    ///
    /// Built on an ephemeral, uniquely-named consumer group starting at the
    /// stream tail; the one-shot handler unregisters itself on resolution and
    /// the emptied consume loop winds down.
    pub fn wait_for_event(
        &self,
        stream: Stream,
        event_type: &str,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> Result<Envelope, BusError> {
        self.ensure_connected()?;

        let group = format!("waiter-{}", Uuid::now_v7());
        let (tx, rx) = mpsc::channel::<Envelope>();
        let tx = Mutex::new(tx);

        let handler_id = self.subscribe(
            stream,
            &[event_type],
            move |envelope: &Envelope| {
                if envelope.correlation_id() == Some(correlation_id) {
                    if let Ok(tx) = tx.lock() {
                        let _ = tx.send(envelope.clone());
                    }
                    HandlerVerdict::Unsubscribe
                } else {
                    HandlerVerdict::Handled
                }
            },
            SubscribeOptions::group(&group)
                .with_consumer("waiter")
                .starting_at("$"),
        )?;

        match rx.recv_timeout(timeout) {
            Ok(envelope) => Ok(envelope),
            Err(_) => {
                self.unregister(stream, &[event_type], handler_id);
                Err(BusError::Timeout {
                    event_type: event_type.to_string(),
                    timeout,
                })
            }
        }
    }

    fn unregister(&self, stream: Stream, event_types: &[&str], handler_id: u64) {
        let key = HandlerKey::new(stream, event_types);
        let mut handlers = self.handlers.write().unwrap();
        if let Some(list) = handlers.get_mut(&key) {
            list.retain(|h| h.id != handler_id);
        }
    }

    /// Requeue messages a group has left pending for at least `min_idle`:
    /// re-append the original fields, then acknowledge the stale delivery.
    ///
    /// Stores that cannot enumerate pending entries yield `Ok(0)`.
    pub fn republish_dead_letters(
        &self,
        stream: Stream,
        group: &str,
        min_idle: Duration,
    ) -> Result<usize, BusError> {
        self.ensure_connected()?;

        let pending = match self.log.pending(stream, group) {
            Ok(pending) => pending,
            Err(LogError::Unsupported) => {
                debug!(stream = %stream, group, "store cannot enumerate pending entries");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut republished = 0;
        for entry in pending.into_iter().filter(|p| p.idle >= min_idle) {
            let Some(stored) = self.log.read_one(stream, &entry.id)? else {
                // Trimmed by retention; nothing left to recover.
                self.log.ack(stream, group, &entry.id)?;
                continue;
            };
            let fields: Vec<(String, String)> = stored.fields.into_iter().collect();
            self.log.append(stream, &fields, self.config.max_stream_len)?;
            self.log.ack(stream, group, &entry.id)?;
            republished += 1;
        }

        if republished > 0 {
            info!(stream = %stream, group, republished, "republished dead letters");
        }
        Ok(republished)
    }

    pub fn stream_info(&self, stream: Stream) -> Result<StreamInfo, BusError> {
        self.ensure_connected()?;
        Ok(self.log.stream_info(stream)?)
    }

    pub fn group_info(&self, stream: Stream) -> Result<Vec<GroupInfo>, BusError> {
        self.ensure_connected()?;
        Ok(self.log.group_info(stream)?)
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// One supervised consume loop: `(stream, group, consumer)`.
struct ConsumeLoop {
    log: Arc<dyn StreamLog>,
    connected: Arc<AtomicBool>,
    handlers: HandlerRegistry,
    key: HandlerKey,
    stream: Stream,
    group: String,
    consumer: String,
    count: usize,
    block_ms: u64,
    pause: Duration,
}

impl ConsumeLoop {
    fn run(self) {
        debug!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            "consume loop started"
        );

        while self.connected.load(Ordering::SeqCst) {
            if !self.has_handlers() {
                debug!(
                    stream = %self.stream,
                    group = %self.group,
                    "no handlers remain; consume loop exiting"
                );
                break;
            }

            let entries = match self.log.read_group(
                self.stream,
                &self.group,
                &self.consumer,
                self.count,
                self.block_ms,
            ) {
                Ok(entries) => entries,
                Err(e) => {
                    error!(
                        stream = %self.stream,
                        group = %self.group,
                        error = %e,
                        "stream read failed; pausing before retry"
                    );
                    thread::sleep(self.pause);
                    continue;
                }
            };

            for entry in entries {
                self.process(entry);
            }
        }

        debug!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            "consume loop stopped"
        );
    }

    fn has_handlers(&self) -> bool {
        self.handlers
            .read()
            .unwrap()
            .get(&self.key)
            .map(|list| !list.is_empty())
            .unwrap_or(false)
    }

    fn process(&self, entry: LogEntry) {
        let envelope = match wire::unmarshal(&entry.fields) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Left un-acked: the store's pending-entry redelivery retries it.
                warn!(
                    stream = %self.stream,
                    message_id = %entry.id,
                    error = %e,
                    "failed to unmarshal entry; left pending"
                );
                return;
            }
        };

        if self.key.types.contains(envelope.event_type()) {
            // Snapshot so dispatch never holds the registry lock while
            // handlers run; a handler registered after this point need not
            // see this message.
            let snapshot: Vec<RegisteredHandler> = self
                .handlers
                .read()
                .unwrap()
                .get(&self.key)
                .cloned()
                .unwrap_or_default();

            let mut remove = Vec::new();
            for registered in &snapshot {
                match (registered.handler)(&envelope) {
                    HandlerVerdict::Handled => {}
                    HandlerVerdict::Unsubscribe => remove.push(registered.id),
                    HandlerVerdict::Failed(reason) => {
                        error!(
                            stream = %self.stream,
                            event_type = %envelope.event_type(),
                            message_id = %entry.id,
                            error = %reason,
                            "event handler failed"
                        );
                    }
                }
            }

            if !remove.is_empty() {
                let mut handlers = self.handlers.write().unwrap();
                if let Some(list) = handlers.get_mut(&self.key) {
                    list.retain(|h| !remove.contains(&h.id));
                }
            }
        }

        // Acknowledge matched and non-matching entries alike; only
        // unmarshal failures stay pending.
        if let Err(e) = self.log.ack(self.stream, &self.group, &entry.id) {
            error!(
                stream = %self.stream,
                group = %self.group,
                message_id = %entry.id,
                error = %e,
                "acknowledgment failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::EventId;
    use serde_json::json;
    use std::time::Instant;

    fn test_config() -> BusConfig {
        BusConfig {
            default_read_count: 10,
            default_block_ms: 50,
            error_pause_ms: 10,
            ..BusConfig::default()
        }
    }

    fn connected_bus(log: Arc<InMemoryLog>) -> Arc<EventBus> {
        let bus = EventBus::new(log, test_config());
        bus.connect().expect("connect");
        Arc::new(bus)
    }

    fn market_event() -> Envelope {
        Envelope::new(
            Stream::Market,
            "market.data.collected",
            1,
            json!({"symbols": ["NVDA", "TSLA"]}),
        )
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
    fn operations_require_connection() {
        let bus = EventBus::in_memory(test_config());
        assert!(matches!(
            bus.publish(market_event(), PublishOptions::default()),
            Err(BusError::NotConnected)
        ));
        assert!(matches!(
            bus.stream_info(Stream::Market),
            Err(BusError::NotConnected)
        ));
    }

    #[test]
    fn publish_validates_before_appending() {
        let log = Arc::new(InMemoryLog::new());
        let bus = connected_bus(Arc::clone(&log));

        let unknown = Envelope::new(Stream::Market, "market.rumor", 1, json!({}));
        assert!(matches!(
            bus.publish(unknown, PublishOptions::default()),
            Err(BusError::Schema(SchemaError::UnknownEventType(_)))
        ));

        let invalid = Envelope::new(Stream::Market, "market.data.collected", 1, json!({}));
        assert!(matches!(
            bus.publish(invalid, PublishOptions::default()),
            Err(BusError::Schema(SchemaError::SchemaValidation { .. }))
        ));

        // Neither attempt appended anything.
        assert_eq!(bus.stream_info(Stream::Market).unwrap().length, 0);
    }

    #[test]
    fn publish_appends_and_returns_message_id() {
        let bus = connected_bus(Arc::new(InMemoryLog::new()));
        let message_id = bus
            .publish(market_event(), PublishOptions::default())
            .expect("publish");
        assert!(!message_id.is_empty());
        assert_eq!(bus.stream_info(Stream::Market).unwrap().length, 1);
    }

    #[test]
    fn subscribe_dispatches_matching_and_drops_others() {
        let bus = connected_bus(Arc::new(InMemoryLog::new()));
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe(
            Stream::Content,
            &["content.generated"],
            move |envelope| {
                sink.lock().unwrap().push(envelope.event_type().to_string());
                HandlerVerdict::Handled
            },
            SubscribeOptions::group("workers"),
        )
        .expect("subscribe");

        bus.publish(
            Envelope::new(
                Stream::Content,
                "content.file.processed",
                1,
                json!({"file_id": "f1", "status": "done"}),
            ),
            PublishOptions::default(),
        )
        .unwrap();
        bus.publish(
            Envelope::new(
                Stream::Content,
                "content.generated",
                1,
                json!({"content_id": "c1", "content_type": "brief"}),
            ),
            PublishOptions::default(),
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            seen.lock().unwrap().len() == 1
        }));
        assert_eq!(seen.lock().unwrap()[0], "content.generated");

        bus.disconnect();
    }

    #[test]
    fn same_group_consumers_compete_for_messages() {
        let log = Arc::new(InMemoryLog::new());
        let bus_a = connected_bus(Arc::clone(&log));
        let bus_b = connected_bus(Arc::clone(&log));

        let seen_a: Arc<Mutex<Vec<EventId>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_b: Arc<Mutex<Vec<EventId>>> = Arc::new(Mutex::new(Vec::new()));

        for (bus, seen, consumer) in [
            (&bus_a, &seen_a, "consumer-a"),
            (&bus_b, &seen_b, "consumer-b"),
        ] {
            let sink = Arc::clone(seen);
            bus.subscribe(
                Stream::Market,
                &["market.data.collected"],
                move |envelope| {
                    sink.lock().unwrap().push(envelope.id());
                    HandlerVerdict::Handled
                },
                SubscribeOptions::group("collectors").with_consumer(consumer),
            )
            .expect("subscribe");
        }

        let producer = connected_bus(Arc::clone(&log));
        for _ in 0..10 {
            producer
                .publish(market_event(), PublishOptions::default())
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(3), || {
            seen_a.lock().unwrap().len() + seen_b.lock().unwrap().len() == 10
        }));

        // Exclusivity: no event delivered to both consumers.
        let a = seen_a.lock().unwrap().clone();
        let b = seen_b.lock().unwrap().clone();
        assert!(a.iter().all(|id| !b.contains(id)));

        bus_a.disconnect();
        bus_b.disconnect();
        producer.disconnect();
    }

    #[test]
    fn different_groups_each_see_every_message() {
        let log = Arc::new(InMemoryLog::new());
        let bus_a = connected_bus(Arc::clone(&log));
        let bus_b = connected_bus(Arc::clone(&log));

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));

        for (bus, seen, group) in [(&bus_a, &seen_a, "alerts"), (&bus_b, &seen_b, "audit")] {
            let sink = Arc::clone(seen);
            bus.subscribe(
                Stream::Market,
                &["market.data.collected"],
                move |envelope| {
                    sink.lock().unwrap().push(envelope.id());
                    HandlerVerdict::Handled
                },
                SubscribeOptions::group(group),
            )
            .expect("subscribe");
        }

        let producer = connected_bus(Arc::clone(&log));
        for _ in 0..5 {
            producer
                .publish(market_event(), PublishOptions::default())
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(3), || {
            seen_a.lock().unwrap().len() == 5 && seen_b.lock().unwrap().len() == 5
        }));

        bus_a.disconnect();
        bus_b.disconnect();
        producer.disconnect();
    }

    #[test]
    fn wait_for_event_resolves_on_matching_correlation() {
        let bus = connected_bus(Arc::new(InMemoryLog::new()));
        let correlation = CorrelationId::new();

        let publisher = Arc::clone(&bus);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            // A same-type event with a different correlation must not resolve
            // the wait.
            publisher
                .publish(
                    Envelope::new(
                        Stream::Ai,
                        "ai.consultation.completed",
                        1,
                        json!({"consultation_id": "other"}),
                    )
                    .correlated(CorrelationId::new()),
                    PublishOptions::default(),
                )
                .unwrap();
            publisher
                .publish(
                    Envelope::new(
                        Stream::Ai,
                        "ai.consultation.completed",
                        1,
                        json!({"consultation_id": "mine"}),
                    )
                    .correlated(correlation),
                    PublishOptions::default(),
                )
                .unwrap();
        });

        let resolved = bus
            .wait_for_event(
                Stream::Ai,
                "ai.consultation.completed",
                correlation,
                Duration::from_secs(3),
            )
            .expect("wait_for_event");
        assert_eq!(resolved.correlation_id(), Some(correlation));
        assert_eq!(resolved.data()["consultation_id"], json!("mine"));

        handle.join().unwrap();
        bus.disconnect();
    }

    #[test]
    fn wait_for_event_times_out_without_a_match() {
        let bus = connected_bus(Arc::new(InMemoryLog::new()));
        let started = Instant::now();
        let result = bus.wait_for_event(
            Stream::Ai,
            "ai.consultation.completed",
            CorrelationId::new(),
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(BusError::Timeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(50));
        bus.disconnect();
    }

    #[test]
    fn unmarshalable_entries_stay_pending() {
        let log = Arc::new(InMemoryLog::new());
        let bus = connected_bus(Arc::clone(&log));

        bus.subscribe(
            Stream::User,
            &["user.registered"],
            |_| HandlerVerdict::Handled,
            SubscribeOptions::group("mailer"),
        )
        .expect("subscribe");

        // Raw garbage appended behind the bus's back.
        log.append(
            Stream::User,
            &[("junk".to_string(), "data".to_string())],
            None,
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            log.pending(Stream::User, "mailer")
                .map(|p| p.len() == 1)
                .unwrap_or(false)
        }));

        bus.disconnect();
    }

    #[test]
    fn republish_dead_letters_reclaims_idle_entries() {
        let log = Arc::new(InMemoryLog::new());
        let bus = connected_bus(Arc::clone(&log));

        bus.publish(market_event(), PublishOptions::default())
            .unwrap();

        // A consumer reads but never acks; the entry goes stale.
        log.create_group(Stream::Market, "stalled", "0").unwrap();
        let read = log
            .read_group(Stream::Market, "stalled", "c1", 10, 10)
            .unwrap();
        assert_eq!(read.len(), 1);

        let republished = bus
            .republish_dead_letters(Stream::Market, "stalled", Duration::ZERO)
            .expect("republish");
        assert_eq!(republished, 1);
        assert_eq!(bus.stream_info(Stream::Market).unwrap().length, 2);
        assert!(log.pending(Stream::Market, "stalled").unwrap().is_empty());

        bus.disconnect();
    }

    #[test]
    fn republish_returns_zero_when_store_cannot_enumerate() {
        let log = Arc::new(InMemoryLog::new().with_pending_unsupported());
        let bus = connected_bus(log);
        assert_eq!(
            bus.republish_dead_letters(Stream::Market, "any", Duration::ZERO)
                .expect("republish"),
            0
        );
        bus.disconnect();
    }

    #[test]
    fn disconnect_stops_consume_loops_and_gates_operations() {
        let bus = connected_bus(Arc::new(InMemoryLog::new()));
        bus.subscribe(
            Stream::System,
            &["system.service.health"],
            |_| HandlerVerdict::Handled,
            SubscribeOptions::group("monitors"),
        )
        .expect("subscribe");

        bus.disconnect();
        assert!(matches!(
            bus.publish(market_event(), PublishOptions::default()),
            Err(BusError::NotConnected)
        ));
    }
}
