//! Topic-based publish/subscribe bus.
//!
//! # Delivery model
//!
//! ```text
//! publish() ──auth──► bounded mpsc queue ──► single dispatcher
//!                          (backpressure)        │ drop? latency?
//!                                                ▼
//!                                   handlers of topic, in order
//!                                                │ Err / panic
//!                                                ▼
//!                                      capped dead-letter queue
//! ```
//!
//! There is exactly one dispatcher draining one FIFO queue, so per-topic
//! delivery order equals publish order. Chaos latency is slept inside the
//! dispatcher and therefore delays every message queued behind it,
//! regardless of topic.

use crate::error::{AuthError, BusError, HandlerError};
use crate::latency::{clamp_rate, fires, LatencyRange};
use crate::message::{Message, MessageDraft};

use async_trait::async_trait;
use forge_env::{AuthToken, ChaCha8Rng, EnvError, ForgeContext, SubscriptionId, SYSTEM_SENDER};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{BufWriter, Write};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// RNG stream id for bus chaos when no explicit seed is configured.
const BUS_RNG_STREAM: u64 = 0xB05;

/// Configuration for a [`MessageBus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Queue slots before `publish` starts blocking
    pub queue_capacity: usize,

    /// Maximum dead letters retained (oldest evicted first)
    pub dlq_limit: usize,

    /// How often an idle dispatcher re-checks the running flag
    pub poll_interval_ms: u64,

    /// Probability a dequeued message is silently discarded
    pub drop_rate: f64,

    /// Delivery latency slept by the dispatcher before each message
    pub latency_range: Option<LatencyRange>,

    /// Append-only JSONL file receiving one line per successful publish
    pub audit_log_path: Option<PathBuf>,

    /// Seed for the drop/latency RNG
    pub seed: Option<u64>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            dlq_limit: 100,
            poll_interval_ms: 100,
            drop_rate: 0.0,
            latency_range: None,
            audit_log_path: None,
            seed: None,
        }
    }
}

impl BusConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_dlq_limit(mut self, limit: usize) -> Self {
        self.dlq_limit = limit;
        self
    }

    pub fn with_drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate;
        self
    }

    pub fn with_latency(mut self, range: LatencyRange) -> Self {
        self.latency_range = Some(range);
        self
    }

    pub fn with_audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log_path = Some(path.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn normalized(mut self) -> Self {
        self.queue_capacity = self.queue_capacity.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        self.drop_rate = clamp_rate(self.drop_rate);
        self.latency_range = self.latency_range.map(LatencyRange::normalized);
        self
    }
}

/// A subscriber callback.
///
/// Both synchronous and suspending callbacks are registered through this one
/// trait; see [`sync_handler`] and [`async_handler`] for closure adapters.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

/// Adapter for plain synchronous closures.
pub struct SyncHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for SyncHandler<F>
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.0)(message)
    }
}

/// Adapter for closures returning a future.
pub struct AsyncHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for AsyncHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.0)(message.clone()).await
    }
}

/// Wraps a synchronous closure as a handler.
pub fn sync_handler<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(SyncHandler(f))
}

/// Wraps an async closure as a handler.
pub fn async_handler<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(AsyncHandler(f))
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    /// Successful handler invocations
    pub delivered: u64,
    /// Messages discarded by the chaos drop
    pub dropped: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn MessageHandler>,
}

/// Append-only JSONL writer.
struct AuditLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl AuditLog {
    fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    fn append(&mut self, message: &Message) -> Result<(), EnvError> {
        let line = message.to_json_line().map_err(EnvError::serialization)?;
        writeln!(self.writer, "{}", line)
            .and_then(|_| self.writer.flush())
            .map_err(|e| EnvError::ContextError(format!("audit log {}: {}", self.path.display(), e)))
    }
}

struct BusInner<Ctx: ForgeContext> {
    context: Arc<Ctx>,
    config: BusConfig,
    registry: RwLock<HashMap<String, AuthToken>>,
    subscribers: RwLock<HashMap<String, Vec<Subscription>>>,
    dead_letters: Mutex<VecDeque<Message>>,
    tx: mpsc::Sender<Message>,
    /// Parked here while no dispatcher owns it
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    running: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    rng: Mutex<ChaCha8Rng>,
    /// Held across enqueue and append so line order matches queue order
    audit: Option<AsyncMutex<AuditLog>>,
    counters: Counters,
}

/// The message bus. Cheap to clone; clones share one bus.
pub struct MessageBus<Ctx: ForgeContext> {
    inner: Arc<BusInner<Ctx>>,
}

impl<Ctx: ForgeContext> Clone for MessageBus<Ctx> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Ctx: ForgeContext> MessageBus<Ctx> {
    /// Creates a stopped bus. Fails only if the audit log cannot be opened.
    pub fn new(context: Arc<Ctx>, config: BusConfig) -> std::io::Result<Self> {
        let config = config.normalized();
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => context.derive_rng(BUS_RNG_STREAM),
        };
        let audit = config
            .audit_log_path
            .as_deref()
            .map(AuditLog::open)
            .transpose()?
            .map(AsyncMutex::new);

        Ok(Self {
            inner: Arc::new(BusInner {
                context,
                config,
                registry: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                dead_letters: Mutex::new(VecDeque::new()),
                tx,
                rx: Mutex::new(Some(rx)),
                running: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
                rng: Mutex::new(rng),
                audit,
                counters: Counters::default(),
            }),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Starts the dispatcher. A no-op if it is already running.
    pub async fn start(&self) {
        if self.is_running() {
            return;
        }
        // A dispatcher from a previous start may still be winding down
        let previous = self.inner.dispatcher.lock().take();
        if let Some(handle) = previous {
            let _ = handle.await;
        }
        let Some(rx) = self.inner.rx.lock().take() else {
            debug!("dispatcher already owned by a concurrent start");
            return;
        };
        self.inner.running.store(true, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let handle = self
            .inner
            .context
            .spawn("bus-dispatcher", dispatch_loop(inner, rx));
        *self.inner.dispatcher.lock() = Some(handle);
        info!("MessageBus started.");
    }

    /// Flips the running flag. The dispatcher notices within one poll
    /// interval, or after any chaos delay it is currently sleeping.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            info!("MessageBus stopped.");
        }
    }

    /// Stops and waits for the dispatcher task to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Issues a fresh token for `agent_id`, replacing any previous one.
    pub fn register(&self, agent_id: impl Into<String>) -> AuthToken {
        let agent_id = agent_id.into();
        let token = AuthToken::generate();
        let previous = self.inner.registry.write().insert(agent_id.clone(), token.clone());
        if previous.is_some() {
            warn!(agent = %agent_id, "re-registering agent; previous token revoked");
        } else {
            debug!(agent = %agent_id, "registered agent");
        }
        token
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.inner.registry.read().contains_key(agent_id)
    }

    /// Appends `handler` to the topic's ordered handler list.
    pub fn subscribe(&self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) -> SubscriptionId {
        let topic = topic.into();
        let id = SubscriptionId::new();
        debug!(topic = %topic, subscription = %id, "subscribed");
        self.inner
            .subscribers
            .write()
            .entry(topic)
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Subscribes a synchronous closure.
    pub fn subscribe_fn<F>(&self, topic: impl Into<String>, f: F) -> SubscriptionId
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(topic, sync_handler(f))
    }

    /// Removes a subscription. Returns false if it was not found.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let Some(list) = subscribers.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(topic);
        }
        removed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.subscribers.read().get(topic).map_or(0, Vec::len)
    }

    /// Authorizes, validates and enqueues a message.
    ///
    /// Suspends while the queue is full. On success the message has been
    /// queued and written to the audit log (if configured).
    ///
    /// With an audit log, concurrent publishes are serialized from enqueue
    /// through append, so the file lists messages in queue order. The append
    /// is a buffered write plus flush on the calling task.
    pub async fn publish(&self, draft: MessageDraft, auth_token: Option<&AuthToken>) -> Result<Message, BusError> {
        self.authorize(draft.sender(), auth_token)?;
        let message = draft.build(self.inner.context.unix_secs())?;

        let audit = match &self.inner.audit {
            Some(audit) => Some(audit.lock().await),
            None => None,
        };
        self.inner
            .tx
            .send(message.clone())
            .await
            .map_err(|_| EnvError::closed("bus queue"))?;
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);

        if let Some(mut audit) = audit {
            if let Err(e) = audit.append(&message) {
                error!(error = %e, "failed to append audit line");
            }
        }
        debug!(topic = message.topic(), sender = message.sender(), "published");
        Ok(message)
    }

    fn authorize(&self, sender: &str, token: Option<&AuthToken>) -> Result<(), AuthError> {
        let registry = self.inner.registry.read();
        match registry.get(sender) {
            Some(expected) if token == Some(expected) => Ok(()),
            Some(_) => Err(AuthError::TokenMismatch(sender.to_string())),
            // Open until the first registration
            None if registry.is_empty() || sender == SYSTEM_SENDER => Ok(()),
            None => Err(AuthError::Unregistered(sender.to_string())),
        }
    }

    /// Copies of the retained dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<Message> {
        self.inner.dead_letters.lock().iter().cloned().collect()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.inner.dead_letters.lock().len()
    }

    /// Removes and returns all dead letters, oldest first.
    pub fn drain_dead_letters(&self) -> Vec<Message> {
        self.inner.dead_letters.lock().drain(..).collect()
    }

    pub fn stats(&self) -> BusStats {
        self.inner.counters.snapshot()
    }

    /// Messages waiting in the queue.
    pub fn queued(&self) -> usize {
        self.inner.config.queue_capacity - self.inner.tx.capacity()
    }
}

async fn dispatch_loop<Ctx: ForgeContext>(inner: Arc<BusInner<Ctx>>, mut rx: mpsc::Receiver<Message>) {
    let poll = Duration::from_millis(inner.config.poll_interval_ms);
    while inner.running.load(Ordering::Acquire) {
        let message = match tokio::time::timeout(poll, rx.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => continue,
        };
        inner.deliver(message).await;
    }
    *inner.rx.lock() = Some(rx);
    debug!("dispatcher exited");
}

impl<Ctx: ForgeContext> BusInner<Ctx> {
    async fn deliver(&self, message: Message) {
        let delay = {
            let mut rng = self.rng.lock();
            if fires(&mut *rng, self.config.drop_rate) {
                None
            } else {
                Some(self.config.latency_range.map(|range| range.sample(&mut *rng)))
            }
        };
        let Some(delay) = delay else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(topic = message.topic(), "[CHAOS] dropped message in transit");
            return;
        };
        if let Some(delay) = delay.filter(|d| !d.is_none()) {
            self.context.sleep(delay.duration()).await;
        }

        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .subscribers
            .read()
            .get(message.topic())
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default();

        let mut failed = false;
        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle(&message)).catch_unwind().await;
            let failure = match outcome {
                Ok(Ok(())) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(panic) => HandlerError::new(panic_message(panic.as_ref())),
            };
            self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            error!(topic = message.topic(), error = %failure, "Error handling message");
            failed = true;
        }

        if failed {
            self.push_dead_letter(message);
        }
    }

    fn push_dead_letter(&self, message: Message) {
        if self.config.dlq_limit == 0 {
            return;
        }
        let mut dlq = self.dead_letters.lock();
        while dlq.len() >= self.config.dlq_limit {
            dlq.pop_front();
        }
        dlq.push_back(message);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: unknown payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use forge_env::TokioContext;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::time::Instant;

    fn bus(config: BusConfig) -> MessageBus<TokioContext> {
        MessageBus::new(TokioContext::shared(), config).unwrap()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn collector() -> (Arc<Mutex<Vec<Message>>>, Arc<dyn MessageHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = sync_handler(move |m: &Message| {
            sink.lock().push(m.clone());
            Ok(())
        });
        (seen, handler)
    }

    #[tokio::test]
    async fn test_sync_and_async_subscribers() {
        let bus = bus(BusConfig::default());
        bus.start().await;

        let (sync_seen, sync_h) = collector();
        let async_count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&async_count);
        bus.subscribe("topic_a", sync_h);
        bus.subscribe(
            "topic_a",
            async_handler(move |_m| {
                let counter = Arc::clone(&counter);
                async move {
                    tokio::task::yield_now().await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        bus.publish(MessageDraft::new("topic_a", "sender", json!("payload")), None)
            .await
            .unwrap();
        wait_until(|| async_count.load(Ordering::SeqCst) == 1).await;

        let seen = sync_seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload(), &json!("payload"));
        assert_eq!(seen[0].sender(), "sender");
        assert_eq!(async_count.load(Ordering::SeqCst), 1);
        drop(seen);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_auth_rules() {
        let bus = bus(BusConfig::default());

        // Open before any registration
        assert!(bus.publish(MessageDraft::new("t", "anyone", json!(1)), None).await.is_ok());

        let token = bus.register("agent_a");
        assert!(bus.publish(MessageDraft::new("t", "agent_a", json!(1)), Some(&token)).await.is_ok());

        let fake = AuthToken::from_string("fake_token");
        let err = bus
            .publish(MessageDraft::new("t", "agent_a", json!(1)), Some(&fake))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Auth(AuthError::TokenMismatch(_))));

        let err = bus.publish(MessageDraft::new("t", "agent_a", json!(1)), None).await.unwrap_err();
        assert!(matches!(err, BusError::Auth(AuthError::TokenMismatch(_))));

        let err = bus.publish(MessageDraft::new("t", "anyone", json!(1)), None).await.unwrap_err();
        assert!(matches!(err, BusError::Auth(AuthError::Unregistered(_))));

        assert!(bus.publish(MessageDraft::new("t", "system", json!(1)), None).await.is_ok());
        assert_eq!(bus.stats().published, 3);
    }

    #[tokio::test]
    async fn test_reregister_revokes_old_token() {
        let bus = bus(BusConfig::default());
        let old = bus.register("alice");
        let new = bus.register("alice");

        assert!(bus.publish(MessageDraft::new("t", "alice", json!(1)), Some(&old)).await.is_err());
        assert!(bus.publish(MessageDraft::new("t", "alice", json!(1)), Some(&new)).await.is_ok());
    }

    #[tokio::test]
    async fn test_validation_error_is_synchronous() {
        let bus = bus(BusConfig::default());
        let err = bus
            .publish(MessageDraft::new("t", "a", json!(1)).trace_id("nope"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Validation(ref v) if v.field == "trace_id"));
        assert_eq!(bus.stats().published, 0);
    }

    #[tokio::test]
    async fn test_per_topic_fifo() {
        let bus = bus(BusConfig::default());
        let (seen, handler) = collector();
        bus.subscribe("seq", handler);
        bus.start().await;

        for i in 0..200 {
            bus.publish(MessageDraft::new("seq", "p", json!(i)), None).await.unwrap();
        }
        wait_until(|| seen.lock().len() == 200).await;

        let order: Vec<i64> = seen.lock().iter().map(|m| m.payload().as_i64().unwrap()).collect();
        assert_eq!(order, (0..200).collect::<Vec<_>>());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_letter_ring_buffer() {
        let bus = bus(BusConfig::default().with_dlq_limit(10));
        bus.subscribe_fn("crash", |_m| Err(HandlerError::new("boom")));
        bus.start().await;

        for i in 0..50 {
            bus.publish(MessageDraft::new("crash", "system", json!(format!("fail_{}", i))), None)
                .await
                .unwrap();
        }
        wait_until(|| bus.stats().handler_failures == 50).await;

        let dlq = bus.dead_letters();
        assert_eq!(dlq.len(), 10);
        assert_eq!(dlq.first().unwrap().payload(), &json!("fail_40"));
        assert_eq!(dlq.last().unwrap().payload(), &json!("fail_49"));

        assert_eq!(bus.drain_dead_letters().len(), 10);
        assert_eq!(bus.dead_letter_count(), 0);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_handler_isolated() {
        let bus = bus(BusConfig::default());
        bus.subscribe_fn("t", |_m| Err(HandlerError::new("first fails")));
        bus.subscribe_fn("t", |_m| panic!("second panics"));
        let (seen, handler) = collector();
        bus.subscribe("t", handler);
        bus.start().await;

        bus.publish(MessageDraft::new("t", "a", json!(1)), None).await.unwrap();
        bus.publish(MessageDraft::new("t", "a", json!(2)), None).await.unwrap();
        wait_until(|| seen.lock().len() == 2).await;

        assert_eq!(seen.lock().len(), 2);
        // One dead letter per failed message, not per failed handler
        assert_eq!(bus.dead_letter_count(), 2);
        assert_eq!(bus.stats().handler_failures, 4);
        assert!(bus.is_running());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_rate_statistics() {
        let bus = bus(BusConfig::default().with_drop_rate(0.5).with_seed(42));
        let (seen, handler) = collector();
        bus.subscribe("lossy", handler);
        bus.start().await;

        for i in 0..1000 {
            bus.publish(MessageDraft::new("lossy", "p", json!(i)), None).await.unwrap();
        }
        wait_until(|| {
            let s = bus.stats();
            s.delivered + s.dropped == 1000
        })
        .await;

        let delivered = seen.lock().len() as f64 / 1000.0;
        assert!((0.3..=0.7).contains(&delivered), "delivered fraction {}", delivered);
        assert_eq!(bus.dead_letter_count(), 0);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_latency_serializes_all_topics() {
        let bus = bus(BusConfig::default().with_latency(LatencyRange::fixed(0.03)));
        let (seen_a, ha) = collector();
        let (seen_b, hb) = collector();
        bus.subscribe("a", ha);
        bus.subscribe("b", hb);
        bus.start().await;

        let start = Instant::now();
        bus.publish(MessageDraft::new("a", "p", json!(1)), None).await.unwrap();
        bus.publish(MessageDraft::new("b", "p", json!(2)), None).await.unwrap();
        wait_until(|| seen_b.lock().len() == 1).await;

        // Topic b waited behind topic a's delay
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(seen_a.lock().len(), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_backpressure_blocks_publisher() {
        let bus = bus(BusConfig::default().with_capacity(2));
        bus.publish(MessageDraft::new("t", "p", json!(1)), None).await.unwrap();
        bus.publish(MessageDraft::new("t", "p", json!(2)), None).await.unwrap();
        assert_eq!(bus.queued(), 2);

        let stalled = tokio::time::timeout(
            Duration::from_millis(50),
            bus.publish(MessageDraft::new("t", "p", json!(3)), None),
        )
        .await;
        assert!(stalled.is_err(), "publish should block on a full queue");

        bus.start().await;
        let resumed = tokio::time::timeout(
            Duration::from_secs(2),
            bus.publish(MessageDraft::new("t", "p", json!(3)), None),
        )
        .await;
        assert!(resumed.unwrap().is_ok());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = bus(BusConfig::default());
        let (seen, handler) = collector();
        let id = bus.subscribe("t", handler);
        bus.start().await;

        bus.publish(MessageDraft::new("t", "p", json!(1)), None).await.unwrap();
        wait_until(|| seen.lock().len() == 1).await;

        assert!(bus.unsubscribe("t", id));
        assert!(!bus.unsubscribe("t", id));
        assert_eq!(bus.subscriber_count("t"), 0);

        bus.publish(MessageDraft::new("t", "p", json!(2)), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().len(), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_audit_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("bus.jsonl");
        let bus = bus(BusConfig::default().with_audit_log(&path));
        let token = bus.register("alice");

        let sent = bus
            .publish(
                MessageDraft::new("orders", "alice", json!({"qty": 1}))
                    .message_type(MessageType::Command)
                    .receiver("bob"),
                Some(&token),
            )
            .await
            .unwrap();
        bus.publish(MessageDraft::new("orders", "alice", json!(2)), Some(&token))
            .await
            .unwrap();
        // Rejected publishes never reach the log
        assert!(bus.publish(MessageDraft::new("orders", "mallory", json!(3)), None).await.is_err());

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["topic"], "orders");
        assert_eq!(lines[0]["message_type"], "command");
        assert_eq!(lines[0]["receiver"], "bob");
        assert_eq!(lines[0]["trace_id"], sent.trace_id().to_string());
        assert!(lines[0]["timestamp"].as_f64().unwrap() > 0.0);

        let parsed: Message = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(parsed, sent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_no_loss() {
        let bus = bus(BusConfig::default().with_capacity(16));
        let (seen, handler) = collector();
        bus.subscribe("shared", handler);
        bus.start().await;

        let mut tasks = Vec::new();
        for producer in 0..4i64 {
            let bus = bus.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..250i64 {
                    let value = producer * 1000 + i;
                    bus.publish(MessageDraft::new("shared", "p", json!(value)), None)
                        .await
                        .unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        wait_until(|| seen.lock().len() >= 1000).await;

        let values: Vec<i64> = seen.lock().iter().map(|m| m.payload().as_i64().unwrap()).collect();
        let unique: HashSet<i64> = values.iter().copied().collect();
        assert_eq!(values.len(), 1000);
        assert_eq!(unique.len(), 1000);
        bus.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_audit_order_matches_delivery_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.jsonl");
        let bus = bus(BusConfig::default().with_capacity(8).with_audit_log(&path));
        let (seen, handler) = collector();
        bus.subscribe("shared", handler);
        bus.start().await;

        let tasks: Vec<_> = (0..4i64)
            .map(|producer| {
                let bus = bus.clone();
                tokio::spawn(async move {
                    for i in 0..100i64 {
                        bus.publish(MessageDraft::new("shared", "p", json!(producer * 1000 + i)), None)
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        wait_until(|| seen.lock().len() >= 400).await;

        let delivered: Vec<Value> = seen.lock().iter().map(|m| m.payload().clone()).collect();
        let logged: Vec<Value> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["payload"].clone())
            .collect();
        assert_eq!(logged.len(), 400);
        assert_eq!(logged, delivered);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let bus = bus(BusConfig::default());
        let (seen, handler) = collector();
        bus.subscribe("t", handler);

        bus.start().await;
        bus.shutdown().await;
        assert!(!bus.is_running());

        bus.publish(MessageDraft::new("t", "p", json!(1)), None).await.unwrap();
        bus.start().await;
        wait_until(|| seen.lock().len() == 1).await;
        assert_eq!(seen.lock().len(), 1);
        bus.shutdown().await;
    }
}
