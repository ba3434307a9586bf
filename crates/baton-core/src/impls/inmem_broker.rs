//! InMemoryBroker - in-process broker with durable-queue semantics.
//!
//! Models the parts of an AMQP broker the pipeline depends on:
//! - direct exchanges (exact routing-key match, every bound queue gets a copy)
//! - the default exchange `""`, which routes to the queue named by the routing key
//! - manual ack: a delivery sits in `unacked` until it is settled
//! - an unsettled delivery that is dropped goes back to the queue (connection-loss semantics)
//! - `restart()` keeps persistent messages and drops transient ones
//!
//! Queues outlive subscriptions, so a worker that restarts picks up whatever is
//! still waiting or was left unacknowledged.
//!
//! The state lives behind a `std::sync::Mutex`; it is never held across an await.
//! Waiting consumers park on a per-queue `Notify`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::ports::{Broker, BrokerError, Delivery, PublishOptions, Subscription};

pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    persistent: bool,
    delivery_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub acked: u64,
    pub discarded: u64,
}

struct QueueState {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
    acked: u64,
    discarded: u64,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            acked: 0,
            discarded: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Return every in-flight message to the ready list.
    fn requeue_unacked(&mut self) {
        let mut tags: Vec<u64> = self.unacked.keys().copied().collect();
        tags.sort_unstable();
        for tag in tags {
            if let Some(msg) = self.unacked.remove(&tag) {
                self.ready.push_back(msg);
            }
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.len(),
            unacked: self.unacked.len(),
            acked: self.acked,
            discarded: self.discarded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct BrokerState {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueState>,
    /// Next delivery tag.
    next_tag: u64,
    connected: bool,
    closed: bool,
    /// exchange -> number of upcoming publishes that should fail.
    publish_faults: HashMap<String, u32>,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            next_tag: 1,
            connected: true,
            closed: false,
            publish_faults: HashMap::new(),
        }
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Unavailable("connection closed".to_string()));
        }
        if !self.connected {
            return Err(BrokerError::Unavailable("connection lost".to_string()));
        }
        Ok(())
    }

    fn wake_all(&self) {
        for queue in self.queues.values() {
            queue.notify.notify_waiters();
        }
    }
}

fn lock(state: &Mutex<BrokerState>) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
    state
        .lock()
        .map_err(|_| BrokerError::Unavailable("broker state poisoned".to_string()))
}

/// In-process broker. Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        let state = lock(&self.state).ok()?;
        state.queues.get(queue).map(QueueState::stats)
    }

    /// Bodies currently waiting in `queue`, oldest first.
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        let Ok(state) = lock(&self.state) else {
            return Vec::new();
        };
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Make the next `count` publishes to `exchange` fail with `Unavailable`.
    pub fn fail_publishes(&self, exchange: &str, count: u32) {
        if let Ok(mut state) = lock(&self.state) {
            *state.publish_faults.entry(exchange.to_string()).or_default() += count;
        }
    }

    /// Drop the connection: publishes and declarations fail, consumers stall, and
    /// everything in flight is requeued. Settling an old delivery fails with `Closed`.
    pub fn disconnect(&self) {
        if let Ok(mut state) = lock(&self.state) {
            state.connected = false;
            for queue in state.queues.values_mut() {
                queue.requeue_unacked();
            }
        }
    }

    pub fn reconnect(&self) {
        if let Ok(mut state) = lock(&self.state) {
            state.connected = true;
            state.wake_all();
        }
    }

    /// Simulated broker restart: in-flight messages are requeued, then every
    /// non-persistent message is lost.
    pub fn restart(&self) {
        if let Ok(mut state) = lock(&self.state) {
            for queue in state.queues.values_mut() {
                queue.requeue_unacked();
                queue.ready.retain(|m| m.persistent);
            }
            state.wake_all();
        }
    }

    /// Permanently close the connection; open subscriptions return `None`.
    pub fn close(&self) {
        if let Ok(mut state) = lock(&self.state) {
            state.closed = true;
            state.wake_all();
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.state)?;
        state.ensure_connected()?;
        if name != DEFAULT_EXCHANGE {
            state.exchanges.entry(name.to_string()).or_default();
        }
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.state)?;
        state.ensure_connected()?;
        state
            .queues
            .entry(name.to_string())
            .or_insert_with(QueueState::new);
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state)?;
        state.ensure_connected()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let bindings = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut guard = lock(&self.state)?;
        let state: &mut BrokerState = &mut guard;
        state.ensure_connected()?;

        if let Some(remaining) = state.publish_faults.get_mut(exchange)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(BrokerError::Unavailable(format!(
                "publish to {exchange} refused"
            )));
        }

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let bindings = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
            bindings
                .iter()
                .filter(|b| b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        if targets.is_empty() {
            tracing::warn!(exchange, routing_key, "unroutable message dropped");
            return Ok(());
        }

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push_back(Message {
                    body: body.clone(),
                    persistent: options.persistent,
                    delivery_count: 0,
                });
                queue.notify.notify_one();
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let state = lock(&self.state)?;
        state.ensure_connected()?;
        let notify = state
            .queues
            .get(queue)
            .map(|q| Arc::clone(&q.notify))
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        Ok(Box::new(InMemorySubscription {
            queue: queue.to_string(),
            state: Arc::clone(&self.state),
            notify,
        }))
    }

    fn is_connected(&self) -> bool {
        lock(&self.state)
            .map(|state| state.connected && !state.closed)
            .unwrap_or(false)
    }
}

struct InMemorySubscription {
    queue: String,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Option<Box<dyn Delivery>> {
        loop {
            // notify_waiters は登録済みの Notified にしか届かないので、状態を見る前に作る
            let notified = self.notify.notified();
            {
                let mut guard = self.state.lock().ok()?;
                let state: &mut BrokerState = &mut guard;
                if state.closed {
                    return None;
                }
                if state.connected {
                    let queue = state.queues.get_mut(&self.queue)?;
                    if let Some(mut msg) = queue.ready.pop_front() {
                        msg.delivery_count += 1;
                        let tag = state.next_tag;
                        state.next_tag += 1;
                        let delivery = InMemoryDelivery {
                            tag,
                            queue: self.queue.clone(),
                            body: msg.body.clone(),
                            delivery_count: msg.delivery_count,
                            state: Arc::clone(&self.state),
                            settled: false,
                        };
                        queue.unacked.insert(tag, msg);
                        return Some(Box::new(delivery));
                    }
                }
            }
            notified.await;
        }
    }
}

struct InMemoryDelivery {
    tag: u64,
    queue: String,
    body: Vec<u8>,
    delivery_count: u32,
    state: Arc<Mutex<BrokerState>>,
    settled: bool,
}

impl InMemoryDelivery {
    /// Remove this delivery from `unacked` and hand the message to `f`.
    fn settle_with(
        &mut self,
        f: impl FnOnce(&mut QueueState, Message),
    ) -> Result<(), BrokerError> {
        self.settled = true;
        let mut state = lock(&self.state)?;
        state.ensure_connected().map_err(|_| BrokerError::Closed)?;
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::UnknownQueue(self.queue.clone()))?;
        let msg = queue.unacked.remove(&self.tag).ok_or(BrokerError::Closed)?;
        f(queue, msg);
        Ok(())
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    async fn ack(mut self: Box<Self>) -> Result<(), BrokerError> {
        self.settle_with(|queue, _msg| queue.acked += 1)
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.settle_with(|queue, msg| {
            if requeue {
                queue.ready.push_back(msg);
                queue.notify.notify_one();
            } else {
                queue.discarded += 1;
            }
        })
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // 未 settle のまま落ちた = 接続断と同じ扱いで再配送
        if let Ok(mut state) = self.state.lock()
            && let Some(queue) = state.queues.get_mut(&self.queue)
            && let Some(msg) = queue.unacked.remove(&self.tag)
        {
            queue.ready.push_back(msg);
            queue.notify.notify_one();
        }
    }
}
