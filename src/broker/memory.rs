//! In-process broker with topic-exchange semantics.
//!
//! Queues are durable for the lifetime of the [`MemoryBroker`]: they survive
//! connection and channel loss. Unacknowledged deliveries are requeued at
//! the head of their queue, flagged as redelivered, when the channel that
//! received them closes.

use super::{
    Acker, BrokerChannel, BrokerConnection, Confirmation, Delivery, DeliveryStream,
    OutgoingMessage, PendingConfirm, QueueInfo,
};
use crate::error::{ConnectionError, ConsumeError, PublishError, TopologyError};
use crate::routing::{topic_matches, BindingPattern, RoutingKey};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

const MEMORY_ADDR: &str = "memory";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    /// Exact-match routing. Only reachable through
    /// [`MemoryBroker::declare_exchange`], to set up kind conflicts.
    Direct,
}

#[derive(Debug, Clone)]
struct Credentials {
    user: String,
    password: String,
    vhost: String,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Bytes,
    content_type: Option<String>,
    redelivered: bool,
}

struct ConsumerSlot {
    channel: u64,
    tag: String,
    tx: mpsc::UnboundedSender<Result<Delivery, ConsumeError>>,
    acker: Arc<dyn Acker>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    connection: u64,
    open: bool,
    /// 0 = unlimited
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

struct ConnectionState {
    open: bool,
    next_channel: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

struct HeldConfirm {
    channel: u64,
    confirmation: Confirmation,
    tx: oneshot::Sender<Confirmation>,
}

struct BrokerState {
    credentials: Option<Credentials>,
    reachable: bool,
    hold_confirms: bool,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    held_confirms: Vec<HeldConfirm>,
    next_id: u64,
}

impl BrokerState {
    fn new(credentials: Option<Credentials>) -> Self {
        Self {
            credentials,
            reachable: true,
            hold_confirms: false,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            held_confirms: Vec::new(),
            next_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, key: u64) -> bool {
        self.channels.get(&key).map(|c| c.open).unwrap_or(false)
    }

    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<(), TopologyError> {
        if name.is_empty() {
            return Err(TopologyError::InvalidName {
                name: name.to_string(),
                reason: "the default exchange cannot be declared".to_string(),
            });
        }
        if name.starts_with("amq.") {
            return Err(TopologyError::AccessRefused(name.to_string()));
        }
        match self.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(TopologyError::Conflict {
                entity: "exchange",
                name: name.to_string(),
                reason: format!("already declared as {:?}, requested {:?}", existing, kind),
            }),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(name.to_string(), kind);
                info!("Declared {:?} exchange '{}'", kind, name);
                Ok(())
            }
        }
    }

    fn declare_queue(&mut self, name: &str) -> Result<QueueInfo, TopologyError> {
        if name.is_empty() {
            return Err(TopologyError::InvalidName {
                name: name.to_string(),
                reason: "queue name must not be empty".to_string(),
            });
        }
        if name.starts_with("amq.") {
            return Err(TopologyError::AccessRefused(name.to_string()));
        }
        let queue = self.queues.entry(name.to_string()).or_insert_with(|| {
            info!("Declared durable queue '{}'", name);
            QueueState::default()
        });
        Ok(QueueInfo {
            name: name.to_string(),
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    fn bind(&mut self, queue: &str, pattern: &str, exchange: &str) -> Result<(), TopologyError> {
        if !self.queues.contains_key(queue) {
            return Err(TopologyError::QueueNotFound(queue.to_string()));
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(TopologyError::ExchangeNotFound(exchange.to_string()));
        }
        BindingPattern::parse(pattern).map_err(|e| TopologyError::InvalidName {
            name: pattern.to_string(),
            reason: e.to_string(),
        })?;

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if !self.bindings.contains(&binding) {
            debug!("Bound queue '{}' to '{}' with '{}'", queue, exchange, pattern);
            self.bindings.push(binding);
        }
        Ok(())
    }

    /// Queues a publish lands in, without duplicates.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, PublishError> {
        let kind = self
            .exchanges
            .get(exchange)
            .copied()
            .ok_or_else(|| PublishError::Rejected(format!("no exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Topic => topic_matches(&binding.pattern, routing_key),
                ExchangeKind::Direct => binding.pattern == routing_key,
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    /// Hands ready messages to consumers with spare prefetch capacity,
    /// round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        loop {
            // Drop consumers whose stream was dropped
            queue.consumers.retain(|c| !c.tx.is_closed());
            let count = queue.consumers.len();
            if queue.ready.is_empty() || count == 0 {
                break;
            }

            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|idx| {
                    channels
                        .get(&queue.consumers[*idx].channel)
                        .map(|ch| {
                            ch.open
                                && (ch.prefetch == 0 || ch.unacked.len() < ch.prefetch as usize)
                        })
                        .unwrap_or(false)
                });
            let Some(idx) = chosen else {
                break;
            };
            queue.next_consumer = (idx + 1) % count;

            let channel_key = queue.consumers[idx].channel;
            let acker = Arc::clone(&queue.consumers[idx].acker);
            let Some(channel) = channels.get_mut(&channel_key) else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            channel.next_tag += 1;
            let tag = channel.next_tag;
            let delivery = Delivery::new(
                tag,
                message.exchange.clone(),
                message.routing_key.clone(),
                message.body.clone(),
                message.content_type.clone(),
                message.redelivered,
                acker,
            );

            if queue.consumers[idx].tx.unbounded_send(Ok(delivery)).is_err() {
                queue.ready.push_front(message);
                let gone = queue.consumers.remove(idx);
                debug!("Consumer '{}' went away during dispatch", gone.tag);
                continue;
            }

            debug!(
                "Dispatched '{}' from '{}' as tag {} to '{}'",
                message.routing_key, queue_name, tag, queue.consumers[idx].tag
            );
            channel.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    message,
                },
            );
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn ack(&mut self, channel_key: u64, tag: u64) -> Result<(), ConsumeError> {
        let channel = self
            .channels
            .get_mut(&channel_key)
            .filter(|c| c.open)
            .ok_or(ConsumeError::ChannelClosed)?;
        let entry = channel
            .unacked
            .remove(&tag)
            .ok_or(ConsumeError::UnknownDeliveryTag(tag))?;
        debug!("Acked tag {} from '{}'", tag, entry.queue);
        self.dispatch(&entry.queue);
        Ok(())
    }

    fn close_channel(&mut self, key: u64) {
        let Some(channel) = self.channels.get_mut(&key) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let unacked = std::mem::take(&mut channel.unacked);

        let mut touched: Vec<String> = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != key);
            if queue.consumers.len() != before {
                touched.push(name.clone());
            }
        }

        let requeued = unacked.len();
        // Reverse tag order so the queue head keeps the original order
        for (_, entry) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            if !touched.contains(&entry.queue) {
                touched.push(entry.queue);
            }
        }

        // Dropping the senders fails any confirm wait on this channel
        self.held_confirms.retain(|held| held.channel != key);

        if requeued > 0 {
            info!("Channel closed, requeued {} unacked deliveries", requeued);
        }
        for name in touched {
            self.dispatch(&name);
        }
    }

    fn close_connection(&mut self, id: u64) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        if !connection.open {
            return;
        }
        connection.open = false;
        let owned: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == id)
            .map(|(key, _)| *key)
            .collect();
        for key in owned {
            self.close_channel(key);
        }
    }
}

/// The broker itself. Clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker that accepts any credentials and virtual host.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new(None))),
        }
    }

    pub fn with_credentials(user: &str, password: &str, vhost: &str) -> Self {
        let credentials = Credentials {
            user: user.to_string(),
            password: password.to_string(),
            vhost: vhost.to_string(),
        };
        Self {
            state: Arc::new(Mutex::new(BrokerState::new(Some(credentials)))),
        }
    }

    pub fn connect(
        &self,
        user: &str,
        password: &str,
        vhost: &str,
    ) -> Result<MemoryConnection, ConnectionError> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(ConnectionError::Unreachable {
                addr: MEMORY_ADDR.to_string(),
                reason: "broker is not accepting connections".to_string(),
            });
        }
        if let Some(expected) = &state.credentials {
            if expected.user != user || expected.password != password {
                return Err(ConnectionError::AccessRefused(user.to_string()));
            }
            if expected.vhost != vhost {
                return Err(ConnectionError::VhostNotFound(vhost.to_string()));
            }
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                next_channel: 0,
            },
        );
        debug!("Accepted connection {} for user '{}'", id, user);
        Ok(MemoryConnection {
            state: Arc::clone(&self.state),
            id,
        })
    }

    /// Refuse (or accept again) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// While held, publisher confirms are not sent. Releasing sends every
    /// held confirm.
    pub fn hold_confirms(&self, hold: bool) {
        let mut state = self.state.lock();
        state.hold_confirms = hold;
        if !hold {
            for held in state.held_confirms.drain(..) {
                let _ = held.tx.send(held.confirmation);
            }
        }
    }

    /// Drops every client connection, as on a broker-side network failure.
    pub fn sever_connections(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        warn!("Severing {} connection(s)", ids.len());
        for id in ids {
            state.close_connection(id);
        }
    }

    /// Declare an exchange of any kind, bypassing client channels.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TopologyError> {
        self.state.lock().declare_exchange(name, kind)
    }

    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn binding_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .count()
    }
}

pub struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        let mut state = self.state.lock();
        let connection = state
            .connections
            .get_mut(&self.id)
            .filter(|c| c.open)
            .ok_or(ConnectionError::Closed)?;
        connection.next_channel += 1;
        let number = connection.next_channel;

        let key = state.next_id();
        state.channels.insert(
            key,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        debug!("Opened channel {} on connection {}", number, self.id);
        Ok(Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            key,
            number,
        }))
    }

    fn is_open(&self) -> bool {
        self.state
            .lock()
            .connections
            .get(&self.id)
            .map(|c| c.open)
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.state.lock().close_connection(self.id);
        Ok(())
    }
}

pub struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    key: u64,
    number: u16,
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    channel: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumeError> {
        let state = self.state.upgrade().ok_or(ConsumeError::ChannelClosed)?;
        let mut state = state.lock();
        state.ack(self.channel, delivery_tag)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.number
    }

    async fn declare_queue(&self, name: &str) -> Result<QueueInfo, TopologyError> {
        let mut state = self.state.lock();
        if !state.channel_open(self.key) {
            return Err(TopologyError::ChannelClosed);
        }
        state.declare_queue(name)
    }

    async fn declare_topic_exchange(&self, name: &str) -> Result<(), TopologyError> {
        let mut state = self.state.lock();
        if !state.channel_open(self.key) {
            return Err(TopologyError::ChannelClosed);
        }
        state.declare_exchange(name, ExchangeKind::Topic)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        pattern: &str,
        exchange: &str,
    ) -> Result<(), TopologyError> {
        let mut state = self.state.lock();
        if !state.channel_open(self.key) {
            return Err(TopologyError::ChannelClosed);
        }
        state.bind(queue, pattern, exchange)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), ConsumeError> {
        let mut state = self.state.lock();
        let channel = state
            .channels
            .get_mut(&self.key)
            .filter(|c| c.open)
            .ok_or(ConsumeError::ChannelClosed)?;
        channel.prefetch = count;
        state.dispatch_all();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<PendingConfirm, PublishError> {
        let mut state = self.state.lock();
        if !state.channel_open(self.key) {
            return Err(PublishError::ConnectionLost("channel is closed".to_string()));
        }
        RoutingKey::parse(routing_key)?;

        let targets = state.route(exchange, routing_key)?;
        let confirmation = if targets.is_empty() {
            debug!("Returning unroutable message '{}'", routing_key);
            Confirmation::Returned
        } else {
            Confirmation::Ack
        };

        let stored = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: message.body,
            content_type: Some(message.content_type),
            redelivered: false,
        };
        for target in &targets {
            if let Some(queue) = state.queues.get_mut(target) {
                queue.ready.push_back(stored.clone());
            }
        }
        for target in &targets {
            state.dispatch(target);
        }

        if state.hold_confirms {
            let (tx, rx) = oneshot::channel();
            state.held_confirms.push(HeldConfirm {
                channel: self.key,
                confirmation,
                tx,
            });
            return Ok(async move {
                rx.await.map_err(|_| {
                    PublishError::ConnectionLost("channel closed before confirm".to_string())
                })
            }
            .boxed());
        }
        Ok(futures::future::ready(Ok(confirmation)).boxed())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConsumeError> {
        let mut state = self.state.lock();
        if !state.channel_open(self.key) {
            return Err(ConsumeError::ChannelClosed);
        }
        let (tx, rx) = mpsc::unbounded();
        let acker: Arc<dyn Acker> = Arc::new(MemoryAcker {
            state: Arc::downgrade(&self.state),
            channel: self.key,
        });
        let slot = ConsumerSlot {
            channel: self.key,
            tag: consumer_tag.to_string(),
            tx,
            acker,
        };
        state
            .queues
            .get_mut(queue)
            .ok_or_else(|| ConsumeError::QueueNotFound(queue.to_string()))?
            .consumers
            .push(slot);
        info!("Consumer '{}' subscribed to '{}'", consumer_tag, queue);
        state.dispatch(queue);
        Ok(rx.boxed())
    }

    fn is_closed(&self) -> bool {
        !self.state.lock().channel_open(self.key)
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.state.lock().close_channel(self.key);
        Ok(())
    }
}
