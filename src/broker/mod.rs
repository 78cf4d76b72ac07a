//! Broker capability seam.
//!
//! [`BrokerConnection`] and [`BrokerChannel`] cover everything the messaging
//! layer needs from a broker: channels, topology declaration, confirmed
//! publishing and manual-ack consumption. [`amqp`] talks to a real AMQP
//! 0-9-1 broker, [`memory`] is an in-process broker with the same semantics.

pub mod amqp;
pub mod memory;

use crate::error::{ConnectionError, ConsumeError, PublishError, TopologyError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Opaque body plus content-type tag.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub body: Bytes,
    pub content_type: String,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.into(),
        }
    }

    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::new(body, CONTENT_TYPE_JSON)
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(Bytes::from(body.into()), CONTENT_TYPE_TEXT)
    }
}

/// Broker answer to a confirm-mode publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    /// Accepted but returned as unroutable (mandatory flag).
    Returned,
    Nack,
}

/// Resolves once the broker confirms a publish.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, PublishError>>;

/// Deliveries in broker dispatch order. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, ConsumeError>>;

/// Acknowledges deliveries on the channel that received them.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumeError>;
}

pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub redelivered: bool,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: String,
        routing_key: String,
        body: Bytes,
        content_type: Option<String>,
        redelivered: bool,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange,
            routing_key,
            body,
            content_type,
            redelivered,
            acker,
        }
    }

    /// Single-message (non-cumulative) acknowledgment.
    pub async fn ack(&self) -> Result<(), ConsumeError> {
        self.acker.ack(self.delivery_tag).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("content_type", &self.content_type)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// One logical connection to a broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a confirm-mode channel.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, ConnectionError>;

    fn is_open(&self) -> bool;

    /// Closes the connection and every channel on it. Idempotent.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// A channel over a [`BrokerConnection`]. Not for concurrent use by
/// independent callers; give each publisher/consumer its own.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    /// Durable, non-exclusive, non-auto-delete queue.
    async fn declare_queue(&self, name: &str) -> Result<QueueInfo, TopologyError>;

    /// Durable topic exchange.
    async fn declare_topic_exchange(&self, name: &str) -> Result<(), TopologyError>;

    async fn bind_queue(
        &self,
        queue: &str,
        pattern: &str,
        exchange: &str,
    ) -> Result<(), TopologyError>;

    /// Maximum number of unacknowledged deliveries dispatched to this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), ConsumeError>;

    /// Mandatory, persistent publish. The returned future resolves with the
    /// broker's confirm.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<PendingConfirm, PublishError>;

    /// Manual-ack subscription.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, ConsumeError>;

    fn is_closed(&self) -> bool;

    /// Requeues this channel's unacknowledged deliveries. Idempotent.
    async fn close(&self) -> Result<(), ConnectionError>;
}
