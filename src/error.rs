//! Error taxonomy for the messaging layer.

use std::time::Duration;

/// Failure to establish or use the broker connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("broker unreachable at {addr}: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("broker refused credentials for user '{0}'")]
    AccessRefused(String),

    #[error("virtual host '{0}' not available")]
    VhostNotFound(String),

    #[error("timed out connecting to {addr} after {after:?}")]
    Timeout { addr: String, after: Duration },

    #[error("handshake with broker failed: {0}")]
    Handshake(String),

    #[error("connection is closed")]
    Closed,

    #[error("channel error: {0}")]
    Channel(String),
}

/// Declaration of an exchange, queue or binding was rejected.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("{entity} '{name}' conflicts with an existing declaration: {reason}")]
    Conflict {
        entity: &'static str,
        name: String,
        reason: String,
    },

    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("exchange '{0}' not found")]
    ExchangeNotFound(String),

    #[error("access to '{0}' refused")]
    AccessRefused(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("broker rejected declaration: {0}")]
    Rejected(String),
}

/// Outcome of a publish that did not end in a positive confirm.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("no binding on exchange '{exchange}' matches routing key '{routing_key}'")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("no publisher confirm within {0:?}")]
    ConfirmTimeout(Duration),

    #[error("connection lost before confirm: {0}")]
    ConnectionLost(String),

    #[error("broker negatively acknowledged message on '{routing_key}'")]
    Nacked { routing_key: String },

    #[error("invalid routing key: {0}")]
    InvalidRoutingKey(#[from] RoutingError),

    #[error("broker rejected publish: {0}")]
    Rejected(String),

    #[error("failed to encode event payload: {0}")]
    Encode(String),
}

/// Subscription, QoS and acknowledgment failures.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("prefetch count must be greater than zero")]
    InvalidPrefetch,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("delivery stream ended")]
    StreamClosed,

    #[error("broker error: {0}")]
    Broker(String),

    #[error("could not reopen consumer channel: {0}")]
    Connection(#[from] ConnectionError),

    #[error("handler escalated: {0}")]
    Handler(#[from] HandlerError),
}

/// Failure reported by an event handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure; the delivery stays unacknowledged.
    #[error("event handling failed: {0}")]
    Failed(String),

    #[error("handler did not finish within {0:?}")]
    TimedOut(Duration),

    /// Programming error; stops the consumer loop.
    #[error("handler invariant violated: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Fatal(_))
    }
}

/// Malformed routing key or binding pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("'{0}' contains an empty segment")]
    EmptySegment(String),

    #[error("routing key '{0}' must not contain wildcards")]
    WildcardInKey(String),

    #[error("{field} '{value}' must not contain '.', '*' or '#'")]
    InvalidSegment { field: &'static str, value: String },

    #[error("pattern segment '{0}' mixes a wildcard with other characters")]
    MixedWildcard(String),
}
