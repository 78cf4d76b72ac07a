//! AMQP 0-9-1 broker backend over `lapin`.

use super::{
    Acker, BrokerChannel, BrokerConnection, Confirmation, Delivery, DeliveryStream,
    OutgoingMessage, PendingConfirm, QueueInfo,
};
use crate::config::BrokerSettings;
use crate::error::{ConnectionError, ConsumeError, PublishError, TopologyError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation as AmqpConfirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tracing::{debug, info, warn};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

pub struct AmqpConnection {
    inner: Connection,
    addr: String,
}

impl AmqpConnection {
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, ConnectionError> {
        let addr = settings.host.clone();
        let uri = settings.amqp_uri();
        let connect = Connection::connect(&uri, ConnectionProperties::default());

        let inner = tokio::time::timeout(settings.connect_timeout(), connect)
            .await
            .map_err(|_| ConnectionError::Timeout {
                addr: addr.clone(),
                after: settings.connect_timeout(),
            })?
            .map_err(|e| classify_connect_error(e, settings))?;

        info!(
            "Connected to AMQP broker at {} (vhost '{}')",
            addr, settings.vhost
        );
        Ok(Self { inner, addr })
    }
}

/// Maps a handshake failure onto the connection taxonomy. lapin reports
/// broker refusals as protocol errors carrying the AMQP reply text.
fn classify_connect_error(err: lapin::Error, settings: &BrokerSettings) -> ConnectionError {
    if let lapin::Error::IOError(io) = &err {
        return ConnectionError::Unreachable {
            addr: settings.host.clone(),
            reason: io.to_string(),
        };
    }
    classify_refusal(err.to_string(), settings)
}

/// Sorts a refused handshake by its AMQP reply code. RabbitMQ answers an
/// unknown or forbidden vhost with NOT_ALLOWED.
fn classify_refusal(text: String, settings: &BrokerSettings) -> ConnectionError {
    let upper = text.to_ascii_uppercase();
    if upper.contains("ACCESS_REFUSED") || upper.contains("ACCESSREFUSED") {
        ConnectionError::AccessRefused(settings.user.clone())
    } else if upper.contains("NOT_ALLOWED") || upper.contains("NOTALLOWED") {
        ConnectionError::VhostNotFound(settings.vhost.clone())
    } else {
        ConnectionError::Handshake(text)
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        if !self.inner.status().connected() {
            return Err(ConnectionError::Closed);
        }
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| ConnectionError::Channel(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| ConnectionError::Channel(format!("enabling confirm mode: {}", e)))?;

        debug!("Opened confirm-mode channel {} to {}", channel.id(), self.addr);
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| ConnectionError::Handshake(format!("closing connection: {}", e)))?;
        info!("Closed AMQP connection to {}", self.addr);
        Ok(())
    }
}

pub struct AmqpChannel {
    inner: Channel,
}

struct AmqpAcker {
    inner: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<(), ConsumeError> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(map_consume_error)
    }
}

fn map_topology_error(err: lapin::Error, entity: &'static str, name: &str) -> TopologyError {
    match err {
        lapin::Error::InvalidChannelState(_) => TopologyError::ChannelClosed,
        lapin::Error::ProtocolError(e) => {
            let text = e.to_string();
            if text.to_ascii_uppercase().contains("PRECONDITION") {
                TopologyError::Conflict {
                    entity,
                    name: name.to_string(),
                    reason: text,
                }
            } else if text.to_ascii_uppercase().contains("NOT_FOUND")
                || text.to_ascii_uppercase().contains("NOTFOUND")
            {
                match entity {
                    "exchange" => TopologyError::ExchangeNotFound(name.to_string()),
                    _ => TopologyError::QueueNotFound(name.to_string()),
                }
            } else if text.to_ascii_uppercase().contains("ACCESS") {
                TopologyError::AccessRefused(name.to_string())
            } else {
                TopologyError::Rejected(text)
            }
        }
        other => TopologyError::Rejected(other.to_string()),
    }
}

fn map_consume_error(err: lapin::Error) -> ConsumeError {
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            ConsumeError::ChannelClosed
        }
        other => ConsumeError::Broker(other.to_string()),
    }
}

fn map_publish_error(err: lapin::Error) -> PublishError {
    match err {
        lapin::Error::ProtocolError(e) => PublishError::Rejected(e.to_string()),
        other => PublishError::ConnectionLost(other.to_string()),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    async fn declare_queue(&self, name: &str) -> Result<QueueInfo, TopologyError> {
        let options = QueueDeclareOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .inner
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(|e| map_topology_error(e, "queue", name))?;
        debug!("Declared durable queue '{}'", name);
        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn declare_topic_exchange(&self, name: &str) -> Result<(), TopologyError> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.inner
            .exchange_declare(name, ExchangeKind::Topic, options, FieldTable::default())
            .await
            .map_err(|e| map_topology_error(e, "exchange", name))?;
        debug!("Declared topic exchange '{}'", name);
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        pattern: &str,
        exchange: &str,
    ) -> Result<(), TopologyError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_topology_error(e, "binding", queue))?;
        debug!("Bound queue '{}' to '{}' with '{}'", queue, exchange, pattern);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), ConsumeError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_consume_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<PendingConfirm, PublishError> {
        let options = BasicPublishOptions {
            mandatory: true,
            ..BasicPublishOptions::default()
        };
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type))
            .with_delivery_mode(PERSISTENT);

        let confirm = self
            .inner
            .basic_publish(exchange, routing_key, options, &message.body, properties)
            .await
            .map_err(map_publish_error)?;

        Ok(async move {
            match confirm.await {
                Ok(AmqpConfirmation::Ack(None)) => Ok(Confirmation::Ack),
                // The broker hands back mandatory messages it could not route
                Ok(AmqpConfirmation::Ack(Some(_returned))) => Ok(Confirmation::Returned),
                Ok(AmqpConfirmation::Nack(_)) => Ok(Confirmation::Nack),
                Ok(AmqpConfirmation::NotRequested) => {
                    warn!("Channel is not in confirm mode, treating publish as acked");
                    Ok(Confirmation::Ack)
                }
                Err(e) => Err(PublishError::ConnectionLost(e.to_string())),
            }
        }
        .boxed())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConsumeError> {
        let options = BasicConsumeOptions {
            no_ack: false,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(|e| match map_consume_error(e) {
                ConsumeError::Broker(text) if text.to_ascii_uppercase().contains("NOT_FOUND") => {
                    ConsumeError::QueueNotFound(queue.to_string())
                }
                other => other,
            })?;
        info!("Consumer '{}' subscribed to '{}'", consumer_tag, queue);

        Ok(consumer
            .map(|item| {
                item.map(|delivery| {
                    let content_type = delivery
                        .properties
                        .content_type()
                        .as_ref()
                        .map(|ct| ct.as_str().to_string());
                    let acker: Arc<dyn Acker> = Arc::new(AmqpAcker {
                        inner: delivery.acker,
                    });
                    Delivery::new(
                        delivery.delivery_tag,
                        delivery.exchange.as_str().to_string(),
                        delivery.routing_key.as_str().to_string(),
                        Bytes::from(delivery.data),
                        content_type,
                        delivery.redelivered,
                        acker,
                    )
                })
                .map_err(map_consume_error)
            })
            .boxed())
    }

    fn is_closed(&self) -> bool {
        !self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| ConnectionError::Channel(format!("closing channel: {}", e)))
    }
}
