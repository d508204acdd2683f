//! # AMQP Broker Adapter
//!
//! [`BrokerConnector`] over AMQP 0-9-1 (RabbitMQ) using `lapin`.
//!
//! Each connect opens one connection and one channel in publisher-confirm
//! mode, so `publish` returns only after the broker accepted the message.
//! The channel's prefetch is bounded by `BrokerSettings::prefetch_count`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, warn};

use crate::config::BrokerSettings;
use crate::error::BrokerError;
use crate::ports::{
    Acknowledger, BindingSpec, BrokerChannel, BrokerConnector, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, Publication, QueueSpec,
};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

/// Connects to an AMQP 0-9-1 broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, settings: &BrokerSettings) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(settings.connection_name.clone()));

        let connection = Connection::connect(&settings.amqp_uri(), properties)
            .await
            .map_err(|e| classify(e, settings))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| classify(e, settings))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| classify(e, settings))?;
        channel
            .basic_qos(settings.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| classify(e, settings))?;

        debug!(
            address = %settings.address,
            prefetch = settings.prefetch_count,
            "AMQP channel opened"
        );
        Ok(Arc::new(AmqpChannel {
            settings: settings.clone(),
            connection,
            channel,
        }))
    }
}

struct AmqpChannel {
    settings: BrokerSettings,
    connection: Connection,
    channel: Channel,
}

impl AmqpChannel {
    fn error(&self, error: lapin::Error) -> BrokerError {
        classify(error, &self.settings)
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let kind = match spec.kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(&spec.name, kind, options, FieldTable::default())
            .await
            .map_err(|e| self.error(e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(&spec.name, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| self.error(e))
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.error(e))
    }

    async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(publication.content_type.clone()))
            .with_delivery_mode(PERSISTENT);
        if let Some(id) = &publication.message_id {
            properties = properties.with_message_id(ShortString::from(id.clone()));
        }
        if !publication.headers.is_empty() {
            let mut table = FieldTable::default();
            for (key, value) in &publication.headers {
                table.insert(
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(LongString::from(value.clone())),
                );
            }
            properties = properties.with_headers(table);
        }

        let confirm = self
            .channel
            .basic_publish(
                &publication.exchange,
                &publication.routing_key,
                BasicPublishOptions::default(),
                &publication.body,
                properties,
            )
            .await
            .map_err(|e| self.error(e))?
            .await
            .map_err(|e| self.error(e))?;

        if confirm.is_nack() {
            return Err(BrokerError::Nacked(publication.exchange));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.error(e))?;

        let settings = self.settings.clone();
        Ok(Box::pin(consumer.map(move |item| match item {
            Ok(delivery) => Ok(into_delivery(delivery)),
            Err(e) => Err(classify(e, &settings)),
        })))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| self.error(e))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "shutdown").await {
                warn!(error = %e, "Cannot close AMQP channel");
            }
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "shutdown")
                .await
                .map_err(|e| self.error(e))?;
        }
        Ok(())
    }
}

fn into_delivery(delivery: AmqpDelivery) -> Delivery {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), header_text(value)))
                .collect()
        })
        .unwrap_or_default();

    Delivery::new(delivery.data, Box::new(AmqpAcker(delivery.acker)))
        .with_message_id(message_id)
        .with_redelivered(delivery.redelivered)
        .with_headers(headers)
}

fn header_text(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(text) => String::from_utf8_lossy(text.as_bytes()).into_owned(),
        AMQPValue::ShortString(text) => text.as_str().to_string(),
        other => format!("{other:?}"),
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(settle_error)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(settle_error)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(settle_error)
    }
}

fn settle_error(error: lapin::Error) -> BrokerError {
    match error {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::ChannelClosed
        }
        other => BrokerError::Protocol(other.to_string()),
    }
}

/// Map a client error onto the port's taxonomy.
fn classify(error: lapin::Error, settings: &BrokerSettings) -> BrokerError {
    match error {
        lapin::Error::IOError(e) => BrokerError::Unreachable {
            address: settings.address.clone(),
            reason: e.to_string(),
        },
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::ChannelClosed
        }
        lapin::Error::ProtocolError(e) => match e.get_id() {
            403 => BrokerError::AccessRefused {
                username: settings.username.clone(),
            },
            404 => BrokerError::NotFound(e.to_string()),
            406 => BrokerError::PreconditionFailed(e.to_string()),
            _ => BrokerError::Protocol(e.to_string()),
        },
        other => BrokerError::Protocol(other.to_string()),
    }
}
