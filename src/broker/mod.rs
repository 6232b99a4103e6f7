//! Broker I/O.
//!
//! One AMQP connection, two channels: the consumer channel reads from the
//! device queue with a prefetch window matching the worker queue, the
//! publisher channel carries replies. Acknowledgement is manual and always
//! happens after the reply (or terminal rejection) is published, so a
//! crashed server causes redelivery instead of loss.

use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use log::{info, warn};

use crate::config::Broker as BrokerConfig;
use crate::errors::Error;
use crate::protocol::Response;

pub struct Broker {
    connection: Connection,
    consume_channel: Channel,
    publish_channel: Channel,
    queue: String,
    consumer_tag: String,
}

impl Broker {
    pub async fn connect(config: &BrokerConfig, prefetch: u16) -> Result<Broker, Error> {
        let connection =
            Connection::connect(&config.amqp_uri, ConnectionProperties::default()).await?;

        let consume_channel = connection.create_channel().await?;
        consume_channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        consume_channel
            .queue_declare(
                &config.device_id,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let publish_channel = connection.create_channel().await?;

        info!(
            "Connected to broker, consuming queue {:?} (prefetch {prefetch})",
            config.device_id
        );

        Ok(Broker {
            connection,
            consume_channel,
            publish_channel,
            queue: config.device_id.clone(),
            consumer_tag: format!("burrowctl-{}", config.device_id),
        })
    }

    pub async fn consume(&self) -> Result<Consumer, Error> {
        self.consume_channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(Error::from)
    }

    pub fn publisher(&self) -> Publisher {
        Publisher {
            channel: self.publish_channel.clone(),
        }
    }

    /// Stops new deliveries; in-flight ones keep their ackers.
    pub async fn stop_consuming(&self) {
        if let Err(e) = self
            .consume_channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!("basic_cancel failed: {e}");
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.close(200, "shutting down").await {
            warn!("broker close failed: {e}");
        }
    }
}

/// Cheap clone per worker; lapin channels are internally synchronized.
#[derive(Clone)]
pub struct Publisher {
    channel: Channel,
}

impl Publisher {
    /// Publishes one reply with the echoed correlation id. A transient
    /// failure is retried once; a second failure is reported to the caller
    /// who logs and moves on (the broker at-least-once contract covers the
    /// client side).
    pub async fn publish(
        &self,
        reply_to: &str,
        correlation_id: &str,
        response: &Response,
    ) -> Result<(), Error> {
        let payload = response.encode();
        if let Err(first) = self.try_publish(reply_to, correlation_id, &payload).await {
            warn!("publish to {reply_to:?} failed, retrying once: {first}");
            self.try_publish(reply_to, correlation_id, &payload)
                .await
                .map_err(Error::from)?;
        }
        Ok(())
    }

    async fn try_publish(
        &self,
        reply_to: &str,
        correlation_id: &str,
        payload: &[u8],
    ) -> Result<(), lapin::Error> {
        let properties = BasicProperties::default()
            .with_correlation_id(ShortString::from(correlation_id.to_string()))
            .with_content_type(ShortString::from("application/json".to_string()));

        self.channel
            .basic_publish(
                "",
                reply_to,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }
}
