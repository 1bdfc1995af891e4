// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use manman_common::HandlerError;
use manman_common::messages::CommandReply;

use crate::connect::Broker;
use crate::{BusError, topic};

/// How long an idle non-durable queue lives before the broker reaps it.
const TRANSIENT_QUEUE_EXPIRY_MS: i64 = 300_000;

/// Redelivery budget before a transiently-failing message is dead-lettered.
const MAX_DEATHS: i64 = 3;

/// What a handler sees of a delivery.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// Handlers may return bytes to be sent back on the reply queue (RPC
/// servers do); plain event handlers return `None`.
pub type HandlerResult = Result<Option<Vec<u8>>, HandlerError>;

type Handler =
    Arc<dyn Fn(InboundMessage) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// Queue arguments per our declaration policy: durable queues dead-letter
/// into `<queue>-dlq` and MUST NOT carry `x-expires` (the broker rejects a
/// redeclaration otherwise); transient non-auto-delete queues expire instead.
pub fn queue_arguments(queue: &str, durable: bool, auto_delete: bool) -> FieldTable {
    let mut args = FieldTable::default();
    if durable {
        args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(format!("{queue}-dlq").into()),
        );
    } else if !auto_delete {
        args.insert("x-expires".into(), AMQPValue::LongLongInt(TRANSIENT_QUEUE_EXPIRY_MS));
    }
    args
}

fn table_get<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    table.inner().iter().find(|(k, _)| k.as_str() == key).map(|(_, v)| v)
}

/// How many times the broker has already dead-cycled this delivery, read off
/// the `x-death` header.
pub fn death_count(properties: &BasicProperties) -> i64 {
    let Some(headers) = properties.headers() else {
        return 0;
    };
    let Some(AMQPValue::FieldArray(deaths)) = table_get(headers, "x-death") else {
        return 0;
    };
    let Some(AMQPValue::FieldTable(first)) = deaths.as_slice().first() else {
        return 0;
    };
    match table_get(first, "count") {
        Some(AMQPValue::LongLongInt(n)) => *n,
        Some(AMQPValue::LongInt(n)) => i64::from(*n),
        _ => 0,
    }
}

/// Ack/nack decision for a finished handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

pub fn disposition(outcome: &HandlerResult, deaths: i64) -> Disposition {
    match outcome {
        Ok(_) => Disposition::Ack,
        Err(HandlerError::Permanent(_)) => Disposition::DeadLetter,
        Err(_) if deaths < MAX_DEATHS => Disposition::Requeue,
        Err(_) => Disposition::DeadLetter,
    }
}

/// A queue consumer with pattern-keyed handlers. Prefetch is pinned to 1 so
/// commands for one host serialize naturally.
pub struct Consumer {
    channel: Channel,
    queue: String,
    durable: bool,
    handlers: Vec<(String, Handler)>,
}

impl Consumer {
    /// Declare the queue (and its DLQ, when durable) and set fair dispatch.
    pub async fn new(
        broker: &Broker,
        queue: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Result<Self, BusError> {
        let conn = broker.connection().await?;
        let channel = conn.create_channel().await?;

        if durable {
            channel
                .queue_declare(
                    &format!("{queue}-dlq"),
                    QueueDeclareOptions {
                        durable: true,
                        auto_delete: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    auto_delete,
                    ..Default::default()
                },
                queue_arguments(queue, durable, auto_delete),
            )
            .await?;

        channel.basic_qos(1, BasicQosOptions::default()).await?;

        Ok(Self {
            channel,
            queue: queue.to_string(),
            durable,
            handlers: vec![],
        })
    }

    pub async fn bind(&self, exchange: &str, pattern: &str) -> Result<(), BusError> {
        self.channel
            .queue_bind(
                &self.queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Register a handler for routing keys matching `pattern` (`*`/`#`
    /// topic semantics). First matching handler wins.
    pub fn on<F, Fut>(&mut self, pattern: &str, handler: F)
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers
            .push((pattern.to_string(), Arc::new(move |m| Box::pin(handler(m)))));
    }

    /// Consume until cancelled. Handler results drive ack/requeue/DLQ; a
    /// delivery carrying `reply_to` + `correlation_id` gets a correlated
    /// reply once its handler completes, success or not.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BusError> {
        let mut stream = self
            .channel
            .basic_consume(
                &self.queue,
                &format!("{}-consumer", self.queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %self.queue, durable = self.durable, "consuming");
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(queue = %self.queue, "consumer cancelled");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(d)) => d,
                    Some(Err(e)) => {
                        error!(queue = %self.queue, error = %e, "consume stream error");
                        return Err(e.into());
                    }
                    None => {
                        warn!(queue = %self.queue, "consume stream closed");
                        return Ok(());
                    }
                },
            };
            self.dispatch(delivery).await;
        }
    }

    async fn dispatch(&self, delivery: Delivery) {
        let routing_key = delivery.routing_key.as_str().to_string();
        let message = InboundMessage {
            routing_key: routing_key.clone(),
            payload: delivery.data.clone(),
            redelivered: delivery.redelivered,
        };

        let Some((pattern, handler)) = self
            .handlers
            .iter()
            .find(|(pattern, _)| topic::matches(pattern, &routing_key))
        else {
            warn!(queue = %self.queue, routing_key, "no handler for routing key, dropping");
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %e, "ack failed");
            }
            return;
        };

        debug!(queue = %self.queue, routing_key, pattern, "dispatching");
        let outcome = handler(message).await;

        self.send_reply(&delivery, &outcome).await;

        let deaths = death_count(&delivery.properties);
        match disposition(&outcome, deaths) {
            Disposition::Ack => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(routing_key, error = %e, "ack failed");
                }
            }
            Disposition::Requeue => {
                warn!(routing_key, deaths, error = ?outcome.as_ref().err(), "requeueing");
                if let Err(e) = delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
                {
                    error!(routing_key, error = %e, "nack failed");
                }
            }
            Disposition::DeadLetter => {
                warn!(routing_key, deaths, error = ?outcome.as_ref().err(), "dead-lettering");
                if let Err(e) = delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
                {
                    error!(routing_key, error = %e, "nack failed");
                }
            }
        }
    }

    /// Correlated reply over the default exchange. RPC handlers supply their
    /// own payload; everything else gets the plain `CommandReply` envelope.
    async fn send_reply(&self, delivery: &Delivery, outcome: &HandlerResult) {
        let (Some(reply_to), Some(correlation_id)) = (
            delivery.properties.reply_to().as_ref(),
            delivery.properties.correlation_id().as_ref(),
        ) else {
            return;
        };

        let body = match outcome {
            Ok(Some(payload)) => payload.clone(),
            Ok(None) => serde_json::to_vec(&CommandReply {
                correlation_id: correlation_id.as_str().to_string(),
                success: true,
                error: None,
            })
            .unwrap_or_default(),
            Err(e) => serde_json::to_vec(&CommandReply {
                correlation_id: correlation_id.as_str().to_string(),
                success: false,
                error: Some(e.to_string()),
            })
            .unwrap_or_default(),
        };

        let properties = BasicProperties::default()
            .with_correlation_id(correlation_id.clone())
            .with_content_type("application/json".into());

        let publish = self
            .channel
            .basic_publish(
                "",
                reply_to.as_str(),
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await;
        if let Err(e) = publish {
            error!(reply_to = reply_to.as_str(), error = %e, "reply publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_none() -> HandlerResult {
        Ok(None)
    }

    fn permanent() -> HandlerResult {
        Err(HandlerError::permanent("entity not found"))
    }

    fn transient() -> HandlerResult {
        Err(HandlerError::transient("connection reset"))
    }

    #[test]
    fn durable_queue_arguments_have_no_expiry() {
        let args = queue_arguments("host-1-commands", true, false);
        assert!(table_get(&args, "x-expires").is_none());
        assert_eq!(
            table_get(&args, "x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString("host-1-commands-dlq".into()))
        );
        assert_eq!(
            table_get(&args, "x-dead-letter-exchange"),
            Some(&AMQPValue::LongString("".into()))
        );
    }

    #[test]
    fn transient_queue_gets_expiry() {
        let args = queue_arguments("scratch", false, false);
        assert_eq!(
            table_get(&args, "x-expires"),
            Some(&AMQPValue::LongLongInt(300_000))
        );
        assert!(table_get(&args, "x-dead-letter-exchange").is_none());
    }

    #[test]
    fn auto_delete_queue_gets_no_arguments() {
        let args = queue_arguments("reply-abc", false, true);
        assert!(args.inner().is_empty());
    }

    #[test]
    fn permanent_goes_straight_to_dlq() {
        assert_eq!(disposition(&permanent(), 0), Disposition::DeadLetter);
    }

    #[test]
    fn transient_requeues_until_death_budget() {
        assert_eq!(disposition(&transient(), 0), Disposition::Requeue);
        assert_eq!(disposition(&transient(), 2), Disposition::Requeue);
        assert_eq!(disposition(&transient(), 3), Disposition::DeadLetter);
    }

    #[test]
    fn success_acks() {
        assert_eq!(disposition(&ok_none(), 0), Disposition::Ack);
        assert_eq!(disposition(&Ok(Some(vec![1])), 2), Disposition::Ack);
    }

    #[test]
    fn death_count_reads_x_death_header() {
        let mut inner = FieldTable::default();
        inner.insert("count".into(), AMQPValue::LongLongInt(2));
        let mut headers = FieldTable::default();
        headers.insert(
            "x-death".into(),
            AMQPValue::FieldArray(vec![AMQPValue::FieldTable(inner)].into()),
        );
        let props = BasicProperties::default().with_headers(headers);
        assert_eq!(death_count(&props), 2);
    }

    #[test]
    fn death_count_defaults_to_zero() {
        assert_eq!(death_count(&BasicProperties::default()), 0);
        let props = BasicProperties::default().with_headers(FieldTable::default());
        assert_eq!(death_count(&props), 0);
    }
}
