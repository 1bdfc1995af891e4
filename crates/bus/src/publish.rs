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

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, ExchangeKind};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use manman_common::routing::MANMAN_EXCHANGE;
use manman_common::timeouts::PUBLISH_DEADLINE;

use crate::connect::Broker;
use crate::{BusError, retryable};

const PUBLISH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Publisher over a dedicated channel. Channels are not shared across tasks;
/// clone-by-Arc and the internal mutex keep the channel single-writer.
pub struct Publisher {
    broker: Arc<Broker>,
    channel: Mutex<Option<Channel>>,
}

impl Publisher {
    /// Open a channel and make sure the primary topic exchange exists.
    pub async fn new(broker: Arc<Broker>) -> Result<Self, BusError> {
        let publisher = Self {
            broker,
            channel: Mutex::new(None),
        };
        publisher.reopen().await?;
        Ok(publisher)
    }

    async fn reopen(&self) -> Result<(), BusError> {
        let conn = self.broker.connection().await?;
        let channel = conn.create_channel().await?;
        channel
            .exchange_declare(
                MANMAN_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        *self.channel.lock().await = Some(channel);
        Ok(())
    }

    /// Make sure another durable topic exchange exists (the external
    /// fan-out exchange, typically).
    pub async fn declare_topic_exchange(&self, exchange: &str) -> Result<(), BusError> {
        let guard = self.channel.lock().await;
        let Some(channel) = guard.as_ref() else {
            return Err(BusError::Connect("publisher channel not open".to_string()));
        };
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// JSON-serialize and publish. Persistent delivery, bounded retry with
    /// exponential backoff; a closed channel is reopened before the retry.
    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), BusError> {
        let body = serde_json::to_vec(payload)?;
        self.publish_raw(exchange, routing_key, &body, BasicProperties::default())
            .await
    }

    /// Publish pre-encoded bytes with the given properties merged over the
    /// standard persistent/json/timestamped set.
    pub async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BusError> {
        let mut backoff = BACKOFF_BASE;
        let mut last_err = String::new();
        for attempt in 1..=PUBLISH_ATTEMPTS {
            match self.try_publish(exchange, routing_key, body, properties.clone()).await {
                Ok(()) => {
                    debug!(exchange, routing_key, attempt, "published");
                    return Ok(());
                }
                Err(e) => {
                    let retry = match &e {
                        BusError::Channel(le) => retryable(le),
                        BusError::Connect(_) => true,
                        _ => false,
                    };
                    warn!(exchange, routing_key, attempt, error = %e, "publish attempt failed");
                    if !retry {
                        return Err(e);
                    }
                    last_err = e.to_string();
                    if attempt == PUBLISH_ATTEMPTS {
                        break;
                    }
                    // A closed channel needs reopening before it's worth
                    // trying again; failure here falls through to backoff.
                    if let Err(re) = self.reopen().await {
                        warn!(error = %re, "channel reopen failed");
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
        Err(BusError::PublishExhausted {
            attempts: PUBLISH_ATTEMPTS,
            last: last_err,
        })
    }

    async fn try_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BusError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let properties = properties
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_timestamp(timestamp);

        let guard = self.channel.lock().await;
        let Some(channel) = guard.as_ref() else {
            return Err(BusError::Connect("publisher channel not open".to_string()));
        };
        let confirm = tokio::time::timeout(
            PUBLISH_DEADLINE,
            channel.basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            ),
        )
        .await
        .map_err(|_| BusError::Connect(format!("publish to {routing_key} timed out")))??;

        tokio::time::timeout(PUBLISH_DEADLINE, confirm)
            .await
            .map_err(|_| BusError::Connect(format!("publish confirm for {routing_key} timed out")))??;
        Ok(())
    }
}
