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

//! Reply-correlated request/response over the default exchange. Used by
//! hosts to reach the control-plane API without a second transport stack.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::BasicProperties;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::connect::Broker;
use crate::BusError;

pub struct RpcClient {
    broker: Arc<Broker>,
}

impl RpcClient {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Publish `request` to `queue` and await the correlated reply.
    ///
    /// A fresh exclusive auto-delete reply queue is declared per call; the
    /// broker names it and reaps it when the channel goes away. Replies with
    /// a foreign correlation id (stale redeliveries) are acked and skipped.
    pub async fn call<Req, Resp>(
        &self,
        queue: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, BusError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let conn = self.broker.connection().await?;
        let channel = conn.create_channel().await?;

        let reply_queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let reply_to = reply_queue.name().as_str().to_string();

        let correlation_id = Uuid::new_v4().to_string();
        let body = serde_json::to_vec(request)?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_reply_to(reply_to.as_str().into())
            .with_correlation_id(correlation_id.as_str().into());

        let mut replies = channel
            .basic_consume(
                &reply_to,
                &format!("rpc-{correlation_id}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .basic_publish("", queue, BasicPublishOptions::default(), &body, properties)
            .await?
            .await?;
        debug!(queue, correlation_id, "rpc request sent");

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            let delivery = tokio::select! {
                _ = &mut deadline => {
                    return Err(BusError::RpcTimeout { queue: queue.to_string() });
                }
                next = replies.next() => match next {
                    Some(Ok(d)) => d,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(BusError::RpcDecode("reply stream closed".to_string()));
                    }
                },
            };

            delivery.ack(BasicAckOptions::default()).await?;
            let matched = delivery
                .properties
                .correlation_id()
                .as_ref()
                .is_some_and(|c| c.as_str() == correlation_id);
            if !matched {
                debug!(queue, "skipping reply with foreign correlation id");
                continue;
            }
            return serde_json::from_slice(&delivery.data)
                .map_err(|e| BusError::RpcDecode(e.to_string()));
        }
    }
}
