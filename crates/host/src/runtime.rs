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

//! Wiring between the per-host command queue and the session supervisor,
//! plus the heartbeat.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use manman_bus::{Broker, Consumer, Publisher};
use manman_common::ServerStatus;
use manman_common::messages::{
    HealthUpdate, HostStatusUpdate, SendInputCommand, StartSessionCommand, StopSessionCommand,
};
use manman_common::routing::{
    CommandVerb, MANMAN_EXCHANGE, health_key, host_command_binding, host_command_queue,
    host_status_key, session_command_key,
};
use manman_common::timeouts::HEALTH_PERIOD;

use crate::sessions::SessionSupervisor;

pub struct HostRuntime {
    pub server_id: i64,
    pub publisher: Arc<Publisher>,
    pub supervisor: Arc<SessionSupervisor>,
}

impl HostRuntime {
    pub async fn publish_host_status(&self, status: ServerStatus) {
        let update = HostStatusUpdate {
            server_id: self.server_id,
            status,
        };
        if let Err(e) = self
            .publisher
            .publish(MANMAN_EXCHANGE, &host_status_key(self.server_id), &update)
            .await
        {
            error!(%status, error = %e, "host status publish failed");
        }
    }

    /// Heartbeats are fire-and-forget; a failed one is logged and the next
    /// tick tries again.
    pub async fn publish_health(&self) {
        let update = HealthUpdate {
            server_id: self.server_id,
            timestamp: Utc::now(),
            session_stats: self.supervisor.session_stats(),
        };
        if let Err(e) = self
            .publisher
            .publish(MANMAN_EXCHANGE, &health_key(self.server_id), &update)
            .await
        {
            error!(error = %e, "health publish failed");
        }
    }

    pub async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(HEALTH_PERIOD);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("health loop stopped");
                    return;
                }
                _ = ticker.tick() => self.publish_health().await,
            }
        }
    }

    /// Declare the per-host command queue and hook each verb up to the
    /// supervisor. Prefetch 1 on the queue serializes commands per host;
    /// separate sessions still run their containers in parallel.
    pub async fn command_consumer(&self, broker: &Broker) -> Result<Consumer, manman_bus::BusError> {
        let queue = host_command_queue(self.server_id);
        let mut consumer = Consumer::new(broker, &queue, true, false).await?;
        consumer
            .bind(MANMAN_EXCHANGE, &host_command_binding(self.server_id))
            .await?;

        let supervisor = self.supervisor.clone();
        consumer.on(
            &session_command_key(self.server_id, CommandVerb::Start),
            move |m| {
                let supervisor = supervisor.clone();
                async move {
                    let cmd: StartSessionCommand = serde_json::from_slice(&m.payload)?;
                    supervisor.start_session(cmd).await?;
                    Ok(None)
                }
            },
        );

        let supervisor = self.supervisor.clone();
        consumer.on(
            &session_command_key(self.server_id, CommandVerb::Stop),
            move |m| {
                let supervisor = supervisor.clone();
                async move {
                    let cmd: StopSessionCommand = serde_json::from_slice(&m.payload)?;
                    supervisor.stop_session(cmd).await?;
                    Ok(None)
                }
            },
        );

        let supervisor = self.supervisor.clone();
        consumer.on(
            &session_command_key(self.server_id, CommandVerb::Kill),
            move |m| {
                let supervisor = supervisor.clone();
                async move {
                    let cmd: StopSessionCommand = serde_json::from_slice(&m.payload)?;
                    supervisor.kill_session(cmd).await?;
                    Ok(None)
                }
            },
        );

        let supervisor = self.supervisor.clone();
        consumer.on(
            &session_command_key(self.server_id, CommandVerb::SendInput),
            move |m| {
                let supervisor = supervisor.clone();
                async move {
                    let cmd: SendInputCommand = serde_json::from_slice(&m.payload)?;
                    supervisor.send_input(cmd).await?;
                    Ok(None)
                }
            },
        );

        Ok(consumer)
    }
}
