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

//! Client side of the control-plane API, spoken over the broker's
//! reply-correlated RPC queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use manman_bus::RpcClient;
use manman_common::domain::{HostCapabilities, Server, Session};
use manman_common::messages::{ApiRequest, ApiResponse};
use manman_common::routing::API_REQUEST_QUEUE;
use manman_common::timeouts::REGISTER_DIAL_DEADLINE;

const REGISTER_ATTEMPTS: u32 = 5;
const REGISTER_BACKOFF_BASE: Duration = Duration::from_secs(1);
const REGISTER_BACKOFF_CAP: Duration = Duration::from_secs(32);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control plane rpc failed: {0}")]
    Rpc(#[from] manman_bus::BusError),
    #[error("control plane refused: {0}")]
    Refused(String),
    #[error("unexpected control plane response")]
    UnexpectedResponse,
}

pub struct ControlClient {
    rpc: RpcClient,
}

impl ControlClient {
    pub fn new(broker: Arc<manman_bus::Broker>) -> Self {
        Self {
            rpc: RpcClient::new(broker),
        }
    }

    async fn call(&self, request: &ApiRequest) -> Result<ApiResponse, ControlError> {
        let response: ApiResponse = self
            .rpc
            .call(API_REQUEST_QUEUE, request, REGISTER_DIAL_DEADLINE)
            .await?;
        if let ApiResponse::Error { message } = response {
            return Err(ControlError::Refused(message));
        }
        Ok(response)
    }

    /// Register this host, retrying with exponential backoff; the control
    /// plane may simply not be up yet when a host boots.
    pub async fn register_with_retry(
        &self,
        name: &str,
        environment: &str,
        capabilities: &HostCapabilities,
    ) -> Result<Server, ControlError> {
        let mut backoff = REGISTER_BACKOFF_BASE;
        let mut last = None;
        for attempt in 1..=REGISTER_ATTEMPTS {
            info!(name, environment, attempt, "registering with control plane");
            match self
                .call(&ApiRequest::RegisterServer {
                    name: name.to_string(),
                    environment: environment.to_string(),
                    capabilities: capabilities.clone(),
                })
                .await
            {
                Ok(ApiResponse::ServerRegistered(server)) => {
                    info!(server_id = server.server_id, "registered");
                    return Ok(server);
                }
                Ok(_) => return Err(ControlError::UnexpectedResponse),
                Err(e) => {
                    warn!(attempt, error = %e, "registration attempt failed");
                    last = Some(e);
                }
            }
            if attempt < REGISTER_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(REGISTER_BACKOFF_CAP);
            }
        }
        Err(last.unwrap_or(ControlError::UnexpectedResponse))
    }

    /// Session rows the control plane believes belong to this host; the
    /// ground truth for orphan recovery.
    pub async fn sessions_for_server(&self, server_id: i64) -> Result<Vec<Session>, ControlError> {
        match self
            .call(&ApiRequest::SessionsForServer { server_id })
            .await?
        {
            ApiResponse::Sessions(sessions) => Ok(sessions),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }
}
