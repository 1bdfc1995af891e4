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

//! The control API, served over the broker's reply-correlated RPC queue.
//! Hosts register and fetch their session lists here; session planning
//! turns an SGC into a pending row, a port allocation and a start command
//! on the owning host's queue.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use manman_bus::{Broker, Consumer, Publisher};
use manman_common::HostCapabilities;
use manman_common::domain::{RenderedConfiguration, Session};
use manman_common::messages::{
    ApiRequest, ApiResponse, GameConfigSpec, ServerGameConfigSpec, SessionConfiguration,
    StartSessionCommand,
};
use manman_common::routing::{
    API_REQUEST_QUEUE, CommandVerb, MANMAN_EXCHANGE, session_command_key,
};

use crate::repository::Repository;

pub struct ApiService {
    repo: Arc<Repository>,
    publisher: Arc<Publisher>,
}

/// Fold the patch cascade into per-strategy rendered content. The order is
/// game_config, then server_game_config, then session: concatenation order
/// is override order, and the renderer's merge makes the last writer win
/// per key.
pub fn session_configuration(
    repo: &Repository,
    session_id: i64,
) -> Result<SessionConfiguration, String> {
    let session = repo
        .session(session_id)
        .ok_or_else(|| format!("no such session: {session_id}"))?;
    let sgc = repo
        .sgc(session.sgc_id)
        .ok_or_else(|| format!("no such server game config: {}", session.sgc_id))?;
    let game_config = repo
        .game_config(sgc.game_config_id)
        .ok_or_else(|| format!("no such game config: {}", sgc.game_config_id))?;

    let mut rendered_configurations = vec![];
    for strategy in repo.strategies_for_game_config(game_config.game_config_id) {
        let cascade = [
            repo.game_config_patch(strategy.strategy_id, game_config.game_config_id),
            repo.sgc_patch(strategy.strategy_id, sgc.sgc_id),
            repo.session_patch(strategy.strategy_id, session_id),
        ];
        let rendered_content = cascade
            .into_iter()
            .flatten()
            .map(|patch| patch.patch_content)
            .collect::<Vec<_>>()
            .join("\n");
        rendered_configurations.push(RenderedConfiguration {
            strategy_name: strategy.name.clone(),
            strategy_type: strategy.strategy_type,
            target_path: strategy.target_path.clone(),
            base_content: strategy.base_template.clone(),
            rendered_content,
        });
    }

    Ok(SessionConfiguration {
        session_id,
        sgc_id: sgc.sgc_id,
        image: game_config.image.clone(),
        env: game_config.env_template.clone(),
        cmd: game_config.args_template.clone(),
        port_bindings: sgc.port_bindings.clone(),
        volumes: game_config.volumes.clone(),
        rendered_configurations,
    })
}

impl ApiService {
    pub fn new(repo: Arc<Repository>, publisher: Arc<Publisher>) -> Arc<Self> {
        Arc::new(Self { repo, publisher })
    }

    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        match request {
            ApiRequest::RegisterServer {
                name,
                environment,
                capabilities,
            } => self.register_server(&name, &environment, capabilities),
            ApiRequest::GetSessionConfiguration { session_id } => {
                match session_configuration(&self.repo, session_id) {
                    Ok(configuration) => ApiResponse::SessionConfiguration(configuration),
                    Err(message) => ApiResponse::Error { message },
                }
            }
            ApiRequest::AllocateSessionPorts {
                session_id,
                server_id,
                ports,
            } => match self.repo.allocate_ports(session_id, server_id, &ports) {
                Ok(host_ports) => ApiResponse::PortsAllocated { host_ports },
                Err(e) => ApiResponse::Error {
                    message: e.to_string(),
                },
            },
            ApiRequest::SessionsForServer { server_id } => {
                ApiResponse::Sessions(self.repo.sessions_for_server(server_id))
            }
            ApiRequest::CreateSession { sgc_id } => match self.create_session(sgc_id).await {
                Ok(session) => ApiResponse::SessionCreated(session),
                Err(message) => ApiResponse::Error { message },
            },
            ApiRequest::PublishSessionCommand {
                session_id,
                verb,
                payload,
            } => match self.publish_session_command(session_id, verb, &payload).await {
                Ok(routing_key) => ApiResponse::CommandPublished { routing_key },
                Err(message) => ApiResponse::Error { message },
            },
        }
    }

    fn register_server(
        &self,
        name: &str,
        environment: &str,
        capabilities: HostCapabilities,
    ) -> ApiResponse {
        let server = self.repo.register_server(name, environment, capabilities);
        info!(
            server_id = server.server_id,
            name = %server.name,
            environment = %server.environment,
            is_default = server.is_default,
            "server registered"
        );
        ApiResponse::ServerRegistered(server)
    }

    /// Plan a session onto the SGC's server: pending row, exclusive port
    /// allocation, then the start command onto the host's queue.
    async fn create_session(&self, sgc_id: i64) -> Result<Session, String> {
        let sgc = self
            .repo
            .sgc(sgc_id)
            .ok_or_else(|| format!("no such server game config: {sgc_id}"))?;
        let game_config = self
            .repo
            .game_config(sgc.game_config_id)
            .ok_or_else(|| format!("no such game config: {}", sgc.game_config_id))?;
        self.repo
            .server(sgc.server_id)
            .ok_or_else(|| format!("no such server: {}", sgc.server_id))?;

        let session = self.repo.create_session(sgc_id, sgc.server_id);
        let host_ports: Vec<u16> = sgc.port_bindings.iter().map(|b| b.host_port).collect();
        if let Err(e) = self
            .repo
            .allocate_ports(session.session_id, sgc.server_id, &host_ports)
        {
            self.repo
                .update_session_status(
                    session.session_id,
                    manman_common::SessionStatus::Crashed,
                    None,
                )
                .ok();
            return Err(format!("port allocation failed: {e}"));
        }

        let configuration = session_configuration(&self.repo, session.session_id)?;
        let command = StartSessionCommand {
            session_id: session.session_id,
            sgc_id,
            force: false,
            game_config: GameConfigSpec {
                image: game_config.image,
                env_template: game_config.env_template,
                args_template: game_config.args_template,
                volumes: game_config.volumes,
            },
            server_game_config: ServerGameConfigSpec {
                port_bindings: sgc.port_bindings,
            },
            rendered_configurations: configuration.rendered_configurations,
        };

        let routing_key = session_command_key(sgc.server_id, CommandVerb::Start);
        self.publisher
            .publish(MANMAN_EXCHANGE, &routing_key, &command)
            .await
            .map_err(|e| format!("start command publish failed: {e}"))?;
        info!(
            session_id = session.session_id,
            sgc_id,
            server_id = sgc.server_id,
            "session planned"
        );
        Ok(session)
    }

    /// Route an arbitrary session command to the host owning the session.
    async fn publish_session_command(
        &self,
        session_id: i64,
        verb: CommandVerb,
        payload: &serde_json::Value,
    ) -> Result<String, String> {
        let session = self
            .repo
            .session(session_id)
            .ok_or_else(|| format!("no such session: {session_id}"))?;
        let routing_key = session_command_key(session.server_id, verb);
        self.publisher
            .publish(MANMAN_EXCHANGE, &routing_key, payload)
            .await
            .map_err(|e| format!("command publish failed: {e}"))?;
        Ok(routing_key)
    }

    /// RPC server loop: every request on the api queue gets a correlated
    /// JSON response. A payload that doesn't parse is dead-lettered.
    pub async fn run(
        self: Arc<Self>,
        broker: Arc<Broker>,
        cancel: CancellationToken,
    ) -> Result<(), manman_bus::BusError> {
        let mut consumer = Consumer::new(&broker, API_REQUEST_QUEUE, true, false).await?;
        let api = self.clone();
        consumer.on("#", move |m| {
            let api = api.clone();
            async move {
                let request: ApiRequest = serde_json::from_slice(&m.payload)?;
                let response = api.handle(request).await;
                if let ApiResponse::Error { message } = &response {
                    warn!(message = %message, "api request refused");
                }
                Ok(Some(serde_json::to_vec(&response).map_err(|e| {
                    manman_common::HandlerError::transient(e.to_string())
                })?))
            }
        });
        consumer.run(cancel).await
    }
}
