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

//! Wire envelopes carried over the broker. Everything here is JSON on the
//! wire; unknown fields are ignored on decode so hosts and daemon can be
//! upgraded independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{
    HostCapabilities, PortBinding, RenderedConfiguration, Server, Session, VolumeSpec,
};
use crate::status::{ServerStatus, SessionStatus};

/// Command telling a host to create and start a session's container.
/// The control plane has already planned the session; everything the host
/// needs to act rides in this envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSessionCommand {
    pub session_id: i64,
    pub sgc_id: i64,
    #[serde(default)]
    pub force: bool,
    pub game_config: GameConfigSpec,
    pub server_game_config: ServerGameConfigSpec,
    #[serde(default)]
    pub rendered_configurations: Vec<RenderedConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfigSpec {
    pub image: String,
    #[serde(default)]
    pub env_template: BTreeMap<String, String>,
    #[serde(default)]
    pub args_template: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerGameConfigSpec {
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopSessionCommand {
    pub session_id: i64,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendInputCommand {
    pub session_id: i64,
    pub input: String,
}

/// Status observed by a host, published on `status.session.<id>.<state>` and,
/// once validated, re-published by the processor on the external exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusUpdate {
    pub session_id: i64,
    pub sgc_id: i64,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Periodic host heartbeat. Session stats are advisory; the processor's
/// session rows are the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthUpdate {
    pub server_id: i64,
    pub timestamp: DateTime<Utc>,
    pub session_stats: SessionStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: u32,
    pub pending: u32,
    pub starting: u32,
    pub running: u32,
    pub stopping: u32,
    pub stopped: u32,
    pub crashed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatusUpdate {
    pub server_id: i64,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub session_id: i64,
    pub timestamp_ms: i64,
    pub source: LogSource,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    Host,
}

/// Reply published to `reply_to` when an inbound message carried a
/// correlation id. `success: false` carries the handler's error text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub correlation_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Requests served by the control plane over the reply-correlated RPC queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body", rename_all = "snake_case")]
pub enum ApiRequest {
    RegisterServer {
        name: String,
        environment: String,
        capabilities: HostCapabilities,
    },
    GetSessionConfiguration {
        session_id: i64,
    },
    AllocateSessionPorts {
        session_id: i64,
        server_id: i64,
        ports: Vec<u16>,
    },
    SessionsForServer {
        server_id: i64,
    },
    CreateSession {
        sgc_id: i64,
    },
    PublishSessionCommand {
        session_id: i64,
        verb: crate::routing::CommandVerb,
        payload: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "body", rename_all = "snake_case")]
pub enum ApiResponse {
    ServerRegistered(Server),
    SessionConfiguration(SessionConfiguration),
    PortsAllocated { host_ports: Vec<u16> },
    Sessions(Vec<Session>),
    SessionCreated(Session),
    CommandPublished { routing_key: String },
    Error { message: String },
}

/// Everything a host needs to materialize one session, with all cascaded
/// patches already folded into per-strategy `rendered_content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfiguration {
    pub session_id: i64,
    pub sgc_id: i64,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub rendered_configurations: Vec<RenderedConfiguration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn round_trip<T>(value: &T)
    where
        T: Serialize + for<'de> Deserialize<'de> + PartialEq + std::fmt::Debug,
    {
        let json = serde_json::to_string(value).unwrap();
        let back: T = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, value);
    }

    #[test]
    fn start_command_round_trips() {
        round_trip(&StartSessionCommand {
            session_id: 7,
            sgc_id: 3,
            force: false,
            game_config: GameConfigSpec {
                image: "itzg/minecraft-server:latest".into(),
                env_template: BTreeMap::from([("EULA".to_string(), "TRUE".to_string())]),
                args_template: vec!["--nogui".into()],
                volumes: vec![],
            },
            server_game_config: ServerGameConfigSpec {
                port_bindings: vec![PortBinding {
                    container_port: 25565,
                    host_port: 31000,
                }],
            },
            rendered_configurations: vec![RenderedConfiguration {
                strategy_name: "server-properties".into(),
                strategy_type: crate::domain::StrategyType::FileProperties,
                target_path: "/data/server.properties".into(),
                base_content: String::new(),
                rendered_content: "motd=hello\n".into(),
            }],
        });
    }

    #[test]
    fn status_update_round_trips() {
        round_trip(&SessionStatusUpdate {
            session_id: 1,
            sgc_id: 2,
            status: SessionStatus::Crashed,
            exit_code: Some(137),
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn status_update_omits_absent_exit_code() {
        let update = SessionStatusUpdate {
            session_id: 1,
            sgc_id: 2,
            status: SessionStatus::Running,
            exit_code: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(!json.contains("exit_code"));
    }

    #[test]
    fn control_commands_round_trip() {
        round_trip(&StopSessionCommand {
            session_id: 3,
            force: true,
        });
        round_trip(&SendInputCommand {
            session_id: 3,
            input: "say restarting in 5 minutes".into(),
        });
        round_trip(&HostStatusUpdate {
            server_id: 2,
            status: ServerStatus::Online,
        });
    }

    #[test]
    fn session_configuration_round_trips() {
        round_trip(&SessionConfiguration {
            session_id: 7,
            sgc_id: 3,
            image: "itzg/minecraft-server:latest".into(),
            env: BTreeMap::from([("EULA".to_string(), "TRUE".to_string())]),
            cmd: vec!["--nogui".into()],
            port_bindings: vec![PortBinding {
                container_port: 25565,
                host_port: 31000,
            }],
            volumes: vec![VolumeSpec {
                name: "world".into(),
                container_path: "/data".into(),
                host_subpath: "world".into(),
                options: vec![],
                read_only: false,
                volume_type: crate::domain::VolumeType::Bind,
            }],
            rendered_configurations: vec![],
        });
    }

    #[test]
    fn stop_command_defaults_force_to_false() {
        let cmd: StopSessionCommand = serde_json::from_str(r#"{"session_id":9}"#).unwrap();
        assert!(!cmd.force);
    }

    #[test]
    fn health_and_log_round_trip() {
        round_trip(&HealthUpdate {
            server_id: 4,
            timestamp: Utc::now(),
            session_stats: SessionStats {
                total: 3,
                running: 2,
                crashed: 1,
                ..Default::default()
            },
        });
        round_trip(&LogMessage {
            session_id: 9,
            timestamp_ms: 1_700_000_000_000,
            source: LogSource::Stderr,
            message: "[Server] panic".into(),
        });
    }

    #[test]
    fn api_request_tagging() {
        let req = ApiRequest::GetSessionConfiguration { session_id: 12 };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"op\":\"get_session_configuration\""));
        round_trip(&req);
        round_trip(&ApiRequest::RegisterServer {
            name: "gs-01-prod".into(),
            environment: "prod".into(),
            capabilities: HostCapabilities {
                mem_mb: 32768,
                cpu_m: 16000,
                docker_version: "27.1.1".into(),
            },
        });
    }

    #[test]
    fn stale_host_payload_shape() {
        // What external consumers see on manman.host.stale.
        let update = HostStatusUpdate {
            server_id: 12,
            status: ServerStatus::Offline,
        };
        assert_eq!(
            serde_json::to_string(&update).unwrap(),
            r#"{"server_id":12,"status":"offline"}"#
        );
    }

    #[test]
    fn reply_round_trips() {
        round_trip(&CommandReply {
            correlation_id: "c".into(),
            success: true,
            error: None,
        });
        round_trip(&CommandReply {
            correlation_id: "c2".into(),
            success: false,
            error: Some("session not found".into()),
        });
    }
}
