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

//! Core entities of the fleet: servers, the game configuration hierarchy,
//! sessions, port allocations and configuration strategies/patches.
//!
//! All entity ids are `i64`, assigned by the control plane. Hosts never mint
//! ids of their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::status::{ServerStatus, SessionStatus};

/// A registered host machine. Created by host self-registration; the stable
/// name is `hostname-env` so a restarted host reclaims its row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub server_id: i64,
    pub name: String,
    pub environment: String,
    pub capabilities: HostCapabilities,
    pub last_seen: DateTime<Utc>,
    pub is_default: bool,
    pub status: ServerStatus,
}

/// What a host reported about the machine it runs on, straight from the
/// container runtime's info endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCapabilities {
    pub mem_mb: i64,
    pub cpu_m: i64,
    pub docker_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub game_id: i64,
    pub name: String,
}

/// A launchable configuration of a game: the image and its template
/// environment/arguments. Patches at lower levels override what's here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    pub game_config_id: i64,
    pub game_id: i64,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env_template: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub args_template: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

/// Binding of a GameConfig to a Server, carrying the per-host port bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerGameConfig {
    pub sgc_id: i64,
    pub game_config_id: i64,
    pub server_id: i64,
    pub name: String,
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub container_path: String,
    pub host_subpath: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub volume_type: VolumeType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeType {
    #[default]
    Bind,
    Named,
}

/// Runtime instance of an SGC scheduled onto a server. One container each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: i64,
    pub sgc_id: i64,
    pub server_id: i64,
    pub status: SessionStatus,
    pub container_id: Option<String>,
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A host port held for a session; lifetime equals the session's. The set of
/// allocations is disjoint per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub session_id: i64,
    pub server_id: i64,
    pub host_port: u16,
}

/// How one rendered artifact for a session is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationStrategy {
    pub strategy_id: i64,
    pub game_config_id: i64,
    pub name: String,
    pub strategy_type: StrategyType,
    pub target_path: String,
    #[serde(default)]
    pub base_template: String,
    #[serde(default)]
    pub render_options: std::collections::BTreeMap<String, String>,
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StrategyType {
    FileProperties,
    EnvVars,
    CliArgs,
    FileJson,
    FileYaml,
    FileIni,
    FileXml,
    FileLua,
    FileCustom,
}

/// A delta applied over a strategy's base during rendering. Unique per
/// `(strategy_id, patch_level, entity_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationPatch {
    pub strategy_id: i64,
    pub patch_level: PatchLevel,
    pub entity_id: i64,
    pub patch_content: String,
    pub patch_format: String,
}

/// Cascade order. Later levels override earlier ones on shared keys.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PatchLevel {
    GameConfig,
    ServerGameConfig,
    Session,
}

/// One strategy's worth of render input for a session, as handed to a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedConfiguration {
    pub strategy_name: String,
    pub strategy_type: StrategyType,
    pub target_path: String,
    #[serde(default)]
    pub base_content: String,
    #[serde(default)]
    pub rendered_content: String,
}

/// Minute-bucketed reference to a chunk of session log output. `file_path`
/// becomes an s3 url once the chunk is archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogReference {
    pub session_id: i64,
    pub sgc_id: i64,
    pub minute_timestamp: DateTime<Utc>,
    pub state: LogReferenceState,
    pub file_path: Option<String>,
    pub appended_at: DateTime<Utc>,
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogReferenceState {
    Open,
    Closed,
    Archived,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_levels_order_by_cascade() {
        assert!(PatchLevel::GameConfig < PatchLevel::ServerGameConfig);
        assert!(PatchLevel::ServerGameConfig < PatchLevel::Session);
    }

    #[test]
    fn strategy_type_strings() {
        assert_eq!(StrategyType::FileProperties.to_string(), "file_properties");
        assert_eq!(
            "file_yaml".parse::<StrategyType>().unwrap(),
            StrategyType::FileYaml
        );
    }
}
