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

//! The control plane's view of the fleet, behind one lock. The durable
//! relational store is an external collaborator; this in-memory backend is
//! the seam it plugs into.
//!
//! Configuration patches live in a single table keyed
//! `(strategy, level, entity)` with typed accessors per cascade level; no
//! view magic.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use std::sync::RwLock;
use thiserror::Error;

use manman_common::domain::{
    ConfigurationPatch, ConfigurationStrategy, Game, GameConfig, LogReference, LogReferenceState,
    PatchLevel, Server, ServerGameConfig, Session,
};
use manman_common::status::{ServerStatus, SessionStatus};
use manman_common::HostCapabilities;

#[derive(Debug, Error, PartialEq)]
pub enum RepositoryError {
    #[error("no such {kind}: {id}")]
    NotFound { kind: &'static str, id: i64 },
    #[error("port {port} already allocated on server {server_id}")]
    PortConflict { server_id: i64, port: u16 },
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    servers: HashMap<i64, Server>,
    games: HashMap<i64, Game>,
    game_configs: HashMap<i64, GameConfig>,
    sgcs: HashMap<i64, ServerGameConfig>,
    strategies: HashMap<i64, ConfigurationStrategy>,
    patches: HashMap<(i64, PatchLevel, i64), ConfigurationPatch>,
    sessions: HashMap<i64, Session>,
    /// server_id -> host_port -> owning session.
    ports: HashMap<i64, HashMap<u16, i64>>,
    log_references: HashMap<(i64, DateTime<Utc>), LogReference>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct Repository {
    inner: RwLock<Inner>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- servers ----

    /// Idempotent on `(name, environment)`: a re-registering host reclaims
    /// its row and refreshes its capabilities. The first server ever
    /// registered becomes the fleet default.
    pub fn register_server(
        &self,
        name: &str,
        environment: &str,
        capabilities: HostCapabilities,
    ) -> Server {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();

        let existing = inner
            .servers
            .values()
            .find(|s| s.name == name && s.environment == environment)
            .map(|s| s.server_id);
        if let Some(server_id) = existing {
            let server = inner.servers.get_mut(&server_id).unwrap();
            server.capabilities = capabilities;
            server.last_seen = now;
            server.status = ServerStatus::Online;
            return server.clone();
        }

        let server_id = inner.next_id();
        let is_default = inner.servers.is_empty();
        let server = Server {
            server_id,
            name: name.to_string(),
            environment: environment.to_string(),
            capabilities,
            last_seen: now,
            is_default,
            status: ServerStatus::Online,
        };
        inner.servers.insert(server_id, server.clone());
        server
    }

    pub fn server(&self, server_id: i64) -> Option<Server> {
        self.inner.read().unwrap().servers.get(&server_id).cloned()
    }

    /// Refresh `last_seen`; false when the server is unknown.
    pub fn touch_server(&self, server_id: i64) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.servers.get_mut(&server_id) {
            Some(server) => {
                server.last_seen = Utc::now();
                server.status = ServerStatus::Online;
                true
            }
            None => false,
        }
    }

    pub fn set_server_status(&self, server_id: i64, status: ServerStatus) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.servers.get_mut(&server_id) {
            Some(server) => {
                server.status = status;
                true
            }
            None => false,
        }
    }

    /// Online servers whose heartbeat is older than the threshold.
    pub fn stale_servers(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<Server> {
        let inner = self.inner.read().unwrap();
        inner
            .servers
            .values()
            .filter(|s| s.status == ServerStatus::Online && s.last_seen < now - threshold)
            .cloned()
            .collect()
    }

    // ---- configuration hierarchy ----

    pub fn insert_game(&self, name: &str) -> Game {
        let mut inner = self.inner.write().unwrap();
        let game_id = inner.next_id();
        let game = Game {
            game_id,
            name: name.to_string(),
        };
        inner.games.insert(game_id, game.clone());
        game
    }

    pub fn insert_game_config(&self, mut config: GameConfig) -> GameConfig {
        let mut inner = self.inner.write().unwrap();
        config.game_config_id = inner.next_id();
        inner
            .game_configs
            .insert(config.game_config_id, config.clone());
        config
    }

    pub fn game_config(&self, game_config_id: i64) -> Option<GameConfig> {
        self.inner
            .read()
            .unwrap()
            .game_configs
            .get(&game_config_id)
            .cloned()
    }

    pub fn insert_sgc(&self, mut sgc: ServerGameConfig) -> ServerGameConfig {
        let mut inner = self.inner.write().unwrap();
        sgc.sgc_id = inner.next_id();
        inner.sgcs.insert(sgc.sgc_id, sgc.clone());
        sgc
    }

    pub fn sgc(&self, sgc_id: i64) -> Option<ServerGameConfig> {
        self.inner.read().unwrap().sgcs.get(&sgc_id).cloned()
    }

    pub fn insert_strategy(&self, mut strategy: ConfigurationStrategy) -> ConfigurationStrategy {
        let mut inner = self.inner.write().unwrap();
        strategy.strategy_id = inner.next_id();
        inner
            .strategies
            .insert(strategy.strategy_id, strategy.clone());
        strategy
    }

    pub fn strategies_for_game_config(&self, game_config_id: i64) -> Vec<ConfigurationStrategy> {
        let inner = self.inner.read().unwrap();
        let mut strategies: Vec<_> = inner
            .strategies
            .values()
            .filter(|s| s.game_config_id == game_config_id)
            .cloned()
            .collect();
        strategies.sort_by_key(|s| s.strategy_id);
        strategies
    }

    /// Insert-or-replace; uniqueness on `(strategy, level, entity)` is the
    /// map key.
    pub fn upsert_patch(&self, patch: ConfigurationPatch) {
        let mut inner = self.inner.write().unwrap();
        inner.patches.insert(
            (patch.strategy_id, patch.patch_level, patch.entity_id),
            patch,
        );
    }

    fn patch_at(
        &self,
        strategy_id: i64,
        level: PatchLevel,
        entity_id: i64,
    ) -> Option<ConfigurationPatch> {
        self.inner
            .read()
            .unwrap()
            .patches
            .get(&(strategy_id, level, entity_id))
            .cloned()
    }

    pub fn game_config_patch(&self, strategy_id: i64, game_config_id: i64) -> Option<ConfigurationPatch> {
        self.patch_at(strategy_id, PatchLevel::GameConfig, game_config_id)
    }

    pub fn sgc_patch(&self, strategy_id: i64, sgc_id: i64) -> Option<ConfigurationPatch> {
        self.patch_at(strategy_id, PatchLevel::ServerGameConfig, sgc_id)
    }

    pub fn session_patch(&self, strategy_id: i64, session_id: i64) -> Option<ConfigurationPatch> {
        self.patch_at(strategy_id, PatchLevel::Session, session_id)
    }

    // ---- sessions ----

    pub fn create_session(&self, sgc_id: i64, server_id: i64) -> Session {
        let mut inner = self.inner.write().unwrap();
        let session_id = inner.next_id();
        let now = Utc::now();
        let session = Session {
            session_id,
            sgc_id,
            server_id,
            status: SessionStatus::Pending,
            container_id: None,
            exit_code: None,
            created_at: now,
            updated_at: now,
        };
        inner.sessions.insert(session_id, session.clone());
        session
    }

    pub fn session(&self, session_id: i64) -> Option<Session> {
        self.inner.read().unwrap().sessions.get(&session_id).cloned()
    }

    pub fn sessions_for_server(&self, server_id: i64) -> Vec<Session> {
        let inner = self.inner.read().unwrap();
        inner
            .sessions
            .values()
            .filter(|s| s.server_id == server_id)
            .cloned()
            .collect()
    }

    pub fn non_terminal_sessions_for_server(&self, server_id: i64) -> Vec<Session> {
        self.sessions_for_server(server_id)
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect()
    }

    pub fn update_session_status(
        &self,
        session_id: i64,
        status: SessionStatus,
        exit_code: Option<i64>,
    ) -> Result<Session, RepositoryError> {
        let mut inner = self.inner.write().unwrap();
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or(RepositoryError::NotFound {
                kind: "session",
                id: session_id,
            })?;
        session.status = status;
        if exit_code.is_some() {
            session.exit_code = exit_code;
        }
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    // ---- port allocations ----

    /// Exclusive per host; the whole request fails if any port is taken by
    /// another session (re-allocating to the same session is a no-op).
    pub fn allocate_ports(
        &self,
        session_id: i64,
        server_id: i64,
        ports: &[u16],
    ) -> Result<Vec<u16>, RepositoryError> {
        let mut inner = self.inner.write().unwrap();
        let allocations = inner.ports.entry(server_id).or_default();
        for port in ports {
            if let Some(owner) = allocations.get(port) {
                if *owner != session_id {
                    return Err(RepositoryError::PortConflict {
                        server_id,
                        port: *port,
                    });
                }
            }
        }
        for port in ports {
            allocations.insert(*port, session_id);
        }
        Ok(ports.to_vec())
    }

    /// Freed when the session reaches a terminal status.
    pub fn release_session_ports(&self, session_id: i64) -> Vec<u16> {
        let mut inner = self.inner.write().unwrap();
        let mut released = vec![];
        for allocations in inner.ports.values_mut() {
            allocations.retain(|port, owner| {
                if *owner == session_id {
                    released.push(*port);
                    false
                } else {
                    true
                }
            });
        }
        released.sort();
        released
    }

    pub fn allocated_ports(&self, server_id: i64) -> Vec<u16> {
        let inner = self.inner.read().unwrap();
        let mut ports: Vec<u16> = inner
            .ports
            .get(&server_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        ports.sort();
        ports
    }

    // ---- log references ----

    /// Record that log output landed in the given minute bucket, opening the
    /// reference if this is the first line of the minute.
    pub fn touch_log_reference(
        &self,
        session_id: i64,
        sgc_id: i64,
        minute_timestamp: DateTime<Utc>,
    ) -> LogReference {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        let reference = inner
            .log_references
            .entry((session_id, minute_timestamp))
            .or_insert_with(|| LogReference {
                session_id,
                sgc_id,
                minute_timestamp,
                state: LogReferenceState::Open,
                file_path: None,
                appended_at: now,
            });
        reference.appended_at = now;
        reference.clone()
    }

    /// Terminal sessions stop appending; their open references close.
    pub fn close_log_references(&self, session_id: i64) -> usize {
        let mut inner = self.inner.write().unwrap();
        let mut closed = 0;
        for reference in inner.log_references.values_mut() {
            if reference.session_id == session_id
                && reference.state == LogReferenceState::Open
            {
                reference.state = LogReferenceState::Closed;
                closed += 1;
            }
        }
        closed
    }

    /// Archival is performed by an external worker; it reports back here
    /// with the final location.
    pub fn mark_log_reference_archived(
        &self,
        session_id: i64,
        minute_timestamp: DateTime<Utc>,
        file_path: &str,
    ) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.log_references.get_mut(&(session_id, minute_timestamp)) {
            Some(reference) => {
                reference.state = LogReferenceState::Archived;
                reference.file_path = Some(file_path.to_string());
                true
            }
            None => false,
        }
    }

    pub fn log_references_for_session(&self, session_id: i64) -> Vec<LogReference> {
        let inner = self.inner.read().unwrap();
        let mut references: Vec<_> = inner
            .log_references
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        references.sort_by_key(|r| r.minute_timestamp);
        references
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manman_common::domain::PortBinding;

    fn caps() -> HostCapabilities {
        HostCapabilities {
            mem_mb: 1024,
            cpu_m: 2000,
            docker_version: "27.0".to_string(),
        }
    }

    #[test]
    fn registration_is_idempotent_on_name_and_environment() {
        let repo = Repository::new();
        let first = repo.register_server("gs-01", "prod", caps());
        let mut newer = caps();
        newer.mem_mb = 2048;
        let second = repo.register_server("gs-01", "prod", newer);
        assert_eq!(first.server_id, second.server_id);
        assert_eq!(second.capabilities.mem_mb, 2048);

        let other = repo.register_server("gs-01", "staging", caps());
        assert_ne!(other.server_id, first.server_id);
    }

    #[test]
    fn exactly_one_default_server() {
        let repo = Repository::new();
        let first = repo.register_server("gs-01", "prod", caps());
        let second = repo.register_server("gs-02", "prod", caps());
        assert!(first.is_default);
        assert!(!second.is_default);
        // Re-registration doesn't mint a second default.
        let again = repo.register_server("gs-02", "prod", caps());
        assert!(!again.is_default);
    }

    #[test]
    fn port_allocations_are_disjoint_per_host() {
        let repo = Repository::new();
        repo.allocate_ports(1, 10, &[31000, 31001]).unwrap();
        let err = repo.allocate_ports(2, 10, &[31001]).unwrap_err();
        assert_eq!(
            err,
            RepositoryError::PortConflict {
                server_id: 10,
                port: 31001
            }
        );
        // Same port on another host is fine.
        repo.allocate_ports(2, 11, &[31001]).unwrap();
        // Re-allocating to the owner is a no-op.
        repo.allocate_ports(1, 10, &[31000]).unwrap();
    }

    #[test]
    fn ports_release_on_session_end() {
        let repo = Repository::new();
        repo.allocate_ports(1, 10, &[31000, 31002]).unwrap();
        assert_eq!(repo.release_session_ports(1), vec![31000, 31002]);
        assert!(repo.allocated_ports(10).is_empty());
        repo.allocate_ports(2, 10, &[31000]).unwrap();
    }

    #[test]
    fn stale_server_selection() {
        let repo = Repository::new();
        let server = repo.register_server("gs-01", "prod", caps());
        let now = Utc::now();
        // Fresh heartbeat: not stale.
        assert!(repo.stale_servers(now, Duration::seconds(180)).is_empty());
        // 200 seconds later it's past the 180s threshold.
        let later = now + Duration::seconds(200);
        let stale = repo.stale_servers(later, Duration::seconds(180));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].server_id, server.server_id);
        // Once offline it stops showing up.
        repo.set_server_status(server.server_id, ServerStatus::Offline);
        assert!(repo.stale_servers(later, Duration::seconds(180)).is_empty());
    }

    #[test]
    fn patch_uniqueness_is_per_strategy_level_entity() {
        let repo = Repository::new();
        let patch = ConfigurationPatch {
            strategy_id: 1,
            patch_level: PatchLevel::GameConfig,
            entity_id: 5,
            patch_content: "motd=A".to_string(),
            patch_format: "properties".to_string(),
        };
        repo.upsert_patch(patch.clone());
        repo.upsert_patch(ConfigurationPatch {
            patch_content: "motd=B".to_string(),
            ..patch
        });
        assert_eq!(
            repo.game_config_patch(1, 5).unwrap().patch_content,
            "motd=B"
        );
        assert!(repo.sgc_patch(1, 5).is_none());
    }

    #[test]
    fn session_lifecycle_row_updates() {
        let repo = Repository::new();
        let gc = repo.insert_game_config(GameConfig {
            game_config_id: 0,
            game_id: 1,
            name: "mc".to_string(),
            image: "mc:latest".to_string(),
            env_template: Default::default(),
            args_template: vec![],
            volumes: vec![],
        });
        let sgc = repo.insert_sgc(ServerGameConfig {
            sgc_id: 0,
            game_config_id: gc.game_config_id,
            server_id: 10,
            name: "mc-on-gs01".to_string(),
            port_bindings: vec![PortBinding {
                container_port: 25565,
                host_port: 31000,
            }],
        });
        let session = repo.create_session(sgc.sgc_id, 10);
        assert_eq!(session.status, SessionStatus::Pending);

        let updated = repo
            .update_session_status(session.session_id, SessionStatus::Crashed, Some(137))
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Crashed);
        assert_eq!(updated.exit_code, Some(137));

        assert_eq!(
            repo.update_session_status(9999, SessionStatus::Running, None)
                .unwrap_err(),
            RepositoryError::NotFound {
                kind: "session",
                id: 9999
            }
        );
    }

    #[test]
    fn log_references_open_close_archive() {
        let repo = Repository::new();
        let minute = Utc::now();
        let reference = repo.touch_log_reference(7, 3, minute);
        assert_eq!(reference.state, LogReferenceState::Open);

        assert_eq!(repo.close_log_references(7), 1);
        assert_eq!(repo.close_log_references(7), 0);

        assert!(repo.mark_log_reference_archived(7, minute, "s3://logs/7/0.log"));
        let references = repo.log_references_for_session(7);
        assert_eq!(references[0].state, LogReferenceState::Archived);
        assert_eq!(
            references[0].file_path.as_deref(),
            Some("s3://logs/7/0.log")
        );
    }
}
