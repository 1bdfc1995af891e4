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

//! The linearization point for session lifecycle: every status event a host
//! publishes comes through here, gets validated against the state machine,
//! and only then reaches the session row and the external bus.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use manman_bus::{Broker, Consumer, Publisher};
use manman_common::messages::{HealthUpdate, HostStatusUpdate, SessionStatusUpdate};
use manman_common::routing::{MANMAN_EXCHANGE, external_host_key, external_session_key};
use manman_common::status::{ServerStatus, SessionStatus};
use manman_common::HandlerError;

use crate::repository::Repository;

/// Queue the processor consumes host events from.
pub const PROCESSOR_QUEUE: &str = "processor-events";

/// The allowed session transitions. Terminal statuses are absorbing;
/// `lost` and `crashed` are reachable from any non-terminal state; a
/// repeated status is fine (hosts redeliver).
pub fn is_valid_transition(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    if from == to {
        return true;
    }
    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (Pending, Starting) | (Starting, Running) | (Running, Stopping) | (Stopping, Stopped) => {
            true
        }
        (_, Lost) | (_, Crashed) => true,
        _ => false,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum StatusOutcome {
    UnknownSession,
    Rejected { from: SessionStatus },
    Repeated,
    Committed { from: SessionStatus },
}

/// Apply one status event to the repository: validation, the row update,
/// and the terminal-status side effects (port release, log-reference close).
pub fn commit_status(repo: &Repository, update: &SessionStatusUpdate) -> StatusOutcome {
    let Some(session) = repo.session(update.session_id) else {
        return StatusOutcome::UnknownSession;
    };
    if !is_valid_transition(session.status, update.status) {
        return StatusOutcome::Rejected {
            from: session.status,
        };
    }
    if session.status == update.status {
        return StatusOutcome::Repeated;
    }

    if repo
        .update_session_status(update.session_id, update.status, update.exit_code)
        .is_err()
    {
        return StatusOutcome::UnknownSession;
    }
    if update.status.is_terminal() {
        repo.release_session_ports(update.session_id);
        repo.close_log_references(update.session_id);
    }
    StatusOutcome::Committed {
        from: session.status,
    }
}

pub struct Processor {
    repo: Arc<Repository>,
    publisher: Arc<Publisher>,
    external_exchange: String,
}

impl Processor {
    pub fn new(repo: Arc<Repository>, publisher: Arc<Publisher>, external_exchange: String) -> Arc<Self> {
        Arc::new(Self {
            repo,
            publisher,
            external_exchange,
        })
    }

    /// Validate and commit one status event. Invalid transitions are
    /// acknowledged with a warning; requeueing them would just thrash the
    /// state machine with the same bad event.
    pub async fn handle_status(&self, update: SessionStatusUpdate) -> Result<(), HandlerError> {
        match commit_status(&self.repo, &update) {
            StatusOutcome::UnknownSession => Err(HandlerError::permanent(format!(
                "status update for unknown session {}",
                update.session_id
            ))),
            StatusOutcome::Rejected { from } => {
                warn!(
                    session_id = update.session_id,
                    from = %from,
                    to = %update.status,
                    "rejecting invalid session transition"
                );
                Ok(())
            }
            StatusOutcome::Repeated => {
                debug!(session_id = update.session_id, status = %update.status, "repeated status, ignoring");
                Ok(())
            }
            StatusOutcome::Committed { from } => {
                info!(
                    session_id = update.session_id,
                    from = %from,
                    to = %update.status,
                    exit_code = ?update.exit_code,
                    "session transition"
                );
                self.fan_out_session(&update).await
            }
        }
    }

    async fn fan_out_session(&self, update: &SessionStatusUpdate) -> Result<(), HandlerError> {
        self.publisher
            .publish(
                &self.external_exchange,
                &external_session_key(update.status),
                update,
            )
            .await
            .map_err(|e| HandlerError::transient(format!("external fan-out failed: {e}")))
    }

    /// Heartbeats refresh `last_seen`; the stats are advisory only.
    pub async fn handle_health(&self, update: HealthUpdate) -> Result<(), HandlerError> {
        if !self.repo.touch_server(update.server_id) {
            return Err(HandlerError::permanent(format!(
                "health from unknown server {}",
                update.server_id
            )));
        }
        debug!(
            server_id = update.server_id,
            total = update.session_stats.total,
            running = update.session_stats.running,
            crashed = update.session_stats.crashed,
            "host heartbeat"
        );
        Ok(())
    }

    /// Hosts announce online on boot and offline on clean shutdown.
    pub async fn handle_host_status(&self, update: HostStatusUpdate) -> Result<(), HandlerError> {
        if !self.repo.set_server_status(update.server_id, update.status) {
            return Err(HandlerError::permanent(format!(
                "host status from unknown server {}",
                update.server_id
            )));
        }
        info!(server_id = update.server_id, status = %update.status, "host status");
        let event = match update.status {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
        };
        self.publisher
            .publish(&self.external_exchange, &external_host_key(event), &update)
            .await
            .map_err(|e| HandlerError::transient(format!("external fan-out failed: {e}")))
    }

    /// One durable queue over both event families. Registration order
    /// matters: the host-status pattern is more specific than the health
    /// pattern and must come first.
    pub async fn consumer(self: &Arc<Self>, broker: &Broker) -> Result<Consumer, manman_bus::BusError> {
        let mut consumer = Consumer::new(broker, PROCESSOR_QUEUE, true, false).await?;
        consumer.bind(MANMAN_EXCHANGE, "status.session.#").await?;
        consumer.bind(MANMAN_EXCHANGE, "health.#").await?;

        let processor = self.clone();
        consumer.on("status.session.#", move |m| {
            let processor = processor.clone();
            async move {
                let update: SessionStatusUpdate = serde_json::from_slice(&m.payload)?;
                processor.handle_status(update).await?;
                Ok(None)
            }
        });

        let processor = self.clone();
        consumer.on("health.host.*.status", move |m| {
            let processor = processor.clone();
            async move {
                let update: HostStatusUpdate = serde_json::from_slice(&m.payload)?;
                processor.handle_host_status(update).await?;
                Ok(None)
            }
        });

        let processor = self.clone();
        consumer.on("health.#", move |m| {
            let processor = processor.clone();
            async move {
                let update: HealthUpdate = serde_json::from_slice(&m.payload)?;
                processor.handle_health(update).await?;
                Ok(None)
            }
        });

        Ok(consumer)
    }

    pub async fn run(self: Arc<Self>, broker: Arc<Broker>, cancel: CancellationToken) -> Result<(), manman_bus::BusError> {
        let consumer = self.consumer(&broker).await?;
        consumer.run(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::*;

    #[test]
    fn happy_path_transitions() {
        assert!(is_valid_transition(Pending, Starting));
        assert!(is_valid_transition(Starting, Running));
        assert!(is_valid_transition(Running, Stopping));
        assert!(is_valid_transition(Stopping, Stopped));
    }

    #[test]
    fn crash_and_lost_from_any_non_terminal() {
        for from in [Pending, Starting, Running, Stopping] {
            assert!(is_valid_transition(from, Crashed), "{from} -> crashed");
            assert!(is_valid_transition(from, Lost), "{from} -> lost");
        }
    }

    #[test]
    fn terminal_is_absorbing() {
        for from in [Stopped, Crashed, Lost] {
            for to in [Pending, Starting, Running, Stopping, Stopped, Crashed, Lost] {
                if from == to {
                    continue;
                }
                assert!(!is_valid_transition(from, to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn idempotent_same_to_same() {
        for status in [Pending, Starting, Running, Stopping, Stopped, Crashed, Lost] {
            assert!(is_valid_transition(status, status));
        }
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(!is_valid_transition(Pending, Running));
        assert!(!is_valid_transition(Starting, Stopped));
        assert!(!is_valid_transition(Running, Stopped));
        assert!(!is_valid_transition(Stopped, Starting));
    }

    fn update(session_id: i64, status: SessionStatus) -> SessionStatusUpdate {
        SessionStatusUpdate {
            session_id,
            sgc_id: 1,
            status,
            exit_code: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn rejected_event_leaves_row_untouched() {
        let repo = Repository::new();
        let session = repo.create_session(1, 10);

        // starting is accepted...
        assert_eq!(
            commit_status(&repo, &update(session.session_id, Starting)),
            StatusOutcome::Committed { from: Pending }
        );
        // ...then a straight jump to stopped is rejected and the row stays.
        assert_eq!(
            commit_status(&repo, &update(session.session_id, Stopped)),
            StatusOutcome::Rejected { from: Starting }
        );
        assert_eq!(repo.session(session.session_id).unwrap().status, Starting);
    }

    #[test]
    fn unknown_session_is_permanent() {
        let repo = Repository::new();
        assert_eq!(
            commit_status(&repo, &update(404, Starting)),
            StatusOutcome::UnknownSession
        );
    }

    #[test]
    fn terminal_commit_releases_ports_and_closes_log_refs() {
        let repo = Repository::new();
        let session = repo.create_session(1, 10);
        repo.allocate_ports(session.session_id, 10, &[31000]).unwrap();
        repo.touch_log_reference(session.session_id, 1, chrono::Utc::now());

        for status in [Starting, Running] {
            commit_status(&repo, &update(session.session_id, status));
        }
        let outcome = commit_status(&repo, &update(session.session_id, Crashed));
        assert_eq!(outcome, StatusOutcome::Committed { from: Running });
        assert!(repo.allocated_ports(10).is_empty());
        assert_eq!(
            repo.log_references_for_session(session.session_id)[0].state,
            manman_common::domain::LogReferenceState::Closed
        );
    }

    #[test]
    fn repeated_status_is_quietly_ignored() {
        let repo = Repository::new();
        let session = repo.create_session(1, 10);
        commit_status(&repo, &update(session.session_id, Starting));
        assert_eq!(
            commit_status(&repo, &update(session.session_id, Starting)),
            StatusOutcome::Repeated
        );
    }
}
