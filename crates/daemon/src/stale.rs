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

//! Hosts that stop heartbeating get marked offline, and their in-flight
//! sessions become `lost`; there is nobody left to report on them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use manman_bus::Publisher;
use manman_common::messages::{HostStatusUpdate, SessionStatusUpdate};
use manman_common::routing::{external_host_key, external_session_key};
use manman_common::status::{ServerStatus, SessionStatus};
use manman_common::domain::{Server, Session};
use manman_common::timeouts::STALE_SWEEP_PERIOD;

use crate::repository::Repository;

pub struct StaleHost {
    pub server: Server,
    pub lost_sessions: Vec<Session>,
}

/// Repository half of one sweep: mark stale servers offline and their
/// non-terminal sessions lost (freeing their ports). Returns what changed
/// so the caller can tell the outside world.
pub fn sweep_repository(repo: &Repository, threshold: Duration) -> Vec<StaleHost> {
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::seconds(180));
    let mut swept = vec![];
    for server in repo.stale_servers(Utc::now(), threshold) {
        repo.set_server_status(server.server_id, ServerStatus::Offline);
        let mut lost_sessions = vec![];
        for session in repo.non_terminal_sessions_for_server(server.server_id) {
            if repo
                .update_session_status(session.session_id, SessionStatus::Lost, None)
                .is_ok()
            {
                repo.release_session_ports(session.session_id);
                repo.close_log_references(session.session_id);
                lost_sessions.push(repo.session(session.session_id).unwrap_or(session));
            }
        }
        swept.push(StaleHost {
            server,
            lost_sessions,
        });
    }
    swept
}

async fn announce(swept: &[StaleHost], publisher: &Publisher, external_exchange: &str) {
    for stale in swept {
        warn!(
            server_id = stale.server.server_id,
            name = %stale.server.name,
            lost = stale.lost_sessions.len(),
            "host went stale"
        );
        let update = HostStatusUpdate {
            server_id: stale.server.server_id,
            status: ServerStatus::Offline,
        };
        if let Err(e) = publisher
            .publish(external_exchange, &external_host_key("stale"), &update)
            .await
        {
            warn!(server_id = stale.server.server_id, error = %e, "stale fan-out failed");
        }

        for session in &stale.lost_sessions {
            let update = SessionStatusUpdate {
                session_id: session.session_id,
                sgc_id: session.sgc_id,
                status: SessionStatus::Lost,
                exit_code: None,
                timestamp: Utc::now(),
            };
            if let Err(e) = publisher
                .publish(
                    external_exchange,
                    &external_session_key(SessionStatus::Lost),
                    &update,
                )
                .await
            {
                warn!(session_id = session.session_id, error = %e, "lost fan-out failed");
            }
        }
    }
}

pub async fn run(
    repo: Arc<Repository>,
    publisher: Arc<Publisher>,
    external_exchange: String,
    threshold: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(STALE_SWEEP_PERIOD);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("stale sweep stopped");
                return;
            }
            _ = ticker.tick() => {
                let swept = sweep_repository(&repo, threshold);
                announce(&swept, &publisher, &external_exchange).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manman_common::HostCapabilities;

    #[test]
    fn fresh_hosts_are_left_alone() {
        let repo = Repository::new();
        repo.register_server("gs-01", "prod", HostCapabilities::default());
        let swept = sweep_repository(&repo, Duration::from_secs(180));
        assert!(swept.is_empty());
    }

    #[test]
    fn stale_host_goes_offline_and_sessions_go_lost() {
        let repo = Repository::new();
        let server = repo.register_server("gs-01", "prod", HostCapabilities::default());
        let live = repo.create_session(1, server.server_id);
        repo.allocate_ports(live.session_id, server.server_id, &[31000])
            .unwrap();
        let done = repo.create_session(1, server.server_id);
        repo.update_session_status(done.session_id, SessionStatus::Starting, None)
            .unwrap();
        repo.update_session_status(done.session_id, SessionStatus::Crashed, Some(1))
            .unwrap();

        // A zero threshold makes any heartbeat stale.
        let swept = sweep_repository(&repo, Duration::from_secs(0));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].server.server_id, server.server_id);
        // Only the non-terminal session is lost; the crashed one stays put.
        assert_eq!(swept[0].lost_sessions.len(), 1);
        assert_eq!(swept[0].lost_sessions[0].session_id, live.session_id);

        assert_eq!(
            repo.server(server.server_id).unwrap().status,
            ServerStatus::Offline
        );
        assert_eq!(
            repo.session(live.session_id).unwrap().status,
            SessionStatus::Lost
        );
        assert_eq!(
            repo.session(done.session_id).unwrap().status,
            SessionStatus::Crashed
        );
        assert!(repo.allocated_ports(server.server_id).is_empty());
    }

    #[test]
    fn offline_host_is_not_reswept() {
        let repo = Repository::new();
        repo.register_server("gs-01", "prod", HostCapabilities::default());
        assert_eq!(sweep_repository(&repo, Duration::from_secs(0)).len(), 1);
        assert!(sweep_repository(&repo, Duration::from_secs(0)).is_empty());
    }
}
