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

//! Reconciling containers the engine knows about with sessions the control
//! plane knows about. Runs once at startup and then on a slow sweep, so a
//! host that crashed mid-flight converges instead of leaking containers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use manman_bus::Publisher;
use manman_common::SessionStatus;
use manman_common::domain::Session;
use manman_common::messages::SessionStatusUpdate;
use manman_common::routing::{MANMAN_EXCHANGE, session_status_key};
use manman_container::{ContainerDriver, ContainerSummary, SERVER_ID_LABEL, SESSION_ID_LABEL};

use crate::control::ControlClient;
use crate::sessions::SessionSupervisor;

/// What to do with one labelled container found on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Unknown to the control plane, or owned by another server: remove it.
    Remove,
    /// Session row is terminal: report `stopped` and remove the container.
    ReportStopped { session_id: i64, sgc_id: i64 },
    /// Live session with a running container: resume supervision.
    Adopt { session_id: i64 },
}

/// The pure decision, split out from the effects so it can be tested cold.
pub fn reconcile(
    server_id: i64,
    container: &ContainerSummary,
    sessions: &HashMap<i64, Session>,
) -> Reconciliation {
    let Some(session_id) = container
        .labels
        .get(SESSION_ID_LABEL)
        .and_then(|v| v.parse::<i64>().ok())
    else {
        return Reconciliation::Remove;
    };
    let Some(session) = sessions.get(&session_id) else {
        return Reconciliation::Remove;
    };
    if session.server_id != server_id {
        return Reconciliation::Remove;
    }
    if session.status.is_terminal() {
        return Reconciliation::ReportStopped {
            session_id,
            sgc_id: session.sgc_id,
        };
    }
    if container.state == "running" {
        Reconciliation::Adopt { session_id }
    } else {
        // Live row, dead container: the exit was never reported.
        Reconciliation::ReportStopped {
            session_id,
            sgc_id: session.sgc_id,
        }
    }
}

pub async fn recover_orphans(
    server_id: i64,
    driver: &ContainerDriver,
    control: &ControlClient,
    publisher: &Arc<Publisher>,
    supervisor: &Arc<SessionSupervisor>,
) -> Result<(), eyre::Report> {
    let containers = driver.list(SERVER_ID_LABEL, &server_id.to_string()).await?;
    if containers.is_empty() {
        return Ok(());
    }

    let sessions: HashMap<i64, Session> = control
        .sessions_for_server(server_id)
        .await?
        .into_iter()
        .map(|s| (s.session_id, s))
        .collect();

    for container in containers {
        match reconcile(server_id, &container, &sessions) {
            Reconciliation::Remove => {
                warn!(container_id = %container.container_id, "removing orphaned container");
                if let Err(e) = driver.remove(&container.container_id, true).await {
                    warn!(container_id = %container.container_id, error = %e, "orphan remove failed");
                }
            }
            Reconciliation::ReportStopped { session_id, sgc_id } => {
                let exit_code = driver
                    .inspect(&container.container_id)
                    .await
                    .ok()
                    .and_then(|s| s.exit_code);
                info!(session_id, ?exit_code, "reconciling exited container");
                let update = SessionStatusUpdate {
                    session_id,
                    sgc_id,
                    status: SessionStatus::Stopped,
                    exit_code,
                    timestamp: Utc::now(),
                };
                if let Err(e) = publisher
                    .publish(
                        MANMAN_EXCHANGE,
                        &session_status_key(session_id, SessionStatus::Stopped),
                        &update,
                    )
                    .await
                {
                    warn!(session_id, error = %e, "reconcile status publish failed");
                }
                if let Err(e) = driver.remove(&container.container_id, true).await {
                    warn!(session_id, error = %e, "reconcile remove failed");
                }
            }
            Reconciliation::Adopt { session_id } => {
                // The map lookup can't fail here; reconcile only adopts
                // sessions it found.
                if let Some(session) = sessions.get(&session_id) {
                    supervisor.adopt(session, &container.container_id).await;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(session_id: i64, server_id: i64, status: SessionStatus) -> Session {
        Session {
            session_id,
            sgc_id: 1,
            server_id,
            status,
            container_id: Some("abc".to_string()),
            exit_code: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn container(session_id: Option<i64>, state: &str) -> ContainerSummary {
        let mut labels = HashMap::new();
        if let Some(id) = session_id {
            labels.insert(SESSION_ID_LABEL.to_string(), id.to_string());
        }
        labels.insert(SERVER_ID_LABEL.to_string(), "10".to_string());
        ContainerSummary {
            container_id: "abc".to_string(),
            state: state.to_string(),
            labels,
        }
    }

    #[test]
    fn unlabelled_container_is_removed() {
        let sessions = HashMap::new();
        assert_eq!(
            reconcile(10, &container(None, "running"), &sessions),
            Reconciliation::Remove
        );
    }

    #[test]
    fn unknown_session_is_removed() {
        let sessions = HashMap::new();
        assert_eq!(
            reconcile(10, &container(Some(5), "running"), &sessions),
            Reconciliation::Remove
        );
    }

    #[test]
    fn foreign_owner_is_removed() {
        let sessions = HashMap::from([(5, session(5, 99, SessionStatus::Running))]);
        assert_eq!(
            reconcile(10, &container(Some(5), "running"), &sessions),
            Reconciliation::Remove
        );
    }

    #[test]
    fn terminal_row_reports_stopped() {
        let sessions = HashMap::from([(5, session(5, 10, SessionStatus::Stopped))]);
        assert_eq!(
            reconcile(10, &container(Some(5), "exited"), &sessions),
            Reconciliation::ReportStopped {
                session_id: 5,
                sgc_id: 1
            }
        );
    }

    #[test]
    fn live_row_running_container_is_adopted() {
        let sessions = HashMap::from([(5, session(5, 10, SessionStatus::Running))]);
        assert_eq!(
            reconcile(10, &container(Some(5), "running"), &sessions),
            Reconciliation::Adopt { session_id: 5 }
        );
    }

    #[test]
    fn live_row_dead_container_reports_exit() {
        let sessions = HashMap::from([(5, session(5, 10, SessionStatus::Running))]);
        assert_eq!(
            reconcile(10, &container(Some(5), "exited"), &sessions),
            Reconciliation::ReportStopped {
                session_id: 5,
                sgc_id: 1
            }
        );
    }
}
