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

//! Per-session supervision. Each live session owns a small task tree:
//! a stdout reader, a stderr reader and an exit waiter. Whoever removes the
//! session's handle from the registry publishes its terminal status, so the
//! stop path and the exit waiter can race safely.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use manman_bus::Publisher;
use manman_common::HandlerError;
use manman_common::SessionStatus;
use manman_common::domain::Session;
use manman_common::messages::{
    LogMessage, LogSource, SendInputCommand, SessionStats, SessionStatusUpdate,
    StartSessionCommand, StopSessionCommand,
};
use manman_common::routing::{MANMAN_EXCHANGE, session_status_key};
use manman_common::timeouts::CONTAINER_STOP_GRACE;
use manman_container::{
    ContainerDriver, ContainerError, CreateSpec, SERVER_ID_LABEL, SESSION_ID_LABEL,
};
use manman_render::{session_data_dir, write_rendered_files};

use crate::log_publisher::LogPublisher;

struct SessionHandle {
    session_id: i64,
    sgc_id: i64,
    container_id: String,
    status: Mutex<SessionStatus>,
    stop_requested: AtomicBool,
    stdin: tokio::sync::Mutex<Option<Pin<Box<dyn AsyncWrite + Send>>>>,
}

pub struct SessionSupervisor {
    server_id: i64,
    environment: String,
    host_data_dir: PathBuf,
    driver: ContainerDriver,
    publisher: Arc<Publisher>,
    logs: LogPublisher,
    sessions: RwLock<HashMap<i64, Arc<SessionHandle>>>,
    stopped_total: AtomicU32,
    crashed_total: AtomicU32,
}

fn container_err(e: ContainerError) -> HandlerError {
    match e {
        ContainerError::NotFound(m) => HandlerError::permanent(format!("no such container: {m}")),
        other => HandlerError::transient(other.to_string()),
    }
}

impl SessionSupervisor {
    pub fn new(
        server_id: i64,
        environment: String,
        host_data_dir: PathBuf,
        driver: ContainerDriver,
        publisher: Arc<Publisher>,
        logs: LogPublisher,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_id,
            environment,
            host_data_dir,
            driver,
            publisher,
            logs,
            sessions: RwLock::new(HashMap::new()),
            stopped_total: AtomicU32::new(0),
            crashed_total: AtomicU32::new(0),
        })
    }

    fn handle(&self, session_id: i64) -> Option<Arc<SessionHandle>> {
        self.sessions.read().unwrap().get(&session_id).cloned()
    }

    fn remove_handle(&self, session_id: i64) -> Option<Arc<SessionHandle>> {
        self.sessions.write().unwrap().remove(&session_id)
    }

    /// Counts over live handles plus cumulative terminal tallies, reported
    /// with every heartbeat.
    pub fn session_stats(&self) -> SessionStats {
        let live: Vec<SessionStatus> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .values()
                .map(|handle| *handle.status.lock().unwrap())
                .collect()
        };
        fold_stats(
            &live,
            self.stopped_total.load(Ordering::Relaxed),
            self.crashed_total.load(Ordering::Relaxed),
        )
    }

    async fn publish_status(
        &self,
        session_id: i64,
        sgc_id: i64,
        status: SessionStatus,
        exit_code: Option<i64>,
    ) {
        let update = SessionStatusUpdate {
            session_id,
            sgc_id,
            status,
            exit_code,
            timestamp: Utc::now(),
        };
        if let Err(e) = self
            .publisher
            .publish(
                MANMAN_EXCHANGE,
                &session_status_key(session_id, status),
                &update,
            )
            .await
        {
            error!(session_id, %status, error = %e, "status publish failed");
        }
    }

    /// Bring a session up: render its configuration, create and start the
    /// container, then hand it to the reader/waiter tasks. Every failure on
    /// this path is terminal for the session: the broker must not retry a
    /// half-started container, so the handler error is permanent and the
    /// `crashed` status has already gone out.
    pub async fn start_session(
        self: &Arc<Self>,
        cmd: StartSessionCommand,
    ) -> Result<(), HandlerError> {
        let session_id = cmd.session_id;
        let sgc_id = cmd.sgc_id;

        if let Some(stale) = self.handle(session_id) {
            if !cmd.force {
                return Err(HandlerError::permanent(format!(
                    "session {session_id} is already supervised on this host"
                )));
            }
            // Discard quietly: the session row is about to go `starting`
            // again, so no terminal status must be published for the old
            // container.
            warn!(session_id, "force start over a live session, discarding the old container");
            self.remove_handle(session_id);
            let _ = self.driver.kill(&stale.container_id).await;
            let _ = self.driver.remove(&stale.container_id, true).await;
        }

        self.publish_status(session_id, sgc_id, SessionStatus::Starting, None)
            .await;

        match self.bring_up(&cmd).await {
            Ok(container_id) => {
                info!(session_id, container_id = %container_id, "session running");
                self.publish_status(session_id, sgc_id, SessionStatus::Running, None)
                    .await;
                self.supervise(session_id, sgc_id, container_id, SessionStatus::Running);
                Ok(())
            }
            Err(e) => {
                error!(session_id, error = %e, "session start failed");
                self.crashed_total.fetch_add(1, Ordering::Relaxed);
                self.publish_status(session_id, sgc_id, SessionStatus::Crashed, None)
                    .await;
                Err(HandlerError::permanent(format!(
                    "session {session_id} failed to start: {e}"
                )))
            }
        }
    }

    /// Ports ride in on the command (the control plane's allocation is
    /// authoritative); render, create, attach stdin *before* start, start.
    async fn bring_up(&self, cmd: &StartSessionCommand) -> Result<String, eyre::Report> {
        let data_dir = session_data_dir(
            &self.host_data_dir,
            &self.environment,
            cmd.sgc_id,
            cmd.session_id,
        );
        write_rendered_files(&cmd.rendered_configurations, &data_dir)?;

        let env: Vec<String> = cmd
            .game_config
            .env_template
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let labels = HashMap::from([
            (SESSION_ID_LABEL.to_string(), cmd.session_id.to_string()),
            (SERVER_ID_LABEL.to_string(), self.server_id.to_string()),
        ]);
        let spec = CreateSpec {
            name: format!("manman-session-{}", cmd.session_id),
            image: cmd.game_config.image.clone(),
            cmd: cmd.game_config.args_template.clone(),
            entrypoint: vec![],
            env,
            port_bindings: cmd.server_game_config.port_bindings.clone(),
            volumes: cmd.game_config.volumes.clone(),
            labels,
            data_dir: data_dir.display().to_string(),
        };

        let container_id = self.driver.create(&spec).await?;
        let stdin = match self.driver.attach_stdin(&container_id).await {
            Ok(writer) => writer,
            Err(e) => {
                // Don't leave the created container behind.
                let _ = self.driver.remove(&container_id, true).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.driver.start(&container_id).await {
            let _ = self.driver.remove(&container_id, true).await;
            return Err(e.into());
        }

        self.install_handle(cmd.session_id, cmd.sgc_id, &container_id, Some(stdin));
        Ok(container_id)
    }

    fn install_handle(
        &self,
        session_id: i64,
        sgc_id: i64,
        container_id: &str,
        stdin: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    ) {
        let handle = Arc::new(SessionHandle {
            session_id,
            sgc_id,
            container_id: container_id.to_string(),
            status: Mutex::new(SessionStatus::Starting),
            stop_requested: AtomicBool::new(false),
            stdin: tokio::sync::Mutex::new(stdin),
        });
        self.sessions.write().unwrap().insert(session_id, handle);
    }

    /// Spawn the task tree for a handle that's been installed: both log
    /// readers and the exit waiter.
    fn supervise(
        self: &Arc<Self>,
        session_id: i64,
        sgc_id: i64,
        container_id: String,
        status: SessionStatus,
    ) {
        if let Some(handle) = self.handle(session_id) {
            *handle.status.lock().unwrap() = status;
        }

        let streams = self.driver.stream_logs(&container_id, 0);
        spawn_line_reader(self.logs.clone(), session_id, LogSource::Stdout, streams.stdout);
        spawn_line_reader(self.logs.clone(), session_id, LogSource::Stderr, streams.stderr);

        let supervisor = self.clone();
        tokio::spawn(async move {
            let exit_code = match supervisor.driver.wait(&container_id).await {
                Ok(code) => Some(code),
                Err(e) => {
                    warn!(session_id, error = %e, "exit wait failed");
                    None
                }
            };
            // If the handle is already gone the stop path owned the
            // terminal status; nothing left to report.
            let Some(handle) = supervisor.remove_handle(session_id) else {
                return;
            };
            let terminal = if handle.stop_requested.load(Ordering::Relaxed) {
                supervisor.stopped_total.fetch_add(1, Ordering::Relaxed);
                SessionStatus::Stopped
            } else {
                supervisor.crashed_total.fetch_add(1, Ordering::Relaxed);
                SessionStatus::Crashed
            };
            info!(session_id, ?exit_code, %terminal, "container exited");
            supervisor
                .publish_status(session_id, sgc_id, terminal, exit_code)
                .await;
        });
    }

    /// Re-attach to a still-running container found at startup. The session
    /// keeps its control-plane status; we only resume supervision.
    pub async fn adopt(self: &Arc<Self>, session: &Session, container_id: &str) {
        info!(
            session_id = session.session_id,
            container_id, "adopting running container"
        );
        let stdin = match self.driver.attach_stdin(container_id).await {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!(session_id = session.session_id, error = %e, "stdin re-attach failed");
                None
            }
        };
        self.install_handle(session.session_id, session.sgc_id, container_id, stdin);
        self.supervise(
            session.session_id,
            session.sgc_id,
            container_id.to_string(),
            session.status,
        );
    }

    pub async fn stop_session(&self, cmd: StopSessionCommand) -> Result<(), HandlerError> {
        let Some(handle) = self.handle(cmd.session_id) else {
            return Err(HandlerError::permanent(format!(
                "session not found: {}",
                cmd.session_id
            )));
        };

        handle.stop_requested.store(true, Ordering::Relaxed);
        *handle.status.lock().unwrap() = SessionStatus::Stopping;
        self.publish_status(
            handle.session_id,
            handle.sgc_id,
            SessionStatus::Stopping,
            None,
        )
        .await;

        match self
            .driver
            .stop(&handle.container_id, CONTAINER_STOP_GRACE)
            .await
        {
            Ok(()) | Err(ContainerError::NotFound(_)) => {}
            Err(e) => return Err(container_err(e)),
        }
        if cmd.force {
            match self.driver.kill(&handle.container_id).await {
                Ok(()) | Err(ContainerError::NotFound(_)) => {}
                Err(e) => return Err(container_err(e)),
            }
        }

        self.finish_stop(&handle).await;
        Ok(())
    }

    /// Immediate SIGKILL and forced removal; the polite path is `stop`.
    pub async fn kill_session(&self, cmd: StopSessionCommand) -> Result<(), HandlerError> {
        let Some(handle) = self.handle(cmd.session_id) else {
            return Err(HandlerError::permanent(format!(
                "session not found: {}",
                cmd.session_id
            )));
        };

        handle.stop_requested.store(true, Ordering::Relaxed);
        *handle.status.lock().unwrap() = SessionStatus::Stopping;
        self.publish_status(
            handle.session_id,
            handle.sgc_id,
            SessionStatus::Stopping,
            None,
        )
        .await;

        match self.driver.kill(&handle.container_id).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => {}
            Err(e) => return Err(container_err(e)),
        }
        if let Err(e) = self.driver.remove(&handle.container_id, true).await {
            warn!(session_id = handle.session_id, error = %e, "forced remove failed");
        }

        self.finish_stop(&handle).await;
        Ok(())
    }

    /// Publish the terminal `stopped` if the exit waiter hasn't beaten us to
    /// the handle.
    async fn finish_stop(&self, handle: &Arc<SessionHandle>) {
        if self.remove_handle(handle.session_id).is_none() {
            return;
        }
        let exit_code = match self.driver.inspect(&handle.container_id).await {
            Ok(status) => status.exit_code,
            Err(_) => None,
        };
        self.stopped_total.fetch_add(1, Ordering::Relaxed);
        self.publish_status(
            handle.session_id,
            handle.sgc_id,
            SessionStatus::Stopped,
            exit_code,
        )
        .await;
    }

    /// A broken pipe means the container is gone or never had stdin;
    /// retrying the message cannot fix either.
    pub async fn send_input(&self, cmd: SendInputCommand) -> Result<(), HandlerError> {
        let Some(handle) = self.handle(cmd.session_id) else {
            return Err(HandlerError::permanent(format!(
                "session not found: {}",
                cmd.session_id
            )));
        };

        let mut stdin = handle.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return Err(HandlerError::permanent(format!(
                "session {} has no attached stdin",
                cmd.session_id
            )));
        };

        let line = format!("{}\n", cmd.input);
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            *stdin = None;
            return Err(HandlerError::permanent(format!("stdin pipe broken: {e}")));
        }
        if let Err(e) = writer.flush().await {
            *stdin = None;
            return Err(HandlerError::permanent(format!("stdin pipe broken: {e}")));
        }
        Ok(())
    }
}

/// Line-buffer a demuxed byte stream into the log queue.
fn spawn_line_reader(
    logs: LogPublisher,
    session_id: i64,
    source: LogSource,
    mut chunks: mpsc::Receiver<Vec<u8>>,
) {
    tokio::spawn(async move {
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            buf.extend_from_slice(&chunk);
            for line in split_complete_lines(&mut buf) {
                logs.enqueue(LogMessage {
                    session_id,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    source,
                    message: line,
                });
            }
        }
        // Stream closed; ship whatever partial line is left.
        if !buf.is_empty() {
            logs.enqueue(LogMessage {
                session_id,
                timestamp_ms: Utc::now().timestamp_millis(),
                source,
                message: String::from_utf8_lossy(&buf).trim_end().to_string(),
            });
        }
    });
}

fn fold_stats(live: &[SessionStatus], stopped: u32, crashed: u32) -> SessionStats {
    let mut stats = SessionStats {
        stopped,
        crashed,
        ..Default::default()
    };
    for status in live {
        stats.total += 1;
        match status {
            SessionStatus::Pending => stats.pending += 1,
            SessionStatus::Starting => stats.starting += 1,
            SessionStatus::Running => stats.running += 1,
            SessionStatus::Stopping => stats.stopping += 1,
            _ => {}
        }
    }
    stats
}

/// Pull complete `\n`-terminated lines off the front of `buf`, leaving any
/// partial tail in place. Trailing `\r` is stripped.
fn split_complete_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = vec![];
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_stats_cover_live_and_terminal() {
        let live = [
            SessionStatus::Running,
            SessionStatus::Running,
            SessionStatus::Starting,
            SessionStatus::Stopping,
        ];
        let stats = fold_stats(&live, 5, 2);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.running, 2);
        assert_eq!(stats.starting, 1);
        assert_eq!(stats.stopping, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.stopped, 5);
        assert_eq!(stats.crashed, 2);
    }

    #[test]
    fn splits_complete_lines_keeps_partial_tail() {
        let mut buf = b"first line\nsecond\r\npart".to_vec();
        let lines = split_complete_lines(&mut buf);
        assert_eq!(lines, vec!["first line".to_string(), "second".to_string()]);
        assert_eq!(buf, b"part".to_vec());

        buf.extend_from_slice(b"ial\n");
        let lines = split_complete_lines(&mut buf);
        assert_eq!(lines, vec!["partial".to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let mut buf = vec![];
        assert!(split_complete_lines(&mut buf).is_empty());
    }

    #[test]
    fn non_utf8_bytes_are_replaced_not_dropped() {
        let mut buf = vec![0xff, 0xfe, b'\n'];
        let lines = split_complete_lines(&mut buf);
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].is_empty());
    }
}
