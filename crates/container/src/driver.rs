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

//! Thin adapter over the Docker engine API. No policy lives here: the
//! session supervisor decides what to do, this crate only does it.

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;

use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::{API_DEFAULT_VERSION, Docker};
use futures_util::StreamExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use manman_common::domain::{HostCapabilities, PortBinding, VolumeSpec, VolumeType};

use crate::ContainerError;

/// Labels stamped on every container we create, so orphan recovery can find
/// our containers and nobody else's.
pub const SESSION_ID_LABEL: &str = "manman.session_id";
pub const SERVER_ID_LABEL: &str = "manman.server_id";

/// Everything needed to create one game-server container.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    pub port_bindings: Vec<PortBinding>,
    pub volumes: Vec<VolumeSpec>,
    pub labels: HashMap<String, String>,
    /// Host directory the session's bind volumes are rooted under.
    pub data_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Other,
}

#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub exit_code: Option<i64>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub container_id: String,
    pub state: String,
    pub labels: HashMap<String, String>,
}

/// Demuxed log tails. Each chunk is raw bytes from exactly one of the two
/// sources; line assembly is the reader's business.
pub struct LogStreams {
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub stderr: mpsc::Receiver<Vec<u8>>,
}

#[derive(Clone)]
pub struct ContainerDriver {
    docker: Docker,
}

impl ContainerDriver {
    /// Connect over the local engine socket.
    pub fn connect(socket_path: &Path) -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_socket(
            &socket_path.display().to_string(),
            120,
            API_DEFAULT_VERSION,
        )
        .map_err(|e| ContainerError::Unreachable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Engine capabilities, reported during host registration.
    pub async fn info(&self) -> Result<HostCapabilities, ContainerError> {
        let info = self.docker.info().await?;
        Ok(HostCapabilities {
            mem_mb: info.mem_total.unwrap_or(0) / (1024 * 1024),
            cpu_m: info.ncpu.unwrap_or(0) * 1000,
            docker_version: info.server_version.unwrap_or_default(),
        })
    }

    /// Create the container; stdin stays open so it can be attached before
    /// start. Returns the engine-assigned container id.
    pub async fn create(&self, spec: &CreateSpec) -> Result<String, ContainerError> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .port_bindings
            .iter()
            .map(|b| (format!("{}/tcp", b.container_port), HashMap::new()))
            .collect();

        let port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>> = spec
            .port_bindings
            .iter()
            .map(|b| {
                (
                    format!("{}/tcp", b.container_port),
                    Some(vec![bollard::models::PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(b.host_port.to_string()),
                    }]),
                )
            })
            .collect();

        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|v| {
                let source = match v.volume_type {
                    VolumeType::Bind => format!("{}/{}", spec.data_dir, v.host_subpath),
                    VolumeType::Named => v.name.clone(),
                };
                let mut options: Vec<String> = v.options.clone();
                if v.read_only {
                    options.push("ro".to_string());
                }
                if options.is_empty() {
                    format!("{}:{}", source, v.container_path)
                } else {
                    format!("{}:{}:{}", source, v.container_path, options.join(","))
                }
            })
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            entrypoint: if spec.entrypoint.is_empty() {
                None
            } else {
                Some(spec.entrypoint.clone())
            },
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                binds: if binds.is_empty() { None } else { Some(binds) },
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        for warning in &created.warnings {
            warn!(container_id = %created.id, warning, "engine warning on create");
        }
        Ok(created.id)
    }

    pub async fn start(&self, container_id: &str) -> Result<(), ContainerError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Graceful stop: SIGTERM, then SIGKILL once `timeout` elapses.
    pub async fn stop(
        &self,
        container_id: &str,
        timeout: std::time::Duration,
    ) -> Result<(), ContainerError> {
        self.docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn kill(&self, container_id: &str) -> Result<(), ContainerError> {
        self.docker
            .kill_container(container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await?;
        Ok(())
    }

    pub async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, ContainerError> {
        let inspected = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;
        let state = inspected.state.unwrap_or_default();
        let container_state = match state.status {
            Some(bollard::models::ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
            Some(bollard::models::ContainerStateStatusEnum::CREATED) => ContainerState::Created,
            Some(bollard::models::ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
            _ => ContainerState::Other,
        };
        Ok(ContainerStatus {
            state: container_state,
            exit_code: state.exit_code,
            started_at: state.started_at,
            finished_at: state.finished_at,
        })
    }

    pub async fn remove(&self, container_id: &str, force: bool) -> Result<(), ContainerError> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    /// Block until the container exits, returning its exit code.
    pub async fn wait(&self, container_id: &str) -> Result<i64, ContainerError> {
        let mut waits = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>);
        match waits.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // The engine reports a non-zero exit through an "error" that
            // still carries the status; surface what we can.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(ContainerError::Runtime(format!(
                "wait stream for {container_id} ended without a result"
            ))),
        }
    }

    /// Follow the container's output, demuxed into separate source-tagged
    /// streams. The demux task ends when the engine closes the log stream
    /// (container gone) or both receivers hang up.
    pub fn stream_logs(&self, container_id: &str, since_unix: i64) -> LogStreams {
        let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>(256);
        let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>(256);

        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                since: since_unix,
                ..Default::default()
            }),
        );

        let id = container_id.to_string();
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        if stdout_tx.send(message.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        if stderr_tx.send(message.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => {
                        debug!(container_id = %id, error = %e, "log stream ended");
                        break;
                    }
                }
            }
        });

        LogStreams {
            stdout: stdout_rx,
            stderr: stderr_rx,
        }
    }

    /// Attach to the container's stdin. Must happen before `start` so no
    /// early output or input window is lost. The writer dies with the
    /// container.
    pub async fn attach_stdin(
        &self,
        container_id: &str,
    ) -> Result<Pin<Box<dyn AsyncWrite + Send>>, ContainerError> {
        let results = self
            .docker
            .attach_container(
                container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(false),
                    stderr: Some(false),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(results.input)
    }

    /// All containers (running or not) carrying the given label value.
    pub async fn list(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, ContainerError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{label}={value}")],
        );
        let listed = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(listed
            .into_iter()
            .map(|c| ContainerSummary {
                container_id: c.id.unwrap_or_default(),
                state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_volume_string_includes_options() {
        let spec = CreateSpec {
            data_dir: "/srv/manman/sgc-prod-3/session-7".to_string(),
            volumes: vec![VolumeSpec {
                name: "world".to_string(),
                container_path: "/data".to_string(),
                host_subpath: "world".to_string(),
                options: vec![],
                read_only: true,
                volume_type: VolumeType::Bind,
            }],
            ..Default::default()
        };
        // Mirrors the bind construction in `create`.
        let v = &spec.volumes[0];
        let source = format!("{}/{}", spec.data_dir, v.host_subpath);
        assert_eq!(source, "/srv/manman/sgc-prod-3/session-7/world");
    }

    #[test]
    fn capability_units() {
        // 32 GiB, 16 cores as the engine reports them.
        let caps = HostCapabilities {
            mem_mb: 34_359_738_368 / (1024 * 1024),
            cpu_m: 16 * 1000,
            docker_version: "27.1.1".to_string(),
        };
        assert_eq!(caps.mem_mb, 32_768);
        assert_eq!(caps.cpu_m, 16_000);
    }
}
