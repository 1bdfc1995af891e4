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

pub use driver::{
    ContainerDriver, ContainerState, ContainerStatus, ContainerSummary, CreateSpec, LogStreams,
    SESSION_ID_LABEL, SERVER_ID_LABEL,
};

pub mod driver;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),
    #[error("container runtime error: {0}")]
    Runtime(String),
}

impl From<bollard::errors::Error> for ContainerError {
    fn from(e: bollard::errors::Error) -> Self {
        use bollard::errors::Error;
        match e {
            Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => ContainerError::NotFound(message),
            other => ContainerError::Runtime(other.to_string()),
        }
    }
}
