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

//! The routing-key schema. All keys flowing over either exchange are built
//! and parsed here so the shape lives in exactly one place.
//!
//! Internal exchange (`manman`):
//!   - `command.host.<server_id>.session.<verb>`
//!   - `status.session.<session_id>.<state>`
//!   - `health.host.<server_id>`
//!   - `logs.session.<session_id>`
//!
//! External exchange: `manman.<entity>.<event>`.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString};

use crate::status::SessionStatus;

/// The internal topic exchange both the daemon and every host speak over.
pub const MANMAN_EXCHANGE: &str = "manman";

/// Default name of the exchange curated events are fanned out to.
pub const DEFAULT_EXTERNAL_EXCHANGE: &str = "external";

/// Queue on which the control plane serves reply-correlated API requests.
pub const API_REQUEST_QUEUE: &str = "api-requests";

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, StrumDisplay, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandVerb {
    Start,
    Stop,
    Kill,
    SendInput,
}

/// Per-host queue the host manager consumes commands from.
pub fn host_command_queue(server_id: i64) -> String {
    format!("host-{server_id}-commands")
}

/// Binding pattern covering every session command addressed to one host.
pub fn host_command_binding(server_id: i64) -> String {
    format!("command.host.{server_id}.session.*")
}

pub fn session_command_key(server_id: i64, verb: CommandVerb) -> String {
    format!("command.host.{server_id}.session.{verb}")
}

/// The verb is the final segment of a command key; anything else is a
/// malformed command and the caller should dead-letter it.
pub fn command_verb(routing_key: &str) -> Option<CommandVerb> {
    routing_key.rsplit('.').next()?.parse().ok()
}

pub fn session_status_key(session_id: i64, status: SessionStatus) -> String {
    format!("status.session.{session_id}.{status}")
}

pub fn health_key(server_id: i64) -> String {
    format!("health.host.{server_id}")
}

/// Online/offline announcements ride the health prefix so one binding
/// (`health.#`) covers both heartbeats and status flips.
pub fn host_status_key(server_id: i64) -> String {
    format!("health.host.{server_id}.status")
}

pub fn session_logs_key(session_id: i64) -> String {
    format!("logs.session.{session_id}")
}

/// External-bus mirror keys, `manman.<entity>.<event>`.
pub fn external_session_key(status: impl Display) -> String {
    format!("manman.session.{status}")
}

pub fn external_host_key(event: impl Display) -> String {
    format!("manman.host.{event}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_keys() {
        assert_eq!(
            session_command_key(42, CommandVerb::Start),
            "command.host.42.session.start"
        );
        assert_eq!(
            session_command_key(42, CommandVerb::SendInput),
            "command.host.42.session.send_input"
        );
        assert_eq!(host_command_queue(42), "host-42-commands");
        assert_eq!(host_command_binding(42), "command.host.42.session.*");
    }

    #[test]
    fn verb_extraction() {
        assert_eq!(
            command_verb("command.host.42.session.stop"),
            Some(CommandVerb::Stop)
        );
        assert_eq!(
            command_verb("command.host.42.session.send_input"),
            Some(CommandVerb::SendInput)
        );
        assert_eq!(command_verb("command.host.42.session.reboot"), None);
    }

    #[test]
    fn event_keys() {
        assert_eq!(
            session_status_key(7, SessionStatus::Starting),
            "status.session.7.starting"
        );
        assert_eq!(health_key(3), "health.host.3");
        assert_eq!(host_status_key(3), "health.host.3.status");
        assert_eq!(session_logs_key(7), "logs.session.7");
        assert_eq!(
            external_session_key(SessionStatus::Crashed),
            "manman.session.crashed"
        );
        assert_eq!(external_host_key("stale"), "manman.host.stale");
    }
}
