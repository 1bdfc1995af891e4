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

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Lifecycle state of a session. The processor is the only component allowed
/// to commit transitions between these; hosts merely report what they observe.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Lost,
}

impl SessionStatus {
    /// Terminal statuses are absorbing; once here, a session never moves again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Crashed | SessionStatus::Lost
        )
    }
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServerStatus {
    Online,
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Crashed.is_terminal());
        assert!(SessionStatus::Lost.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Starting.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Stopping.is_terminal());
    }

    #[test]
    fn status_string_round_trip() {
        for status in SessionStatus::iter() {
            let s = status.to_string();
            assert_eq!(s.parse::<SessionStatus>().unwrap(), status);
        }
        assert_eq!(SessionStatus::Lost.to_string(), "lost");
        assert_eq!(ServerStatus::Online.to_string(), "online");
    }

    #[test]
    fn status_serde_uses_snake_case() {
        let json = serde_json::to_string(&SessionStatus::Starting).unwrap();
        assert_eq!(json, "\"starting\"");
        let back: SessionStatus = serde_json::from_str("\"crashed\"").unwrap();
        assert_eq!(back, SessionStatus::Crashed);
    }
}
