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

//! Operational deadlines and periods, collected so daemon and host agree.

use std::time::Duration;

/// Deadline for a single broker publish attempt.
pub const PUBLISH_DEADLINE: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL when stopping a container.
pub const CONTAINER_STOP_GRACE: Duration = Duration::from_secs(30);

/// Deadline for one control-plane registration dial.
pub const REGISTER_DIAL_DEADLINE: Duration = Duration::from_secs(30);

/// How often a host publishes a health heartbeat.
pub const HEALTH_PERIOD: Duration = Duration::from_secs(5);

/// How often a host re-checks for orphaned containers.
pub const ORPHAN_SWEEP_PERIOD: Duration = Duration::from_secs(300);

/// How often the daemon sweeps for stale hosts.
pub const STALE_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// A host that hasn't been heard from for this long is considered stale.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(180);

/// Allowance for in-flight work between `host.offline` and process exit.
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Log publisher flush cadence and batch ceiling.
pub const LOG_FLUSH_PERIOD: Duration = Duration::from_secs(2);
pub const LOG_BATCH_MAX: usize = 100;

/// Bound on the per-host log queue; oldest lines are dropped beyond this.
pub const LOG_QUEUE_BOUND: usize = 4096;
