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

pub use connect::{Broker, TlsOptions};
pub use consume::{Consumer, Disposition, InboundMessage, death_count, queue_arguments};
pub use publish::Publisher;
pub use rpc::RpcClient;
pub use topic::matches;

mod connect;
mod consume;
mod publish;
mod rpc;
mod topic;

use thiserror::Error;

/// Errors at the broker transport layer. Everything here is transient from
/// the perspective of a message handler; permanence is a handler-level call.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("could not connect to broker: {0}")]
    Connect(String),
    #[error("broker channel error: {0}")]
    Channel(#[from] lapin::Error),
    #[error("could not encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish failed after {attempts} attempts: {last}")]
    PublishExhausted { attempts: u32, last: String },
    #[error("rpc call to {queue} timed out")]
    RpcTimeout { queue: String },
    #[error("rpc reply could not be decoded: {0}")]
    RpcDecode(String),
    #[error("could not read CA certificate {path}: {source}")]
    CaRead {
        path: String,
        source: std::io::Error,
    },
}

/// Whether a lapin error is worth retrying at all, or the broker has told us
/// something we can't talk our way out of (precondition failures, access
/// refusals).
pub(crate) fn retryable(err: &lapin::Error) -> bool {
    use lapin::Error;
    match err {
        // Connection/channel/OS-level failures; a reopened channel (or a
        // fresh connection) may well succeed.
        Error::IOError(_) => true,
        Error::InvalidChannelState(_) | Error::InvalidConnectionState(_) => true,
        // Protocol errors (precondition-failed, access-refused, ...) won't
        // get better by asking again.
        _ => false,
    }
}
