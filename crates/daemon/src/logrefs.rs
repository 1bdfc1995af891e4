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

//! Log-reference upkeep: every batch of session log lines keeps its
//! minute-bucketed reference fresh, so the archival worker downstream knows
//! which chunks exist and when they last grew. The upload itself happens
//! elsewhere.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use manman_bus::{Broker, Consumer};
use manman_common::messages::LogMessage;
use manman_common::routing::MANMAN_EXCHANGE;
use manman_common::HandlerError;

use crate::repository::Repository;

pub const LOG_REFERENCE_QUEUE: &str = "log-references";

/// Floor a wire timestamp to its minute bucket.
pub fn minute_bucket(timestamp_ms: i64) -> DateTime<Utc> {
    let floored = timestamp_ms - timestamp_ms.rem_euclid(60_000);
    Utc.timestamp_millis_opt(floored)
        .single()
        .unwrap_or_default()
}

pub fn record_batch(repo: &Repository, batch: &[LogMessage]) -> Result<(), HandlerError> {
    for message in batch {
        let Some(session) = repo.session(message.session_id) else {
            // A log line for a session we never planned can't be bucketed
            // meaningfully; redelivery won't make the session appear.
            return Err(HandlerError::permanent(format!(
                "log lines for unknown session {}",
                message.session_id
            )));
        };
        let bucket = minute_bucket(message.timestamp_ms);
        repo.touch_log_reference(message.session_id, session.sgc_id, bucket);
        debug!(
            session_id = message.session_id,
            %bucket,
            "log reference touched"
        );
    }
    Ok(())
}

pub async fn run(
    repo: Arc<Repository>,
    broker: Arc<Broker>,
    cancel: CancellationToken,
) -> Result<(), manman_bus::BusError> {
    let mut consumer = Consumer::new(&broker, LOG_REFERENCE_QUEUE, true, false).await?;
    consumer.bind(MANMAN_EXCHANGE, "logs.session.#").await?;

    let handler_repo = repo.clone();
    consumer.on("logs.session.#", move |m| {
        let repo = handler_repo.clone();
        async move {
            let batch: Vec<LogMessage> = serde_json::from_slice(&m.payload)?;
            record_batch(&repo, &batch)?;
            Ok(None)
        }
    });
    consumer.run(cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use manman_common::messages::LogSource;

    #[test]
    fn minute_bucketing_floors() {
        let bucket = minute_bucket(1_700_000_059_999);
        assert_eq!(bucket.timestamp_millis(), 1_700_000_040_000);
        assert_eq!(minute_bucket(1_700_000_040_000), bucket);
        // Next minute is a different bucket.
        assert_ne!(minute_bucket(1_700_000_060_000), bucket);
    }

    #[test]
    fn lines_in_one_minute_share_a_reference() {
        let repo = Repository::new();
        let session = repo.create_session(1, 10);
        let line = |ms: i64| LogMessage {
            session_id: session.session_id,
            timestamp_ms: ms,
            source: LogSource::Stdout,
            message: "tick".to_string(),
        };

        record_batch(&repo, &[line(1_700_000_040_500), line(1_700_000_059_000)]).unwrap();
        assert_eq!(repo.log_references_for_session(session.session_id).len(), 1);

        record_batch(&repo, &[line(1_700_000_061_000)]).unwrap();
        assert_eq!(repo.log_references_for_session(session.session_id).len(), 2);
    }

    #[test]
    fn unknown_session_logs_are_permanent_failures() {
        let repo = Repository::new();
        let err = record_batch(
            &repo,
            &[LogMessage {
                session_id: 404,
                timestamp_ms: 0,
                source: LogSource::Stderr,
                message: "boom".to_string(),
            }],
        )
        .unwrap_err();
        assert!(err.is_permanent());
    }
}
