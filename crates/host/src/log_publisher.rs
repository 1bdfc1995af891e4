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

//! Fire-and-forget log shipping. Readers enqueue lines; a single flush task
//! drains them in batches onto `logs.session.<id>`. The queue is bounded
//! with drop-oldest semantics: a session spewing output can cost us log
//! lines, never memory or liveness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use manman_bus::Publisher;
use manman_common::messages::LogMessage;
use manman_common::routing::{MANMAN_EXCHANGE, session_logs_key};
use manman_common::timeouts::{LOG_BATCH_MAX, LOG_FLUSH_PERIOD, LOG_QUEUE_BOUND};

#[derive(Clone)]
pub struct LogPublisher {
    queue: Arc<Mutex<VecDeque<LogMessage>>>,
    dropped: Arc<AtomicU64>,
    wakeup: Arc<Notify>,
}

impl LogPublisher {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_QUEUE_BOUND))),
            dropped: Arc::new(AtomicU64::new(0)),
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// Never blocks the reader tasks: beyond the bound, the oldest line is
    /// discarded and counted.
    pub fn enqueue(&self, message: LogMessage) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= LOG_QUEUE_BOUND {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(message);
        if queue.len() >= LOG_BATCH_MAX {
            self.wakeup.notify_one();
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn drain_batch(&self) -> Vec<LogMessage> {
        let mut queue = self.queue.lock().unwrap();
        let take = queue.len().min(LOG_BATCH_MAX);
        queue.drain(..take).collect()
    }

    /// Flush loop: a batch goes out when one fills up or the period lapses,
    /// whichever comes first. Publish failures are logged and the lines are
    /// gone; log delivery is best-effort by design of the wire contract.
    pub async fn run(self, publisher: Arc<Publisher>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush(&publisher).await;
                    debug!("log publisher stopped");
                    return;
                }
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(LOG_FLUSH_PERIOD) => {}
            }
            self.flush(&publisher).await;

            let dropped = self.dropped.swap(0, Ordering::Relaxed);
            if dropped > 0 {
                warn!(dropped, "log queue overflowed, oldest lines discarded");
            }
        }
    }

    async fn flush(&self, publisher: &Publisher) {
        loop {
            let batch = self.drain_batch();
            if batch.is_empty() {
                return;
            }
            // One publish per session so routing keys stay per-session.
            let mut by_session: std::collections::HashMap<i64, Vec<&LogMessage>> =
                Default::default();
            for message in &batch {
                by_session.entry(message.session_id).or_default().push(message);
            }
            for (session_id, lines) in by_session {
                if let Err(e) = publisher
                    .publish(MANMAN_EXCHANGE, &session_logs_key(session_id), &lines)
                    .await
                {
                    error!(session_id, error = %e, "log batch publish failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manman_common::messages::LogSource;

    fn line(session_id: i64, n: u64) -> LogMessage {
        LogMessage {
            session_id,
            timestamp_ms: n as i64,
            source: LogSource::Stdout,
            message: format!("line {n}"),
        }
    }

    #[test]
    fn drops_oldest_beyond_bound() {
        let logs = LogPublisher::new();
        for n in 0..(LOG_QUEUE_BOUND as u64 + 10) {
            logs.enqueue(line(1, n));
        }
        assert_eq!(logs.dropped(), 10);
        let batch = logs.drain_batch();
        // The first ten lines are gone; the survivor head is line 10.
        assert_eq!(batch[0].message, "line 10");
    }

    #[test]
    fn drains_in_bounded_batches() {
        let logs = LogPublisher::new();
        for n in 0..250 {
            logs.enqueue(line(1, n));
        }
        assert_eq!(logs.drain_batch().len(), LOG_BATCH_MAX);
        assert_eq!(logs.drain_batch().len(), LOG_BATCH_MAX);
        assert_eq!(logs.drain_batch().len(), 50);
        assert!(logs.drain_batch().is_empty());
    }

    #[test]
    fn preserves_per_session_order() {
        let logs = LogPublisher::new();
        for n in 0..50 {
            logs.enqueue(line(7, n));
        }
        let batch = logs.drain_batch();
        let timestamps: Vec<i64> = batch.iter().map(|m| m.timestamp_ms).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }
}
