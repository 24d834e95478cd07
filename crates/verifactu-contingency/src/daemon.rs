// SPDX-License-Identifier: MIT OR Apache-2.0
//! Background queue-draining loop (spec §5), the long-running counterpart
//! to the one-shot `process_queue`/`check_health` calls a caller can also
//! issue directly.

use crate::ContingencyManager;
use chrono::{DateTime, FixedOffset};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};
use verifactu_events::EventLog;
use verifactu_store::ChainStore;
use verifactu_transmission::TransmissionClient;

/// Cooperative cancellation signal for [`ContingencyManager::run_forever`].
///
/// Cloneable and backed by an `Arc`; calling [`cancel`](CancelToken::cancel)
/// on any clone wakes every clone's [`cancelled`](CancelToken::cancelled)
/// waiter.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    /// Create a new, non-cancelled token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signal cancellation to all waiters.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait until cancellation is signalled; returns immediately if it
    /// already has been.
    pub async fn cancelled(&self) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, L, T> ContingencyManager<S, L, T>
where
    S: ChainStore,
    L: EventLog,
    T: TransmissionClient,
{
    /// Drain the retry queue on a fixed interval until `cancel` fires.
    ///
    /// `now` and `cert_issue` are caller-supplied closures rather than
    /// concrete `Clock`/`VerifactuConfig` dependencies, so this crate does
    /// not need to depend on whichever layer owns time injection or
    /// configuration; `verifactu-engine` wires its own `Clock` and config
    /// handle in here when it spawns the daemon task.
    pub async fn run_forever<F, C>(self: Arc<Self>, now: F, cert_issue: C, poll_interval: Duration, cancel: CancelToken)
    where
        F: Fn() -> DateTime<FixedOffset> + Send + Sync + 'static,
        C: Fn() -> Option<String> + Send + Sync + 'static,
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target: "verifactu.contingency", "daemon loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(poll_interval) => {
                    let at = now();
                    let (submitted, requeued) = self.process_queue(at).await;
                    if submitted > 0 || requeued > 0 {
                        debug!(target: "verifactu.contingency", submitted, requeued, "queue drained");
                    }
                    let (healthy, message) = self.check_health(at, cert_issue()).await;
                    if !healthy {
                        warn!(target: "verifactu.contingency", message = %message, "unhealthy during daemon poll");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration as StdDuration;
    use verifactu_events::FileEventLog;
    use verifactu_store::FileChainStore;
    use verifactu_transmission::MockClient;

    #[tokio::test]
    async fn run_forever_stops_promptly_after_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileChainStore::open(dir.path().join("chain")).await.unwrap());
        let events = Arc::new(FileEventLog::open(dir.path().join("events.ndjson")).await.unwrap());
        let transport = Arc::new(MockClient::new());
        let manager = Arc::new(ContingencyManager::new(store, events, transport));

        let polls = Arc::new(AtomicUsize::new(0));
        let polls2 = polls.clone();
        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(async move {
            manager
                .run_forever(
                    move || {
                        polls2.fetch_add(1, AtomicOrdering::SeqCst);
                        fixed_now()
                    },
                    || None,
                    StdDuration::from_millis(5),
                    cancel2,
                )
                .await;
        });

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(StdDuration::from_secs(1), handle).await.unwrap().unwrap();

        assert!(polls.load(AtomicOrdering::SeqCst) >= 1);
    }

    fn fixed_now() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-12-25T10:00:00+01:00").unwrap()
    }
}
