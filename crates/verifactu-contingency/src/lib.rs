// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod daemon;

use chrono::{DateTime, FixedOffset};
use std::sync::Arc;
use tokio::sync::RwLock;
use verifactu_core::{Record, RecordStatus, RecordType, VerifactuError};
use verifactu_events::{Event, EventLog, EventType, Severity};
use verifactu_queue::{next_retry_delay_seconds, QueueEntry, QueuePriority, QueueStatus, RetryQueue, MAX_QUEUE_SIZE};
use verifactu_store::{ChainStore, QueryFilter, TransmissionPatch};
use verifactu_transmission::{TransmissionClient, TransmissionOutcome};

pub use daemon::CancelToken;

/// The contingency operating mode, ported from
/// `ContingencyManager.ContingencyMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContingencyMode {
    /// Online, real-time submission.
    Normal,
    /// Partial connectivity; delayed submission, short backoff.
    Degraded,
    /// No connectivity; records are queued and not submitted.
    Offline,
    /// Recovering after hash chain corruption — new records are blocked.
    Recovery,
}

/// Classification of a failure, used to pick the resulting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// A network-level failure (timeout, connection refused).
    Network,
    /// The tax authority reported itself as unavailable.
    AuthorityUnavailable,
    /// The client certificate is invalid or expired.
    Certificate,
    /// Hash chain corruption was detected.
    HashChain,
    /// The local store failed.
    Database,
    /// A logical validation rejection (not retried).
    Validation,
    /// Uncategorized failure.
    Unknown,
}

/// Number of consecutive network/authority failures before escalating
/// from `Degraded` to `Offline`.
const OFFLINE_THRESHOLD: u32 = 3;

/// Current contingency status snapshot (spec §7 "Contingency status").
#[derive(Debug, Clone)]
pub struct ContingencyStatus {
    /// Current mode.
    pub mode: ContingencyMode,
    /// The failure type that produced the current mode, if any.
    pub failure_type: Option<FailureType>,
    /// Human-readable status message.
    pub message: String,
    /// Number of entries currently queued.
    pub queue_size: usize,
    /// Instant of the most recent successful submission.
    pub last_successful_submission: Option<DateTime<FixedOffset>>,
    /// Earliest instant the next retry may run.
    pub next_retry: Option<DateTime<FixedOffset>>,
    /// Whether new records may currently be created (blocked only on
    /// hash chain corruption).
    pub can_create_records: bool,
}

struct Internal {
    mode: ContingencyMode,
    failure_type: Option<FailureType>,
    failure_count: u32,
    last_successful_submission: Option<DateTime<FixedOffset>>,
    queue: RetryQueue,
}

/// Owns the retry queue and the contingency state machine for one engine
/// instance. Ported from `ContingencyManager`, but an explicitly
/// constructed value rather than a process-wide singleton.
pub struct ContingencyManager<S, L, T> {
    store: Arc<S>,
    events: Arc<L>,
    transport: Arc<T>,
    state: RwLock<Internal>,
}

impl<S, L, T> ContingencyManager<S, L, T>
where
    S: ChainStore,
    L: EventLog,
    T: TransmissionClient,
{
    /// Build a manager starting in [`ContingencyMode::Normal`] with an
    /// empty queue.
    pub fn new(store: Arc<S>, events: Arc<L>, transport: Arc<T>) -> Self {
        Self {
            store,
            events,
            transport,
            state: RwLock::new(Internal {
                mode: ContingencyMode::Normal,
                failure_type: None,
                failure_count: 0,
                last_successful_submission: None,
                queue: RetryQueue::new(MAX_QUEUE_SIZE),
            }),
        }
    }

    /// `true` iff the manager is in [`ContingencyMode::Normal`].
    pub async fn is_online(&self) -> bool {
        self.state.read().await.mode == ContingencyMode::Normal
    }

    /// The current status snapshot, computing `next_retry` relative to
    /// `now`.
    pub async fn status(&self, now: DateTime<FixedOffset>) -> ContingencyStatus {
        let state = self.state.read().await;
        ContingencyStatus {
            mode: state.mode,
            failure_type: state.failure_type,
            message: status_message(state.mode, state.failure_type),
            queue_size: state.queue.len(),
            last_successful_submission: state.last_successful_submission,
            next_retry: next_retry(state.mode, state.failure_count, now),
            can_create_records: state.failure_type != Some(FailureType::HashChain),
        }
    }

    /// Queue a record for later submission under contingency.
    pub async fn queue_record(&self, record: &Record, priority: QueuePriority, now: DateTime<FixedOffset>) {
        let mut state = self.state.write().await;
        let id = format!("{}/{}", record.issuer_nif, record.sequence_number);
        let entry = QueueEntry {
            id,
            priority,
            status: QueueStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            next_attempt_at: None,
            enqueued_at: now,
        };
        let _ = state.queue.enqueue(entry);
    }

    /// Record a successful submission: resets the failure counter and
    /// returns the manager to `Normal` if it was in a degraded mode.
    pub async fn record_success(&self, now: DateTime<FixedOffset>) {
        let mut state = self.state.write().await;
        state.last_successful_submission = Some(now);
        state.failure_count = 0;
        if state.mode != ContingencyMode::Normal {
            tracing::info!("returning to normal mode after successful submission");
            state.mode = ContingencyMode::Normal;
            state.failure_type = None;
        }
    }

    /// Record a failure and transition mode accordingly (ported from
    /// `ContingencyManager.record_failure`).
    pub async fn record_failure(&self, failure_type: FailureType, message: &str, now: DateTime<FixedOffset>) {
        let mut state = self.state.write().await;
        state.failure_count += 1;
        state.failure_type = Some(failure_type);

        match failure_type {
            FailureType::Network | FailureType::AuthorityUnavailable => {
                state.mode = if state.failure_count >= OFFLINE_THRESHOLD {
                    ContingencyMode::Offline
                } else {
                    ContingencyMode::Degraded
                };
            }
            FailureType::HashChain => {
                state.mode = ContingencyMode::Recovery;
                tracing::error!("hash chain corruption detected - manual intervention required");
            }
            FailureType::Certificate => {
                state.mode = ContingencyMode::Offline;
                tracing::error!("certificate error - check certificate validity");
            }
            FailureType::Database | FailureType::Validation | FailureType::Unknown => {}
        }

        tracing::warn!(failure_type = ?failure_type, message, "contingency failure recorded");
        let _ = self
            .events
            .log(Event {
                event_type: EventType::TransmissionFailed,
                severity: Severity::Warning,
                message: format!("{failure_type:?}: {message}"),
                details: Default::default(),
                record_sequence: None,
                timestamp: now,
            })
            .await;
    }

    /// Process due entries in the retry queue, submitting each via
    /// `transport` and updating the store. Returns `(successful, failed)`.
    /// No-op while `Offline` (ported from
    /// `ContingencyManager.process_queue`).
    pub async fn process_queue(&self, now: DateTime<FixedOffset>) -> (usize, usize) {
        if self.state.read().await.mode == ContingencyMode::Offline {
            return (0, 0);
        }

        let mut successful = 0;
        let mut failed = 0;

        loop {
            let entry = {
                let mut state = self.state.write().await;
                state.queue.dequeue_ready(now)
            };
            let Some(mut entry) = entry else { break };

            let Some((issuer, sequence)) = parse_entry_id(&entry.id) else {
                failed += 1;
                continue;
            };
            let Ok(Some(record)) = self
                .store
                .query(&QueryFilter {
                    issuer_nif: Some(issuer.clone()),
                    ..Default::default()
                })
                .await
                .map(|records| records.into_iter().find(|r| r.sequence_number == sequence))
            else {
                failed += 1;
                continue;
            };

            let outcome = match record.record_type {
                RecordType::Registration => self.transport.submit_registration(&record).await,
                RecordType::Cancellation => self.transport.submit_cancellation(&record).await,
            };

            match outcome {
                TransmissionOutcome::Success { csv, .. } => {
                    let _ = self
                        .store
                        .update_transmission(
                            &issuer,
                            sequence,
                            TransmissionPatch {
                                status: Some(RecordStatus::Accepted),
                                transmission_timestamp: Some(now),
                                authority_csv: Some(Some(csv)),
                                ..Default::default()
                            },
                        )
                        .await;
                    self.record_success(now).await;
                    successful += 1;
                }
                TransmissionOutcome::Rejected { code, message } => {
                    let _ = self
                        .store
                        .update_transmission(
                            &issuer,
                            sequence,
                            TransmissionPatch {
                                status: Some(RecordStatus::Rejected),
                                transmission_timestamp: Some(now),
                                authority_code: Some(Some(code)),
                                authority_message: Some(Some(message)),
                                ..Default::default()
                            },
                        )
                        .await;
                    self.record_failure(FailureType::Validation, "authority rejected submission", now).await;
                    failed += 1;
                }
                TransmissionOutcome::TransportError(_) => {
                    entry.attempts += 1;
                    entry.last_attempt_at = Some(now);
                    entry.last_error = Some("transport error".to_string());
                    entry.next_attempt_at =
                        Some(now + chrono::Duration::seconds(next_retry_delay_seconds(entry.attempts)));
                    entry.status = QueueStatus::Pending;
                    self.record_failure(FailureType::Network, "transport error during queue processing", now).await;
                    {
                        let mut state = self.state.write().await;
                        let _ = state.queue.enqueue(entry);
                    }
                    failed += 1;
                }
            }
        }

        (successful, failed)
    }

    /// Check system health: certificate expiry, queue size and staleness.
    /// `cert_issue`, if given, is prepended to the issue list verbatim —
    /// callers compute it from their own `VerifactuConfig` so this crate
    /// never depends on `verifactu-config` directly. Returns `(is_healthy,
    /// message)`.
    pub async fn check_health(&self, now: DateTime<FixedOffset>, cert_issue: Option<String>) -> (bool, String) {
        let state = self.state.read().await;
        let mut issues = Vec::new();

        if let Some(issue) = cert_issue {
            issues.push(issue);
        }

        let queue_count = state.queue.len();
        if queue_count > verifactu_queue::MAX_QUEUE_SIZE {
            issues.push(format!("queue size critical: {queue_count} records"));
        } else if queue_count > verifactu_queue::MAX_QUEUE_SIZE / 2 {
            issues.push(format!("queue size warning: {queue_count} records"));
        }

        let stale = state.queue.stale_entries(now).len();
        if stale > 0 {
            issues.push(format!(
                "{stale} records queued for more than {}h",
                verifactu_queue::MAX_QUEUE_AGE_HOURS
            ));
        }

        if issues.is_empty() {
            (true, "system healthy".to_string())
        } else {
            (false, issues.join("; "))
        }
    }

    /// Verify the local chain's hash integrity for `issuer` (ported from
    /// `ContingencyManager.verify_hash_chain`). Recomputes each record's
    /// canonical hash and checks linkage against the previous record.
    pub async fn verify_hash_chain(&self, issuer: &str, now: DateTime<FixedOffset>) -> Result<(), VerifactuError> {
        let mut records = self
            .store
            .query(&QueryFilter {
                issuer_nif: Some(issuer.to_string()),
                ..Default::default()
            })
            .await?;
        records.sort_by_key(|r| r.sequence_number);

        let mut previous_hash = String::new();
        for record in &records {
            verifactu_canon::verify_hash(record)?;
            if !verifactu_canon::linkage_ok(&previous_hash, record) {
                self.record_failure(FailureType::HashChain, "chain linkage error", now).await;
                return Err(VerifactuError::BadLinkage(record.sequence_number));
            }
            previous_hash = record.record_hash.clone();
        }

        Ok(())
    }

    /// Escalate a critical alert: logs at `Critical` severity and records
    /// it in the event log.
    pub async fn escalate_alert(&self, alert_type: &str, message: &str, now: DateTime<FixedOffset>) {
        verifactu_events::escalate(self.events.as_ref(), EventType::TransmissionFailed, &format!("[{alert_type}] {message}"), now)
            .await;
    }
}

fn parse_entry_id(id: &str) -> Option<(String, u64)> {
    let (issuer, seq) = id.split_once('/')?;
    Some((issuer.to_string(), seq.parse().ok()?))
}

fn status_message(mode: ContingencyMode, failure: Option<FailureType>) -> String {
    let base = match mode {
        ContingencyMode::Normal => "system operating normally",
        ContingencyMode::Offline => "offline - records queued",
        ContingencyMode::Degraded => "intermittent connectivity - retrying",
        ContingencyMode::Recovery => "recovering pending records",
    };
    match failure {
        Some(FailureType::Network) => format!("{base} (network error)"),
        Some(FailureType::AuthorityUnavailable) => format!("{base} (authority unavailable)"),
        Some(FailureType::Certificate) => format!("{base} (certificate error)"),
        Some(FailureType::HashChain) => format!("{base} (hash chain error)"),
        Some(FailureType::Database) => format!("{base} (database error)"),
        _ => base.to_string(),
    }
}

fn next_retry(mode: ContingencyMode, failure_count: u32, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    if mode == ContingencyMode::Normal {
        return None;
    }
    let seconds = next_retry_delay_seconds(failure_count.saturating_sub(1));
    Some(now + chrono::Duration::seconds(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use verifactu_core::InvoiceType;
    use verifactu_events::FileEventLog;
    use verifactu_store::FileChainStore;
    use verifactu_transmission::MockClient;

    fn at() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2024, 12, 25, 10, 0, 0).unwrap()
    }

    fn make_record(seq: u64, prev: &str, issuer: &str, number: &str) -> Record {
        let ts = at();
        let date = chrono::NaiveDate::from_ymd_opt(2024, 12, 25).unwrap();
        let canon = verifactu_canon::canonicalize_alta(
            issuer,
            number,
            date,
            InvoiceType::F1,
            dec!(21.00),
            dec!(121.00),
            prev,
            ts,
        );
        Record {
            sequence_number: seq,
            record_type: RecordType::Registration,
            invoice_type: InvoiceType::F1,
            issuer_nif: issuer.to_string(),
            issuer_name: "Acme".to_string(),
            invoice_number: number.to_string(),
            invoice_date: date,
            base_amount: dec!(100.00),
            tax_rate: dec!(21.00),
            tax_amount: dec!(21.00),
            total_amount: dec!(121.00),
            previous_hash: prev.to_string(),
            record_hash: verifactu_canon::compute_hash(&canon),
            is_first_record: prev.is_empty(),
            generation_timestamp: ts,
            status: RecordStatus::Pending,
            transmission_timestamp: None,
            retry_count: 0,
            next_retry_at: None,
            authority_code: None,
            authority_message: None,
            authority_csv: None,
            qr_url: String::new(),
            xml_content: None,
        }
    }

    async fn manager() -> ContingencyManager<FileChainStore, FileEventLog, MockClient> {
        let dir = tempfile::tempdir().unwrap().keep();
        let store = Arc::new(FileChainStore::open(dir.join("chain")).await.unwrap());
        let events = Arc::new(FileEventLog::open(dir.join("events.ndjson")).await.unwrap());
        let transport = Arc::new(MockClient::new());
        ContingencyManager::new(store, events, transport)
    }

    #[tokio::test]
    async fn starts_normal_and_online() {
        let m = manager().await;
        assert!(m.is_online().await);
        assert_eq!(m.status(at()).await.mode, ContingencyMode::Normal);
    }

    #[tokio::test]
    async fn three_network_failures_go_offline() {
        let m = manager().await;
        m.record_failure(FailureType::Network, "x", at()).await;
        m.record_failure(FailureType::Network, "x", at()).await;
        assert_eq!(m.status(at()).await.mode, ContingencyMode::Degraded);
        m.record_failure(FailureType::Network, "x", at()).await;
        assert_eq!(m.status(at()).await.mode, ContingencyMode::Offline);
    }

    #[tokio::test]
    async fn success_resets_to_normal() {
        let m = manager().await;
        m.record_failure(FailureType::Network, "x", at()).await;
        m.record_success(at()).await;
        assert_eq!(m.status(at()).await.mode, ContingencyMode::Normal);
    }

    #[tokio::test]
    async fn hash_chain_failure_blocks_record_creation() {
        let m = manager().await;
        m.record_failure(FailureType::HashChain, "corrupt", at()).await;
        assert!(!m.status(at()).await.can_create_records);
    }

    #[tokio::test]
    async fn verify_hash_chain_passes_for_valid_chain() {
        let m = manager().await;
        let r1 = make_record(1, "", "B12345678", "F2024-001");
        let h1 = r1.record_hash.clone();
        m.store.append(r1).await.unwrap();
        m.store.append(make_record(2, &h1, "B12345678", "F2024-002")).await.unwrap();
        assert!(m.verify_hash_chain("B12345678", at()).await.is_ok());
    }

    #[tokio::test]
    async fn verify_hash_chain_detects_tampering() {
        let m = manager().await;
        let r1 = make_record(1, "", "B12345678", "F2024-001");
        let h1 = r1.record_hash.clone();
        m.store.append(r1).await.unwrap();
        let mut r2 = make_record(2, &h1, "B12345678", "F2024-002");
        r2.total_amount = dec!(999.00);
        m.store.append(r2).await.unwrap();
        let err = m.verify_hash_chain("B12345678", at()).await.unwrap_err();
        assert!(matches!(err, VerifactuError::HashMismatch(_)));
    }

    #[tokio::test]
    async fn queue_and_process_succeeds_via_mock() {
        let m = manager().await;
        let r1 = make_record(1, "", "B12345678", "F2024-001");
        m.store.append(r1.clone()).await.unwrap();
        m.queue_record(&r1, QueuePriority::Normal, at()).await;
        let (ok, failed) = m.process_queue(at()).await;
        assert_eq!(ok, 1);
        assert_eq!(failed, 0);
    }

    #[tokio::test]
    async fn process_queue_noop_when_offline() {
        let m = manager().await;
        m.record_failure(FailureType::Network, "x", at()).await;
        m.record_failure(FailureType::Network, "x", at()).await;
        m.record_failure(FailureType::Network, "x", at()).await;
        let r1 = make_record(1, "", "B12345678", "F2024-001");
        m.store.append(r1.clone()).await.unwrap();
        m.queue_record(&r1, QueuePriority::Normal, at()).await;
        let (ok, failed) = m.process_queue(at()).await;
        assert_eq!((ok, failed), (0, 0));
    }
}
