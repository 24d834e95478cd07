// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The record engine and its administrative facade (spec §4.C, §6).

pub mod builder;
pub mod clock;

use chrono::{DateTime, FixedOffset};
use std::sync::Arc;
use std::sync::RwLock as SyncRwLock;
use verifactu_canon::is_hex_upper_64;
use verifactu_config::{LockKeeper, ReconciliationSummary, VerifactuConfig};
use verifactu_contingency::{CancelToken, ContingencyManager, ContingencyStatus, FailureType};
use verifactu_core::{InvoiceSnapshot, Record, RecordType, VerifactuError};
use verifactu_events::EventLog;
use verifactu_queue::QueuePriority;
use verifactu_reconciliation::{ReconciliationOutcome, ReconciliationService};
use verifactu_recovery::{PointerSource, RecoveryPointer, RecoveryPointerStore};
use verifactu_store::{ChainStore, QueryFilter};
use verifactu_transmission::{TransmissionClient, TransmissionOutcome};

pub use builder::RecordBuilder;
pub use clock::{Clock, SystemClock};

/// Status of a manual or automatic chain recovery attempt, ported from
/// `recovery_service.py`'s `RecoveryStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    /// A new recovery pointer was saved.
    Success,
    /// The supplied hash is not 64 uppercase hex characters.
    InvalidHash,
}

/// Outcome of a `recover_manual` call.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    /// Resulting status.
    pub status: RecoveryStatus,
    /// The hash written, if the call succeeded.
    pub recovered_hash: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

/// A point-in-time comparison of the local chain head against the
/// authority's last known record for one issuer, ported from
/// `recovery_service.py`'s `ChainStatus` — here `local_last_hash` is
/// drawn from the local chain head regardless of transmission status,
/// since every successfully appended record already carries a computed
/// hash whether or not it has been transmitted yet.
#[derive(Debug, Clone)]
pub struct ChainStatusReport {
    /// Whether the two sides agree (or the authority could not be
    /// reached, in which case synchronization is assumed rather than
    /// flagged — matching the Python's `aeat_hash is None` fallback).
    pub is_synced: bool,
    /// Local chain head hash, if any record exists.
    pub local_last_hash: Option<String>,
    /// Authority's last known hash, if reachable.
    pub authority_last_hash: Option<String>,
    /// Human-readable summary.
    pub message: String,
}

/// Composes the record builder with the contingency, reconciliation, and
/// transmission collaborators behind one administrative surface — the
/// same shape `abp-daemon`'s `AppState` gives its own collaborators.
pub struct VerifactuEngine<S, P, L, T>
where
    S: ChainStore,
    P: RecoveryPointerStore,
    L: EventLog,
    T: TransmissionClient,
{
    store: Arc<S>,
    pointers: Arc<P>,
    transport: Arc<T>,
    lock: Arc<LockKeeper>,
    clock: Arc<dyn Clock>,
    config: Arc<SyncRwLock<VerifactuConfig>>,
    builder: RecordBuilder<S, P, L>,
    contingency: Arc<ContingencyManager<S, L, T>>,
    reconciliation: ReconciliationService<S, T, L, P>,
}

impl<S, P, L, T> VerifactuEngine<S, P, L, T>
where
    S: ChainStore,
    P: RecoveryPointerStore,
    L: EventLog,
    T: TransmissionClient,
{
    /// Build an engine over the given collaborators. `config` is shared
    /// with whichever layer owns loading/mutating it (the CLI, typically)
    /// so certificate-expiry tracking reaches [`VerifactuEngine::health`]
    /// without this crate reaching back up to `verifactu-config` for
    /// anything beyond the plain data type.
    pub fn new(
        store: Arc<S>,
        pointers: Arc<P>,
        events: Arc<L>,
        transport: Arc<T>,
        lock: Arc<LockKeeper>,
        clock: Arc<dyn Clock>,
        config: Arc<SyncRwLock<VerifactuConfig>>,
    ) -> Self {
        let builder = RecordBuilder::new(store.clone(), pointers.clone(), events.clone(), lock.clone(), clock.clone());
        let contingency = Arc::new(ContingencyManager::new(store.clone(), events.clone(), transport.clone()));
        let reconciliation = ReconciliationService::new(store.clone(), transport.clone(), events, pointers.clone());
        Self {
            store,
            pointers,
            transport,
            lock,
            clock,
            config,
            builder,
            contingency,
            reconciliation,
        }
    }

    /// Build, append, and (if online) transmit a record for `snapshot`.
    /// Offline or failed transmission queues the record instead of
    /// failing the call — creation and transmission are independent
    /// steps, matching the contingency design spec §4.F calls for.
    pub async fn create_record(
        &self,
        snapshot: InvoiceSnapshot,
        record_type: RecordType,
        actor: &str,
    ) -> Result<Record, VerifactuError> {
        let now = self.clock.now();
        let record = self.builder.build_and_append(snapshot, record_type, actor).await?;

        if !self.contingency.is_online().await {
            self.contingency.queue_record(&record, QueuePriority::Normal, now).await;
            return Ok(record);
        }

        let outcome = match record.record_type {
            RecordType::Registration => self.transport.submit_registration(&record).await,
            RecordType::Cancellation => self.transport.submit_cancellation(&record).await,
        };

        match outcome {
            TransmissionOutcome::Success { .. } => {
                self.contingency.record_success(now).await;
            }
            TransmissionOutcome::Rejected { .. } => {
                // A protocol-level rejection is not retried (spec §4.F
                // scenario 4): the authority has spoken, queuing it again
                // would just repeat the same rejection.
                self.contingency.record_failure(FailureType::Validation, "submission rejected", now).await;
            }
            TransmissionOutcome::TransportError(_) => {
                self.contingency.record_failure(FailureType::Network, "transport error", now).await;
                self.contingency.queue_record(&record, QueuePriority::Normal, now).await;
            }
        }

        Ok(record)
    }

    /// List records for `issuer` matching `filter`.
    pub async fn list_records(&self, issuer: &str, filter: QueryFilter) -> Result<Vec<Record>, VerifactuError> {
        let filter = QueryFilter { issuer_nif: Some(issuer.to_string()), ..filter };
        self.store.query(&filter).await
    }

    /// Fetch one record by `(issuer, sequence_number)`.
    pub async fn get_record(&self, issuer: &str, sequence_number: u64) -> Result<Option<Record>, VerifactuError> {
        let records = self
            .store
            .query(&QueryFilter { issuer_nif: Some(issuer.to_string()), ..Default::default() })
            .await?;
        Ok(records.into_iter().find(|r| r.sequence_number == sequence_number))
    }

    /// Drain the contingency retry queue. Returns `(submitted, requeued)`.
    pub async fn process_queue(&self) -> (usize, usize) {
        let now = self.clock.now();
        self.contingency.process_queue(now).await
    }

    /// Spawn the background task that drains the retry queue and checks
    /// health on a fixed interval until cancelled, returning the token
    /// that stops it and a handle to await its completion.
    pub fn run_forever(&self, poll_interval: std::time::Duration) -> (CancelToken, tokio::task::JoinHandle<()>)
    where
        S: 'static,
        L: 'static,
        T: 'static,
    {
        let cancel = CancelToken::new();
        let contingency = self.contingency.clone();
        let clock = self.clock.clone();
        let cert_clock = self.clock.clone();
        let config = self.config.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            contingency
                .run_forever(
                    move || clock.now(),
                    move || certificate_issue(&config, cert_clock.now()),
                    poll_interval,
                    task_cancel,
                )
                .await;
        });
        (cancel, handle)
    }

    /// Verify `issuer`'s local hash chain linkage end to end.
    pub async fn verify_chain(&self, issuer: &str) -> Result<(), VerifactuError> {
        let now = self.clock.now();
        self.contingency.verify_hash_chain(issuer, now).await
    }

    /// Probe authority connectivity without submitting anything.
    pub async fn probe_connection(&self) -> Result<(), verifactu_transmission::TransportErrorKind> {
        self.transport.probe_connection().await
    }

    /// Compare `issuer`'s local chain against the authority for `year`
    /// and classify any disagreement.
    pub async fn reconcile(&self, issuer: &str, year: i32) -> Result<ReconciliationOutcome, VerifactuError> {
        let now = self.clock.now();
        let outcome = self.reconciliation.reconcile(issuer, year, now).await?;
        self.lock
            .mark_reconciliation(ReconciliationSummary {
                attempted_at: now,
                status: format!("{outcome:?}").split_whitespace().next().unwrap_or("unknown").to_string(),
                message: format!("{outcome:?}"),
            })
            .await?;
        Ok(outcome)
    }

    /// Attempt to automatically resolve whatever conflict `reconcile`
    /// would find for `issuer`/`year`.
    pub async fn resolve_conflict(&self, issuer: &str, year: i32) -> Result<ReconciliationOutcome, VerifactuError> {
        let now = self.clock.now();
        self.reconciliation.resolve_conflict(issuer, year, now).await
    }

    /// Pull the authority's single most recent record for `issuer`/`year`
    /// and adopt it as a recovery pointer unconditionally.
    pub async fn sync_from_aeat(&self, issuer: &str, year: i32) -> Result<ReconciliationOutcome, VerifactuError> {
        let now = self.clock.now();
        self.reconciliation.sync_from_aeat(issuer, year, now).await
    }

    /// Record a manually-supplied recovery hash for `issuer`, to be used
    /// as the next record's `previous_hash` when the local chain and
    /// recovery pointer store both hold nothing (spec §4.I). Ported from
    /// `ChainRecoveryService.recover_manual`.
    pub async fn recover_manual(&self, issuer: &str, last_hash: &str) -> Result<RecoveryResult, VerifactuError> {
        if !is_hex_upper_64(last_hash) {
            return Ok(RecoveryResult {
                status: RecoveryStatus::InvalidHash,
                recovered_hash: None,
                message: "hash must be 64 uppercase hexadecimal characters".to_string(),
            });
        }

        let now = self.clock.now();
        self.pointers
            .set(
                issuer,
                RecoveryPointer {
                    hash: last_hash.to_string(),
                    source: PointerSource::Manual,
                    invoice_number: None,
                    set_at: now,
                },
            )
            .await?;

        Ok(RecoveryResult {
            status: RecoveryStatus::Success,
            recovered_hash: Some(last_hash.to_string()),
            message: "recovery pointer saved; the next record will chain from this hash".to_string(),
        })
    }

    /// Compare the local chain head against the authority's last known
    /// hash for `issuer`/`year` without attempting any resolution.
    /// Ported from `ChainRecoveryService.get_chain_status`.
    pub async fn chain_status(&self, issuer: &str, year: i32) -> Result<ChainStatusReport, VerifactuError> {
        let local_last_hash = self.store.head(issuer).await?.map(|r| r.record_hash);
        let authority_last_hash = self.transport.last_hash(issuer, year).await;

        let (is_synced, message) = match (&local_last_hash, &authority_last_hash) {
            (_, None) => (true, "could not verify against the tax authority".to_string()),
            (Some(l), Some(a)) if l == a => (true, "chain is synchronized".to_string()),
            (None, Some(_)) => (false, "no local records but the authority has records".to_string()),
            _ => (false, "local and authority chains have diverged".to_string()),
        };

        Ok(ChainStatusReport {
            is_synced,
            local_last_hash,
            authority_last_hash,
            message,
        })
    }

    /// Current contingency status snapshot.
    pub async fn contingency_status(&self) -> ContingencyStatus {
        let now = self.clock.now();
        self.contingency.status(now).await
    }

    /// Overall engine health: certificate expiry, contingency status, and
    /// queue health.
    pub async fn health(&self) -> (bool, String) {
        let now = self.clock.now();
        self.contingency.check_health(now, certificate_issue(&self.config, now)).await
    }
}

/// Certificate-expiry health issue, if `config`'s certificate is within
/// its warning window as of `now`. Computed here (in `verifactu-engine`,
/// not `verifactu-contingency`) so the contingency crate never needs to
/// depend on `verifactu-config`.
fn certificate_issue(config: &SyncRwLock<VerifactuConfig>, now: DateTime<FixedOffset>) -> Option<String> {
    let config = config.read().expect("config lock poisoned");
    if config.is_certificate_expiring(now) {
        let days = config.days_until_certificate_expiry(now).unwrap_or_default();
        Some(format!("certificate expires in {days} day(s)"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;
    use verifactu_config::LockState;
    use verifactu_core::InvoiceType;
    use verifactu_events::FileEventLog;
    use verifactu_recovery::FileRecoveryPointerStore;
    use verifactu_store::FileChainStore;
    use verifactu_transmission::MockClient;

    fn at(y: i32, m: u32, d: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    fn snapshot(number: &str) -> InvoiceSnapshot {
        InvoiceSnapshot {
            issuer_nif: "B12345678".to_string(),
            issuer_name: "Acme S.L.".to_string(),
            invoice_number: number.to_string(),
            invoice_date: NaiveDate::from_ymd_opt(2024, 12, 25).unwrap(),
            invoice_type: InvoiceType::F1,
            base_amount: dec!(100.00),
            tax_rate: dec!(21.00),
            tax_amount: dec!(21.00),
            total_amount: dec!(121.00),
        }
    }

    async fn engine(
        dir: &tempfile::TempDir,
        clock: Arc<dyn Clock>,
    ) -> VerifactuEngine<FileChainStore, FileRecoveryPointerStore, FileEventLog, MockClient> {
        let store = Arc::new(FileChainStore::open(dir.path().join("chain")).await.unwrap());
        let pointers = Arc::new(FileRecoveryPointerStore::open(dir.path().join("pointers.json")).await.unwrap());
        let events = Arc::new(FileEventLog::open(dir.path().join("events.ndjson")).await.unwrap());
        let transport = Arc::new(MockClient::new());
        let lock = Arc::new(LockKeeper::new(LockState::default()));
        let config = Arc::new(SyncRwLock::new(VerifactuConfig::default()));
        VerifactuEngine::new(store, pointers, events, transport, lock, clock, config)
    }

    #[tokio::test]
    async fn create_record_transmits_when_online() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(2024, 12, 25)));
        let e = engine(&dir, clock).await;

        let record = e.create_record(snapshot("F2024-001"), RecordType::Registration, "system").await.unwrap();
        assert_eq!(record.sequence_number, 1);

        let listed = e.list_records("B12345678", QueryFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn rejected_submission_is_not_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(2024, 12, 25)));
        let e = engine(&dir, clock).await;
        e.transport.set_rejection("999", "bad data");

        e.create_record(snapshot("F2024-001"), RecordType::Registration, "system").await.unwrap();
        let status = e.contingency_status().await;
        assert_eq!(status.queue_size, 0);
    }

    #[tokio::test]
    async fn manual_recovery_rejects_malformed_hash() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(2024, 12, 25)));
        let e = engine(&dir, clock).await;

        let result = e.recover_manual("B12345678", "not-a-hash").await.unwrap();
        assert_eq!(result.status, RecoveryStatus::InvalidHash);
    }

    #[tokio::test]
    async fn manual_recovery_accepts_valid_hash_and_chains_next_record() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(2024, 12, 25)));
        let e = engine(&dir, clock).await;

        let hash = "A".repeat(64);
        let result = e.recover_manual("B12345678", &hash).await.unwrap();
        assert_eq!(result.status, RecoveryStatus::Success);

        let record = e.create_record(snapshot("F2024-099"), RecordType::Registration, "system").await.unwrap();
        assert_eq!(record.previous_hash, hash);
        assert!(!record.is_first_record);
    }

    #[tokio::test]
    async fn chain_status_treats_unreachable_authority_as_synced() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(2024, 12, 25)));
        let e = engine(&dir, clock).await;
        e.create_record(snapshot("F2024-001"), RecordType::Registration, "system").await.unwrap();

        let report = e.chain_status("B12345678", 2024).await.unwrap();
        assert!(report.is_synced);
    }

    #[tokio::test]
    async fn run_forever_drains_queue_then_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(at(2024, 12, 25)));
        let e = engine(&dir, clock).await;
        e.transport.set_transport_failure(verifactu_transmission::TransportErrorKind::Connection);
        e.create_record(snapshot("F2024-001"), RecordType::Registration, "system").await.unwrap();
        assert_eq!(e.contingency_status().await.queue_size, 1);

        e.transport.set_success();
        let (cancel, handle) = e.run_forever(std::time::Duration::from_millis(5));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.unwrap().unwrap();

        assert_eq!(e.contingency_status().await.queue_size, 0);
    }
}
