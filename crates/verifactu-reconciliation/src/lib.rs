// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, FixedOffset, NaiveDate};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use verifactu_core::{Record, RecordStatus};
use verifactu_events::{Event, EventLog, EventType, Severity};
use verifactu_recovery::{PointerSource, RecoveryPointer, RecoveryPointerStore};
use verifactu_store::{ChainStore, QueryFilter};
use verifactu_transmission::{QueryOutcome, QueryRecord, TransmissionClient, TransportErrorKind};

/// How many of the authority's most recent records to pull per
/// reconciliation pass, matching
/// `reconciliation_service.py::reconcile`'s `limit=10`.
const AUTHORITY_WINDOW: usize = 10;

/// Classification of a disagreement between the local chain head and the
/// authority's (spec §4.H "Conflict classes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictClass {
    /// Hashes agree; nothing to resolve.
    None,
    /// The local chain is missing records the authority already holds —
    /// the backup-restore scenario. Auto-resolvable by adopting the
    /// authority's head as a recovery pointer.
    LocalBehind,
    /// The local chain holds records the authority has not yet
    /// acknowledged — the pending-transmission scenario. Auto-resolvable
    /// by draining the retry queue.
    LocalAhead,
    /// Both sides hold records, the heads differ, and neither head is
    /// reachable from the other's history. Not auto-resolvable.
    HashMismatch,
}

/// One specific disagreement surfaced while comparing the two windows of
/// records, ported from `_find_discrepancies`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discrepancy {
    /// What kind of disagreement this is.
    pub kind: DiscrepancyKind,
    /// Invoice series/number the disagreement concerns.
    pub invoice_number: String,
    /// Invoice date the disagreement concerns.
    pub invoice_date: NaiveDate,
    /// The local record's hash, if a matching local record exists.
    pub local_hash: Option<String>,
    /// The authority record's hash, if a matching authority record exists.
    pub authority_hash: Option<String>,
}

/// Kind of a single [`Discrepancy`] (spec §4.H step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscrepancyKind {
    /// The authority has this invoice; the local chain does not.
    MissingLocal,
    /// Both sides have this invoice, but under different hashes.
    HashMismatch,
    /// The local chain has this invoice (and considers it accepted); the
    /// authority's recent window does not.
    MissingAuthority,
}

/// Outcome of [`ReconciliationService::reconcile`] or
/// [`ReconciliationService::resolve_conflict`] — a sum type, not a status
/// field plus optional payloads, so every caller must handle every case
/// (spec §9 "Exception-driven control flow ... maps to sum-typed
/// outcomes").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    /// Local and authority chains agree.
    Success {
        /// Local chain head hash, if any.
        local_last_hash: Option<String>,
        /// Authority's reported head hash, if any.
        authority_last_hash: Option<String>,
        /// Number of local records inspected.
        local_record_count: usize,
        /// Number of authority records inspected.
        authority_record_count: usize,
    },
    /// No certificate is configured; the authority cannot be queried.
    /// Produced by collaborators that gate on certificate presence before
    /// calling into this crate — this variant exists so every consumer of
    /// `ReconciliationOutcome` has one arm to handle regardless of which
    /// layer detects the missing certificate.
    NoCertificate,
    /// The authority could not be reached.
    AuthorityUnavailable {
        /// What went wrong at the transport layer.
        kind: TransportErrorKind,
    },
    /// A disagreement was found and classified as [`ConflictClass::LocalBehind`]
    /// or [`ConflictClass::LocalAhead`] — both auto-resolvable.
    MismatchDetected {
        /// Which kind of disagreement this is.
        conflict: ConflictClass,
        /// Local chain head hash, if any.
        local_last_hash: Option<String>,
        /// Authority's reported head hash, if any.
        authority_last_hash: Option<String>,
        /// Number of local records inspected.
        local_record_count: usize,
        /// Number of authority records inspected.
        authority_record_count: usize,
        /// The specific discrepancies found.
        discrepancies: Vec<Discrepancy>,
    },
    /// [`ConflictClass::HashMismatch`] was found: the chains have
    /// diverged in a way this service cannot auto-resolve. Callers must
    /// refuse new record creation for this issuer until resolved (spec
    /// §4.H).
    ManualInterventionRequired {
        /// Local chain head hash, if any.
        local_last_hash: Option<String>,
        /// Authority's reported head hash, if any.
        authority_last_hash: Option<String>,
        /// The specific discrepancies found.
        discrepancies: Vec<Discrepancy>,
    },
    /// A [`ConflictClass::LocalBehind`] conflict was resolved by adopting
    /// the authority's head as a recovery pointer.
    ChainRecovered {
        /// The authority hash the next record for this issuer will chain
        /// onto.
        authority_last_hash: String,
    },
}

/// Determines [`ConflictClass`] from the two record windows, following
/// spec §4.H's literal conditions: compare heads; if they differ, check
/// whether either head is reachable from the other side's history before
/// concluding the chains have genuinely diverged.
fn classify(local: &[Record], authority: &[QueryRecord]) -> ConflictClass {
    let local_head = local.first();
    let authority_head = authority.first();

    match (local_head, authority_head) {
        (None, None) => ConflictClass::None,
        (None, Some(_)) => ConflictClass::LocalBehind,
        (Some(_), None) => ConflictClass::LocalAhead,
        (Some(lh), Some(ah)) => {
            if lh.record_hash == ah.record_hash {
                ConflictClass::None
            } else if local.iter().any(|r| r.record_hash == ah.record_hash) {
                ConflictClass::LocalBehind
            } else if authority.iter().any(|r| r.record_hash == lh.record_hash) {
                ConflictClass::LocalAhead
            } else {
                ConflictClass::HashMismatch
            }
        }
    }
}

/// Ported from `_find_discrepancies`: for every authority record, look
/// for a matching local record by `(invoice_number, invoice_date)`; for
/// every accepted local record within the authority's window, check it
/// is represented on the authority side.
fn find_discrepancies(local: &[Record], authority: &[QueryRecord]) -> Vec<Discrepancy> {
    let mut discrepancies = Vec::new();

    for a in authority {
        match local
            .iter()
            .find(|l| l.invoice_number == a.invoice_number && l.invoice_date == a.invoice_date)
        {
            None => discrepancies.push(Discrepancy {
                kind: DiscrepancyKind::MissingLocal,
                invoice_number: a.invoice_number.clone(),
                invoice_date: a.invoice_date,
                local_hash: None,
                authority_hash: Some(a.record_hash.clone()),
            }),
            Some(l) if l.record_hash != a.record_hash => discrepancies.push(Discrepancy {
                kind: DiscrepancyKind::HashMismatch,
                invoice_number: a.invoice_number.clone(),
                invoice_date: a.invoice_date,
                local_hash: Some(l.record_hash.clone()),
                authority_hash: Some(a.record_hash.clone()),
            }),
            Some(_) => {}
        }
    }

    let authority_numbers: std::collections::HashSet<&str> =
        authority.iter().map(|a| a.invoice_number.as_str()).collect();
    for l in local.iter().filter(|l| l.status == RecordStatus::Accepted).take(authority.len()) {
        if !authority_numbers.contains(l.invoice_number.as_str()) {
            discrepancies.push(Discrepancy {
                kind: DiscrepancyKind::MissingAuthority,
                invoice_number: l.invoice_number.clone(),
                invoice_date: l.invoice_date,
                local_hash: Some(l.record_hash.clone()),
                authority_hash: None,
            });
        }
    }

    discrepancies
}

/// Compares an issuer's local chain with the authority's and, where
/// possible, resolves the disagreement (spec §4.H). Generic over the
/// store/transport/log/pointer collaborators so tests can run entirely
/// against the in-process `MockClient` and temp-directory-backed stores.
pub struct ReconciliationService<S, T, L, P>
where
    S: ChainStore,
    T: TransmissionClient,
    L: EventLog,
    P: RecoveryPointerStore,
{
    store: Arc<S>,
    transport: Arc<T>,
    events: Arc<L>,
    pointers: Arc<P>,
}

impl<S, T, L, P> ReconciliationService<S, T, L, P>
where
    S: ChainStore,
    T: TransmissionClient,
    L: EventLog,
    P: RecoveryPointerStore,
{
    /// Build a service over the given collaborators.
    pub fn new(store: Arc<S>, transport: Arc<T>, events: Arc<L>, pointers: Arc<P>) -> Self {
        Self { store, transport, events, pointers }
    }

    async fn local_window(&self, issuer: &str) -> Result<Vec<Record>, verifactu_core::VerifactuError> {
        self.store
            .query(&QueryFilter { issuer_nif: Some(issuer.to_string()), ..Default::default() })
            .await
    }

    async fn log(&self, event_type: EventType, severity: Severity, message: String, now: DateTime<FixedOffset>) {
        let _ = self
            .events
            .log(Event {
                event_type,
                severity,
                message,
                details: BTreeMap::new(),
                record_sequence: None,
                timestamp: now,
            })
            .await;
    }

    /// Compare the local chain for `issuer` against the authority's last
    /// `AUTHORITY_WINDOW` records for `year`, classify any disagreement,
    /// and record the outcome as an event. Ported from
    /// `ReconciliationService.reconcile` merged with `diagnose_conflict`
    /// (spec §4.H's algorithm already classifies the conflict inline, so
    /// the two Python methods collapse into one operation here).
    pub async fn reconcile(
        &self,
        issuer: &str,
        year: i32,
        now: DateTime<FixedOffset>,
    ) -> Result<ReconciliationOutcome, verifactu_core::VerifactuError> {
        info!(issuer, "starting reconciliation check");
        let local = self.local_window(issuer).await?;

        let authority = match self.transport.query_records(issuer, year, AUTHORITY_WINDOW).await {
            QueryOutcome::Success(records) => records,
            QueryOutcome::TransportError(kind) => {
                warn!(issuer, ?kind, "authority unavailable during reconciliation");
                return Ok(ReconciliationOutcome::AuthorityUnavailable { kind });
            }
        };

        let local_last_hash = local.first().map(|r| r.record_hash.clone());
        let authority_last_hash = authority.first().map(|r| r.record_hash.clone());
        let local_record_count = local.len();
        let authority_record_count = authority.len();

        let outcome = match classify(&local, &authority) {
            ConflictClass::None => {
                info!(issuer, "reconciliation successful - chains are synchronized");
                self.log(
                    EventType::ReconciliationRan,
                    Severity::Info,
                    format!("chain synchronized with authority for {issuer}"),
                    now,
                )
                .await;
                ReconciliationOutcome::Success {
                    local_last_hash,
                    authority_last_hash,
                    local_record_count,
                    authority_record_count,
                }
            }
            ConflictClass::HashMismatch => {
                let discrepancies = find_discrepancies(&local, &authority);
                error!(issuer, "hash mismatch between local chain and authority - manual intervention required");
                self.log(
                    EventType::ReconciliationRan,
                    Severity::Critical,
                    format!("hash mismatch for {issuer}: local and authority heads diverge with no common ancestor"),
                    now,
                )
                .await;
                ReconciliationOutcome::ManualInterventionRequired {
                    local_last_hash,
                    authority_last_hash,
                    discrepancies,
                }
            }
            conflict => {
                let discrepancies = find_discrepancies(&local, &authority);
                warn!(issuer, ?conflict, "reconciliation conflict detected");
                self.log(
                    EventType::ReconciliationRan,
                    Severity::Warning,
                    format!("conflict {conflict:?} detected for {issuer}"),
                    now,
                )
                .await;
                ReconciliationOutcome::MismatchDetected {
                    conflict,
                    local_last_hash,
                    authority_last_hash,
                    local_record_count,
                    authority_record_count,
                    discrepancies,
                }
            }
        };

        Ok(outcome)
    }

    /// Attempt to automatically resolve whatever conflict `reconcile`
    /// finds (spec §4.H "Resolve"). `LocalBehind` adopts the authority's
    /// head as a recovery pointer; `LocalAhead` is a no-op here since
    /// draining the retry queue is the contingency manager's job, not
    /// this service's — it simply confirms the pending count and leaves
    /// resolution to the next `process_queue` pass. `HashMismatch`
    /// returns the same `ManualInterventionRequired` outcome unchanged.
    pub async fn resolve_conflict(
        &self,
        issuer: &str,
        year: i32,
        now: DateTime<FixedOffset>,
    ) -> Result<ReconciliationOutcome, verifactu_core::VerifactuError> {
        let diagnosis = self.reconcile(issuer, year, now).await?;

        let ReconciliationOutcome::MismatchDetected { conflict, authority_last_hash, .. } = &diagnosis else {
            return Ok(diagnosis);
        };

        match conflict {
            ConflictClass::LocalBehind => {
                let Some(hash) = authority_last_hash.clone() else {
                    return Ok(diagnosis);
                };
                self.pointers
                    .set(
                        issuer,
                        RecoveryPointer {
                            hash: hash.clone(),
                            source: PointerSource::Reconciliation,
                            invoice_number: None,
                            set_at: now,
                        },
                    )
                    .await?;
                info!(issuer, hash = %hash, "chain recovered from authority");
                self.log(
                    EventType::RecoveryPointerSet,
                    Severity::Info,
                    format!("recovery pointer set for {issuer} from authority head"),
                    now,
                )
                .await;
                Ok(ReconciliationOutcome::ChainRecovered { authority_last_hash: hash })
            }
            ConflictClass::LocalAhead => {
                info!(issuer, "local ahead of authority - pending records will drain via the retry queue");
                Ok(diagnosis)
            }
            ConflictClass::None | ConflictClass::HashMismatch => Ok(diagnosis),
        }
    }

    /// Bulk resynchronization entry point distinct from `resolve_conflict`:
    /// pulls the authority's single most recent record and writes it as a
    /// recovery pointer unconditionally, without first diagnosing the
    /// conflict class. Ported from `sync_from_aeat` — intended for
    /// "AEAT is the source of truth, trust it outright" recovery, as
    /// opposed to `resolve_conflict`'s conflict-class-gated behavior.
    pub async fn sync_from_aeat(
        &self,
        issuer: &str,
        year: i32,
        now: DateTime<FixedOffset>,
    ) -> Result<ReconciliationOutcome, verifactu_core::VerifactuError> {
        info!(issuer, "starting sync from authority");

        match self.transport.query_records(issuer, year, 1).await {
            QueryOutcome::Success(records) => {
                let Some(last) = records.into_iter().next() else {
                    return self.reconcile(issuer, year, now).await;
                };
                self.pointers
                    .set(
                        issuer,
                        RecoveryPointer {
                            hash: last.record_hash.clone(),
                            source: PointerSource::Reconciliation,
                            invoice_number: Some(last.invoice_number.clone()),
                            set_at: now,
                        },
                    )
                    .await?;
                self.log(
                    EventType::ReconciliationRan,
                    Severity::Info,
                    format!("synced recovery pointer for {issuer} from authority"),
                    now,
                )
                .await;
                Ok(ReconciliationOutcome::ChainRecovered { authority_last_hash: last.record_hash })
            }
            QueryOutcome::TransportError(kind) => Ok(ReconciliationOutcome::AuthorityUnavailable { kind }),
        }
    }
}
