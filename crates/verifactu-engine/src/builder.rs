// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Record Builder (spec §4.C), grounded on
//! `original_source/services/hash_service.py`'s `HashService` (sequence
//! resolution, hash computation) fused with the append/event/lock steps
//! that Django's model `save()` signal performed implicitly there.

use crate::clock::Clock;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use verifactu_config::LockKeeper;
use verifactu_core::money::round_money;
use verifactu_core::{InvoiceSnapshot, Record, RecordStatus, RecordType, VerifactuError};
use verifactu_events::{Event, EventLog, EventType, Severity};
use verifactu_recovery::RecoveryPointerStore;
use verifactu_store::ChainStore;

/// Who or what triggered a build, recorded for audit purposes only.
pub type Actor<'a> = &'a str;

fn validate(snapshot: &InvoiceSnapshot) -> Result<(), VerifactuError> {
    if snapshot.issuer_nif.trim().is_empty() {
        return Err(VerifactuError::InvalidNif("issuer NIF is empty".to_string()));
    }
    if snapshot.invoice_number.trim().is_empty() {
        return Err(VerifactuError::MissingField("invoice_number".to_string()));
    }
    if snapshot.base_amount.is_sign_negative()
        || snapshot.tax_amount.is_sign_negative()
        || snapshot.total_amount.is_sign_negative()
    {
        return Err(VerifactuError::InvalidAmount(
            "amounts must not be negative".to_string(),
        ));
    }
    let base = round_money(snapshot.base_amount);
    let tax = round_money(snapshot.tax_amount);
    let total = round_money(snapshot.total_amount);
    if (base + tax - total).abs() > Decimal::new(1, 2) {
        return Err(VerifactuError::InvalidAmount(format!(
            "base {base} + tax {tax} does not round-trip to total {total}"
        )));
    }
    Ok(())
}

/// Builds and appends records for one issuer, enforcing spec §4.C's
/// nine-step algorithm. Generic over the three collaborators it needs so
/// tests can run against tempdir-backed stores and an in-memory lock
/// keeper.
pub struct RecordBuilder<S, P, L>
where
    S: ChainStore,
    P: RecoveryPointerStore,
    L: EventLog,
{
    store: Arc<S>,
    pointers: Arc<P>,
    events: Arc<L>,
    lock: Arc<LockKeeper>,
    clock: Arc<dyn Clock>,
    issuer_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<S, P, L> RecordBuilder<S, P, L>
where
    S: ChainStore,
    P: RecoveryPointerStore,
    L: EventLog,
{
    /// Build a `RecordBuilder` over the given collaborators.
    pub fn new(store: Arc<S>, pointers: Arc<P>, events: Arc<L>, lock: Arc<LockKeeper>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            pointers,
            events,
            lock,
            clock,
            issuer_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, issuer: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.issuer_locks.lock().await;
        locks
            .entry(issuer.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Build and append a record from `snapshot` (spec §4.C).
    ///
    /// # Errors
    ///
    /// Returns [`VerifactuError::InvalidNif`] / [`VerifactuError::InvalidAmount`] /
    /// [`VerifactuError::MissingField`] on ingress validation failure, or
    /// whatever [`ChainStore::append`] rejects the record with
    /// (`DuplicateRecord`, `ChainGap`, `BadLinkage`).
    pub async fn build_and_append(
        &self,
        snapshot: InvoiceSnapshot,
        record_type: RecordType,
        actor: Actor<'_>,
    ) -> Result<Record, VerifactuError> {
        validate(&snapshot)?;

        let issuer_lock = self.lock_for(&snapshot.issuer_nif).await;
        let _guard = issuer_lock.lock().await;

        // Step 1: resolve previous hash from the chain head, else the
        // recovery pointer, else "" for a genuinely first record.
        let head = self.store.head(&snapshot.issuer_nif).await?;
        let previous_hash = match &head {
            Some(record) => record.record_hash.clone(),
            None => match self.pointers.get(&snapshot.issuer_nif).await? {
                Some(pointer) => pointer.hash,
                None => String::new(),
            },
        };

        // Step 2: resolve sequence.
        let sequence_number = head.as_ref().map_or(1, |r| r.sequence_number + 1);

        // Step 3: snapshot + round.
        let base_amount = round_money(snapshot.base_amount);
        let tax_amount = round_money(snapshot.tax_amount);
        let total_amount = round_money(snapshot.total_amount);

        // Step 4: generation timestamp from the clock abstraction.
        let generation_timestamp = self.clock.now();

        let is_first_record = previous_hash.is_empty();

        let mut record = Record {
            sequence_number,
            record_type,
            invoice_type: snapshot.invoice_type,
            issuer_nif: snapshot.issuer_nif.clone(),
            issuer_name: snapshot.issuer_name.clone(),
            invoice_number: snapshot.invoice_number.clone(),
            invoice_date: snapshot.invoice_date,
            base_amount,
            tax_rate: snapshot.tax_rate,
            tax_amount,
            total_amount,
            previous_hash,
            record_hash: String::new(),
            is_first_record,
            generation_timestamp,
            status: RecordStatus::Pending,
            transmission_timestamp: None,
            retry_count: 0,
            next_retry_at: None,
            authority_code: None,
            authority_message: None,
            authority_csv: None,
            qr_url: verifactu_core::qr::build_qr_url(
                &snapshot.issuer_nif,
                &snapshot.invoice_number,
                snapshot.invoice_date,
                total_amount,
            ),
            xml_content: None,
        };

        // Step 5: compute hash via the Canonicalizer.
        record.record_hash = verifactu_canon::compute_record_hash(&record);

        let was_first_ever_append = self.store.is_empty(&snapshot.issuer_nif).await?;

        // Step 7: persist. Any linkage/uniqueness failure is fatal; no
        // partial state is left since the pointer/lock below only run on
        // success.
        self.store.append(record.clone()).await?;

        // Step 8: lock configuration atomically with the first successful
        // append ever made under it. The record above is already durably
        // committed, so a failure persisting the lock state must not turn
        // into an Err here — the caller would see the create as failed and
        // retry, and the retry would hit DuplicateRecord against the record
        // that in fact succeeded. Best-effort instead, logged loudly.
        if was_first_ever_append {
            if let Err(e) = self.lock.activate_module(record.invoice_date).await {
                warn!(issuer = %record.issuer_nif, error = %e, "failed to persist module activation after first append");
            }
            if let Err(e) = self.lock.lock_mode(actor, generation_timestamp).await {
                warn!(issuer = %record.issuer_nif, error = %e, "failed to persist mode lock after first append");
            }
        }

        // A consumed recovery pointer becomes informational once the
        // store's own head takes over (spec §4.I) — cleared here so a
        // stale pointer can't shadow a future chain gap.
        if is_first_record {
            self.pointers.clear(&snapshot.issuer_nif).await.ok();
        }

        // Step 9: emit event and return.
        info!(
            issuer = %record.issuer_nif,
            sequence = record.sequence_number,
            hash = %record.record_hash,
            "record created"
        );
        let mut details = std::collections::BTreeMap::new();
        details.insert("issuer_nif".to_string(), record.issuer_nif.clone());
        details.insert("invoice_number".to_string(), record.invoice_number.clone());
        let _ = self
            .events
            .log(Event {
                event_type: EventType::RecordCreated,
                severity: Severity::Info,
                message: format!("record {} created for {}", record.invoice_number, record.issuer_nif),
                details,
                record_sequence: Some(record.sequence_number),
                timestamp: generation_timestamp,
            })
            .await;

        Ok(record)
    }
}
