// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use verifactu_core::{Record, RecordStatus, RecordType, VerifactuError};

/// Filter parameters for [`ChainStore::query`]. `None` means "no
/// restriction" on that dimension.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Restrict to this issuer.
    pub issuer_nif: Option<String>,
    /// Restrict to this lifecycle status.
    pub status: Option<RecordStatus>,
    /// Restrict to records generated at or after this instant.
    pub since: Option<DateTime<FixedOffset>>,
    /// Skip this many matches (applied after ordering).
    pub offset: usize,
    /// Return at most this many matches.
    pub limit: Option<usize>,
}

/// A restricted patch of transmission-side fields — the only fields
/// [`ChainStore::update_transmission`] is permitted to touch (spec §3
/// invariant 4: identity/amount/hash/timestamp fields become immutable once
/// `status` reaches `Accepted`/`Rejected`).
#[derive(Debug, Clone, Default)]
pub struct TransmissionPatch {
    /// New lifecycle status, if changing.
    pub status: Option<RecordStatus>,
    /// New transmission timestamp, if changing.
    pub transmission_timestamp: Option<DateTime<FixedOffset>>,
    /// New retry count, if changing.
    pub retry_count: Option<u32>,
    /// New next-retry instant, if changing (use `Some(None)` to clear).
    pub next_retry_at: Option<Option<DateTime<FixedOffset>>>,
    /// New authority response code, if changing.
    pub authority_code: Option<Option<String>>,
    /// New authority response message, if changing.
    pub authority_message: Option<Option<String>>,
    /// New authority CSV, if changing.
    pub authority_csv: Option<Option<String>>,
}

/// Persistent, append-oriented log of records plus read indices (spec
/// §4.B). Deletion is unsupported; the operation does not exist here.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// The record with the highest `sequence_number` for `issuer`, if any.
    async fn head(&self, issuer: &str) -> Result<Option<Record>, VerifactuError>;

    /// Append a new record.
    ///
    /// # Errors
    ///
    /// Returns [`VerifactuError::DuplicateRecord`] if `(issuer_nif,
    /// invoice_number, invoice_date, record_type)` already exists,
    /// [`VerifactuError::ChainGap`] if the sequence is non-contiguous, or
    /// [`VerifactuError::BadLinkage`] if `previous_hash` does not match the
    /// current head's `record_hash`.
    async fn append(&self, record: Record) -> Result<(), VerifactuError>;

    /// Query records matching `filter`, ordered by sequence number
    /// descending unless the filter says otherwise.
    async fn query(&self, filter: &QueryFilter) -> Result<Vec<Record>, VerifactuError>;

    /// Apply a transmission-side patch to the record at `(issuer,
    /// sequence_number)`.
    ///
    /// # Errors
    ///
    /// Returns [`VerifactuError::InternalError`] if no such record exists.
    async fn update_transmission(
        &self,
        issuer: &str,
        sequence_number: u64,
        patch: TransmissionPatch,
    ) -> Result<Record, VerifactuError>;

    /// Whether `issuer`'s chain currently holds no records (spec §4.D
    /// module-deactivation precondition).
    async fn is_empty(&self, issuer: &str) -> Result<bool, VerifactuError>;
}

struct IssuerChain {
    records: Vec<Record>,
}

impl IssuerChain {
    fn identity_exists(&self, candidate: &Record) -> bool {
        self.records.iter().any(|r| r.identity() == candidate.identity())
    }
}

/// A [`ChainStore`] backed by one newline-delimited JSON file per issuer,
/// with an in-memory index mirrored alongside — the same split
/// `abp-daemon::AppState` draws between its `receipts: Arc<RwLock<HashMap<..>>>`
/// index and durable writes under `receipts_dir`.
pub struct FileChainStore {
    root: PathBuf,
    issuers: RwLock<HashMap<String, IssuerChain>>,
    issuer_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileChainStore {
    /// Open (creating if absent) a chain store rooted at `root`, one file
    /// per issuer named `{issuer_nif}.ndjson`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, VerifactuError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| VerifactuError::IoError(e.to_string()))?;

        let mut issuers = HashMap::new();
        let mut dir = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| VerifactuError::IoError(e.to_string()))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| VerifactuError::IoError(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ndjson") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| VerifactuError::IoError(e.to_string()))?;
            let mut records = Vec::new();
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let record: Record = serde_json::from_str(line)
                    .map_err(|e| VerifactuError::SerializationError(e.to_string()))?;
                records.push(record);
            }
            records.sort_by_key(|r| r.sequence_number);
            issuers.insert(stem.to_string(), IssuerChain { records });
        }

        Ok(Self {
            root,
            issuers: RwLock::new(issuers),
            issuer_locks: RwLock::new(HashMap::new()),
        })
    }

    fn issuer_path(&self, issuer: &str) -> PathBuf {
        self.root.join(format!("{issuer}.ndjson"))
    }

    async fn lock_for(&self, issuer: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.issuer_locks.read().await.get(issuer) {
            return lock.clone();
        }
        let mut locks = self.issuer_locks.write().await;
        locks
            .entry(issuer.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn rewrite_issuer_file(&self, issuer: &str, records: &[Record]) -> Result<(), VerifactuError> {
        let mut buf = String::new();
        for record in records {
            buf.push_str(
                &serde_json::to_string(record)
                    .map_err(|e| VerifactuError::SerializationError(e.to_string()))?,
            );
            buf.push('\n');
        }
        tokio::fs::write(self.issuer_path(issuer), buf)
            .await
            .map_err(|e| VerifactuError::IoError(e.to_string()))
    }
}

#[async_trait]
impl ChainStore for FileChainStore {
    async fn head(&self, issuer: &str) -> Result<Option<Record>, VerifactuError> {
        Ok(self
            .issuers
            .read()
            .await
            .get(issuer)
            .and_then(|chain| chain.records.last().cloned()))
    }

    async fn append(&self, record: Record) -> Result<(), VerifactuError> {
        let issuer = record.issuer_nif.clone();
        let guard = self.lock_for(&issuer).await;
        let _permit = guard.lock().await;

        let mut issuers = self.issuers.write().await;
        let chain = issuers.entry(issuer.clone()).or_insert_with(|| IssuerChain {
            records: Vec::new(),
        });

        if chain.identity_exists(&record) {
            return Err(VerifactuError::DuplicateRecord(format!(
                "{}/{}",
                record.issuer_nif, record.invoice_number
            )));
        }

        let expected_sequence = chain.records.last().map_or(1, |r| r.sequence_number + 1);
        if record.sequence_number != expected_sequence {
            return Err(VerifactuError::ChainGap {
                expected: expected_sequence,
                actual: record.sequence_number,
            });
        }

        let expected_previous = chain
            .records
            .last()
            .map(|r| r.record_hash.as_str())
            .unwrap_or("");
        if !verifactu_canon::linkage_ok(expected_previous, &record) {
            return Err(VerifactuError::BadLinkage(record.sequence_number));
        }

        chain.records.push(record);
        self.rewrite_issuer_file(&issuer, &chain.records).await?;
        info!(issuer = %issuer, "record appended to chain");
        Ok(())
    }

    async fn query(&self, filter: &QueryFilter) -> Result<Vec<Record>, VerifactuError> {
        let issuers = self.issuers.read().await;
        let mut matched: Vec<Record> = issuers
            .values()
            .flat_map(|chain| chain.records.iter().cloned())
            .filter(|r| {
                filter
                    .issuer_nif
                    .as_deref()
                    .map_or(true, |nif| r.issuer_nif == nif)
                    && filter.status.map_or(true, |s| r.status == s)
                    && filter.since.map_or(true, |since| r.generation_timestamp >= since)
            })
            .collect();
        matched.sort_by(|a, b| b.sequence_number.cmp(&a.sequence_number));

        let matched = matched.into_iter().skip(filter.offset);
        Ok(match filter.limit {
            Some(limit) => matched.take(limit).collect(),
            None => matched.collect(),
        })
    }

    async fn update_transmission(
        &self,
        issuer: &str,
        sequence_number: u64,
        patch: TransmissionPatch,
    ) -> Result<Record, VerifactuError> {
        let guard = self.lock_for(issuer).await;
        let _permit = guard.lock().await;

        let mut issuers = self.issuers.write().await;
        let chain = issuers
            .get_mut(issuer)
            .ok_or_else(|| VerifactuError::InternalError(format!("unknown issuer {issuer}")))?;

        let record = chain
            .records
            .iter_mut()
            .find(|r| r.sequence_number == sequence_number)
            .ok_or_else(|| {
                VerifactuError::InternalError(format!("no record {issuer}/{sequence_number}"))
            })?;

        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(ts) = patch.transmission_timestamp {
            record.transmission_timestamp = Some(ts);
        }
        if let Some(count) = patch.retry_count {
            record.retry_count = count;
        }
        if let Some(next) = patch.next_retry_at {
            record.next_retry_at = next;
        }
        if let Some(code) = patch.authority_code {
            record.authority_code = code;
        }
        if let Some(msg) = patch.authority_message {
            record.authority_message = msg;
        }
        if let Some(csv) = patch.authority_csv {
            record.authority_csv = csv;
        }

        let updated = record.clone();
        self.rewrite_issuer_file(issuer, &chain.records).await?;
        Ok(updated)
    }

    async fn is_empty(&self, issuer: &str) -> Result<bool, VerifactuError> {
        Ok(self
            .issuers
            .read()
            .await
            .get(issuer)
            .map_or(true, |chain| chain.records.is_empty()))
    }
}

/// Convenience helper for recovery/record-builder callers that need the
/// identity-uniqueness check (spec §3 invariant 3) without a full
/// `ChainStore::append` round trip.
#[must_use]
pub fn identity_conflicts(existing: &[Record], nif: &str, number: &str, date: NaiveDate, kind: RecordType) -> bool {
    existing
        .iter()
        .any(|r| r.issuer_nif == nif && r.invoice_number == number && r.invoice_date == date && r.record_type == kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use verifactu_core::InvoiceType;

    fn make_record(seq: u64, prev: &str, issuer: &str, number: &str) -> Record {
        let ts = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 12, 25, 10, 30, 0)
            .unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 12, 25).unwrap();
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

    #[tokio::test]
    async fn append_then_head_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChainStore::open(dir.path()).await.unwrap();
        let r = make_record(1, "", "B12345678", "F2024-001");
        store.append(r.clone()).await.unwrap();
        let head = store.head("B12345678").await.unwrap().unwrap();
        assert_eq!(head.sequence_number, 1);
    }

    #[tokio::test]
    async fn duplicate_identity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChainStore::open(dir.path()).await.unwrap();
        let r = make_record(1, "", "B12345678", "F2024-001");
        store.append(r.clone()).await.unwrap();
        let dup = make_record(2, &r.record_hash, "B12345678", "F2024-001");
        let err = store.append(dup).await.unwrap_err();
        assert!(matches!(err, VerifactuError::DuplicateRecord(_)));
    }

    #[tokio::test]
    async fn non_contiguous_sequence_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChainStore::open(dir.path()).await.unwrap();
        let r1 = make_record(1, "", "B12345678", "F2024-001");
        store.append(r1.clone()).await.unwrap();
        let gap = make_record(3, &r1.record_hash, "B12345678", "F2024-002");
        let err = store.append(gap).await.unwrap_err();
        assert!(matches!(err, VerifactuError::ChainGap { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn bad_linkage_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChainStore::open(dir.path()).await.unwrap();
        let r1 = make_record(1, "", "B12345678", "F2024-001");
        store.append(r1.clone()).await.unwrap();
        let bad = make_record(2, "WRONGHASH", "B12345678", "F2024-002");
        let err = store.append(bad).await.unwrap_err();
        assert!(matches!(err, VerifactuError::BadLinkage(2)));
    }

    #[tokio::test]
    async fn reopen_replays_records_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileChainStore::open(dir.path()).await.unwrap();
            store.append(make_record(1, "", "B12345678", "F2024-001")).await.unwrap();
        }
        let reopened = FileChainStore::open(dir.path()).await.unwrap();
        assert!(reopened.head("B12345678").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_transmission_restricted_to_patch_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChainStore::open(dir.path()).await.unwrap();
        let r = make_record(1, "", "B12345678", "F2024-001");
        let original_hash = r.record_hash.clone();
        store.append(r).await.unwrap();

        let patch = TransmissionPatch {
            status: Some(RecordStatus::Accepted),
            authority_csv: Some(Some("CSV123".to_string())),
            ..Default::default()
        };
        let updated = store.update_transmission("B12345678", 1, patch).await.unwrap();
        assert_eq!(updated.status, RecordStatus::Accepted);
        assert_eq!(updated.authority_csv.as_deref(), Some("CSV123"));
        assert_eq!(updated.record_hash, original_hash);
    }

    #[tokio::test]
    async fn is_empty_true_for_unknown_issuer() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChainStore::open(dir.path()).await.unwrap();
        assert!(store.is_empty("NOPE").await.unwrap());
    }

    #[tokio::test]
    async fn query_orders_by_sequence_descending() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChainStore::open(dir.path()).await.unwrap();
        let r1 = make_record(1, "", "B12345678", "F2024-001");
        let h1 = r1.record_hash.clone();
        store.append(r1).await.unwrap();
        store.append(make_record(2, &h1, "B12345678", "F2024-002")).await.unwrap();

        let results = store.query(&QueryFilter::default()).await.unwrap();
        assert_eq!(results[0].sequence_number, 2);
        assert_eq!(results[1].sequence_number, 1);
    }
}
