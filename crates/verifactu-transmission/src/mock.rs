// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic test double, grounded on
//! `abp_backend_mock::MockBackend` and
//! `original_source/services/aeat_client.py::MockAEATClient`.

use crate::{QueryOutcome, QueryRecord, TransmissionClient, TransmissionOutcome, TransportErrorKind};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use verifactu_core::Record;

/// What [`MockClient`] should do on its next call.
#[derive(Debug, Clone)]
enum Behavior {
    Accept,
    Reject { code: String, message: String },
    Transport(TransportErrorKind),
}

struct MockState {
    behavior: Behavior,
    submitted: Vec<Record>,
    query_response: Option<Vec<QueryRecord>>,
}

/// A configurable stand-in for [`crate::RealClient`], used by every test
/// in this workspace that does not specifically target envelope
/// construction or response parsing. Defaults to accepting everything.
pub struct MockClient {
    state: Mutex<MockState>,
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClient {
    /// A mock client that accepts every submission.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                behavior: Behavior::Accept,
                submitted: Vec::new(),
                query_response: None,
            }),
        }
    }

    /// Configure the client to logically reject every subsequent
    /// submission with `code`/`message`.
    pub fn set_rejection(&self, code: impl Into<String>, message: impl Into<String>) {
        self.state.lock().unwrap().behavior = Behavior::Reject {
            code: code.into(),
            message: message.into(),
        };
    }

    /// Configure the client to return a transport-level failure of `kind`
    /// for every subsequent call.
    pub fn set_transport_failure(&self, kind: TransportErrorKind) {
        self.state.lock().unwrap().behavior = Behavior::Transport(kind);
    }

    /// Reset to the default accept-everything behavior.
    pub fn set_success(&self) {
        self.state.lock().unwrap().behavior = Behavior::Accept;
    }

    /// Pin the response `query_records` will return, overriding the
    /// default of echoing `submitted` records.
    pub fn set_query_response(&self, records: Vec<QueryRecord>) {
        self.state.lock().unwrap().query_response = Some(records);
    }

    /// All records submitted so far via `submit_registration` or
    /// `submit_cancellation`.
    #[must_use]
    pub fn submitted(&self) -> Vec<Record> {
        self.state.lock().unwrap().submitted.clone()
    }

    fn mock_csv(record: &Record) -> String {
        let mut hasher = Sha256::new();
        hasher.update(record.record_hash.as_bytes());
        format!("{:X}", hasher.finalize())[..16].to_string()
    }

    fn outcome_for(&self, record: &Record) -> TransmissionOutcome {
        let mut state = self.state.lock().unwrap();
        state.submitted.push(record.clone());
        match state.behavior.clone() {
            Behavior::Accept => TransmissionOutcome::Success {
                code: "OK".to_string(),
                message: "Record accepted (mock)".to_string(),
                csv: Self::mock_csv(record),
            },
            Behavior::Reject { code, message } => TransmissionOutcome::Rejected { code, message },
            Behavior::Transport(kind) => TransmissionOutcome::TransportError(kind),
        }
    }
}

#[async_trait]
impl TransmissionClient for MockClient {
    async fn submit_registration(&self, record: &Record) -> TransmissionOutcome {
        self.outcome_for(record)
    }

    async fn submit_cancellation(&self, record: &Record) -> TransmissionOutcome {
        self.outcome_for(record)
    }

    async fn query_records(&self, issuer: &str, _year: i32, limit: usize) -> QueryOutcome {
        let state = self.state.lock().unwrap();
        if let Behavior::Transport(kind) = state.behavior {
            return QueryOutcome::TransportError(kind);
        }
        if let Some(pinned) = &state.query_response {
            let mut records = pinned.clone();
            records.truncate(limit);
            return QueryOutcome::Success(records);
        }
        let mut records: Vec<QueryRecord> = state
            .submitted
            .iter()
            .rev()
            .filter(|r| r.issuer_nif == issuer)
            .take(limit)
            .map(|r| QueryRecord {
                invoice_number: r.invoice_number.clone(),
                invoice_date: r.invoice_date,
                record_type: r.record_type,
                record_hash: r.record_hash.clone(),
                issuer_nif: r.issuer_nif.clone(),
                total_amount: Some(r.total_amount),
                csv: r.authority_csv.clone(),
            })
            .collect();
        records.sort_by(|a, b| b.invoice_date.cmp(&a.invoice_date));
        QueryOutcome::Success(records)
    }

    async fn probe_connection(&self) -> Result<(), TransportErrorKind> {
        let state = self.state.lock().unwrap();
        match state.behavior {
            Behavior::Transport(kind) => Err(kind),
            _ => Ok(()),
        }
    }
}
