// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod mock;
mod real;
mod soap;

pub use mock::MockClient;
pub use real::RealClient;
pub use soap::{build_alta_envelope, build_anulacion_envelope, build_consulta_envelope, SoftwareIdentity};

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use verifactu_core::{Environment, Record, RecordType};

/// Production AEAT SOAP endpoint (spec §6).
pub const PRODUCTION_ENDPOINT: &str =
    "https://www2.agenciatributaria.gob.es/wlpl/TIKE-CONT/ws/SusuFactFSSWS/SistemaFacturacion";

/// Testing (pre-production) AEAT SOAP endpoint (spec §6).
pub const TESTING_ENDPOINT: &str = "https://prewww2.aeat.es/wlpl/TIKE-CONT/ws/SusuFactFSSWS/SistemaFacturacion";

/// Selects the endpoint for a deployment [`Environment`].
#[must_use]
pub fn endpoint_for(environment: Environment) -> &'static str {
    match environment {
        Environment::Production => PRODUCTION_ENDPOINT,
        Environment::Testing => TESTING_ENDPOINT,
    }
}

/// SOAPAction header value for a registration submission.
pub const SOAP_ACTION_ALTA: &str = "\"SuministroFacturas\"";
/// SOAPAction header value for a cancellation submission.
pub const SOAP_ACTION_ANULACION: &str = "\"AnulacionFacturas\"";
/// SOAPAction header value for a query.
pub const SOAP_ACTION_CONSULTA: &str = "\"ConsultaFacturas\"";

/// Connect timeout, matching `original_source/services/aeat_client.py`'s
/// `CONNECT_TIMEOUT`.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;
/// Read timeout; AEAT can be slow to respond.
pub const READ_TIMEOUT_SECS: u64 = 120;

/// Transport-level failure kinds the client can surface (spec §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The request timed out.
    Timeout,
    /// A connection could not be established or was dropped.
    Connection,
    /// The TLS handshake or certificate verification failed.
    Tls,
    /// The response body could not be parsed.
    Parse,
}

/// Outcome of a single submission (spec §4.F).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmissionOutcome {
    /// `EstadoEnvio == "Correcto"`.
    Success {
        /// Authority response code.
        code: String,
        /// Authority response message.
        message: String,
        /// Código Seguro de Verificación.
        csv: String,
    },
    /// A recognized logical rejection.
    Rejected {
        /// Authority response code.
        code: String,
        /// Authority response message.
        message: String,
    },
    /// A transport-level failure.
    TransportError(TransportErrorKind),
}

/// One row of a query response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    /// Invoice series/number.
    pub invoice_number: String,
    /// Invoice issue date.
    pub invoice_date: NaiveDate,
    /// Registration or cancellation.
    pub record_type: RecordType,
    /// Fingerprint of this record as known to the authority.
    pub record_hash: String,
    /// Issuer NIF.
    pub issuer_nif: String,
    /// Total invoice amount, if reported.
    pub total_amount: Option<Decimal>,
    /// Código Seguro de Verificación, if reported.
    pub csv: Option<String>,
}

/// Outcome of a query against the authority's record list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Records, descending by `invoice_date`.
    Success(Vec<QueryRecord>),
    /// A transport-level failure.
    TransportError(TransportErrorKind),
}

/// The kind of submission being made — selects the canonical form and the
/// SOAP body shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    /// `RegistroAlta`.
    Registration,
    /// `RegistroAnulacion`.
    Cancellation,
}

/// Wire adapter to the tax authority: submit, query, parse responses (spec
/// §4.F). `RealClient` and `MockClient` both satisfy this one contract, the
/// same Real/Mock split `abp_backend_core::Backend` draws for agent
/// backends.
#[async_trait]
pub trait TransmissionClient: Send + Sync {
    /// Submit a registration record.
    async fn submit_registration(&self, record: &Record) -> TransmissionOutcome;

    /// Submit a cancellation record.
    async fn submit_cancellation(&self, record: &Record) -> TransmissionOutcome;

    /// Query previously submitted records for `issuer` in `year`, most
    /// recent first, capped at `limit`.
    async fn query_records(&self, issuer: &str, year: i32, limit: usize) -> QueryOutcome;

    /// A lightweight reachability check.
    async fn probe_connection(&self) -> Result<(), TransportErrorKind>;

    /// Convenience over `query_records(issuer, year, limit=1)`: the
    /// authority's most recently registered hash for `issuer`, if any.
    async fn last_hash(&self, issuer: &str, year: i32) -> Option<String> {
        match self.query_records(issuer, year, 1).await {
            QueryOutcome::Success(records) => records.into_iter().next().map(|r| r.record_hash),
            QueryOutcome::TransportError(_) => None,
        }
    }
}
