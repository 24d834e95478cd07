// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Shared domain types for the VERI*FACTU record engine.
//!
//! This crate holds the data model (`Record` and its enums), the narrow
//! invoice adapter seam, and the crate-wide error taxonomy. It performs no
//! I/O and has no notion of persistence, transmission, or concurrency —
//! those live in the sibling crates that depend on this one.

/// Invoice-to-record adapter seam.
pub mod adapter;
/// Comprehensive error catalog for the record engine.
pub mod error;
/// Money helpers (two-decimal, half-up rounding).
pub mod money;
/// QR verification URL construction.
pub mod qr;

pub use error::{ErrorCode, VerifactuError};
pub use money::round_money;

use chrono::{DateTime, FixedOffset, NaiveDate};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Current record-engine contract version, embedded in events and software
/// identification blocks sent to the tax authority.
pub const CONTRACT_VERSION: &str = "verifactu/v1";

/// Whether a record registers a new invoice or cancels a previously
/// registered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    /// `RegistroAlta` — registration of a new invoice.
    Registration,
    /// `RegistroAnulacion` — cancellation of a previously registered invoice.
    Cancellation,
}

/// AEAT invoice type code (`TipoFactura`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[allow(missing_docs)]
pub enum InvoiceType {
    F1,
    F2,
    F3,
    R1,
    R2,
    R3,
    R4,
    R5,
}

impl InvoiceType {
    /// The literal AEAT code for this invoice type, as used in the
    /// `TipoFactura` field and the canonical hash input.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::F1 => "F1",
            Self::F2 => "F2",
            Self::F3 => "F3",
            Self::R1 => "R1",
            Self::R2 => "R2",
            Self::R3 => "R3",
            Self::R4 => "R4",
            Self::R5 => "R5",
        }
    }
}

/// Lifecycle status of a record on the transmission side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Built and persisted, not yet submitted.
    Pending,
    /// Submitted to the tax authority, awaiting acknowledgement.
    Transmitted,
    /// Acknowledged as `Correcto` by the tax authority.
    Accepted,
    /// Logically rejected by the tax authority; not retried automatically.
    Rejected,
    /// A non-retryable local error occurred.
    Error,
    /// Queued for another transport-level retry attempt.
    Retry,
}

/// Operating mode of the engine (spec §3, Configuration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Real-time transmission to the tax authority.
    Verifactu,
    /// Local retention under inspection obligation, no automatic transmission.
    NoVerifactu,
}

/// Deployment environment, selecting the AEAT endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// The live AEAT production endpoint.
    Production,
    /// The AEAT pre-production (testing) endpoint.
    Testing,
}

/// The central tamper-evident entity: one entry in an issuer's hash chain.
///
/// See spec §3 for the full invariant list; this type itself only carries
/// data — invariants are enforced by `verifactu-canon` (hash/linkage) and
/// `verifactu-store` (uniqueness, monotonicity, append-only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Record {
    /// Strictly monotonically increasing, unique per issuer.
    pub sequence_number: u64,
    /// Registration or cancellation.
    pub record_type: RecordType,
    /// AEAT invoice type code.
    pub invoice_type: InvoiceType,
    /// NIF of the issuer, snapshotted at creation.
    pub issuer_nif: String,
    /// Registered name of the issuer, snapshotted at creation.
    pub issuer_name: String,
    /// Invoice series/number, snapshotted at creation.
    pub invoice_number: String,
    /// Invoice issue date, snapshotted at creation.
    pub invoice_date: NaiveDate,
    /// Taxable base amount (`BaseImponible`).
    #[schemars(with = "String")]
    pub base_amount: Decimal,
    /// Applicable tax rate as a percentage, e.g. `21.00`.
    #[schemars(with = "String")]
    pub tax_rate: Decimal,
    /// Total tax amount (`CuotaTotal`).
    #[schemars(with = "String")]
    pub tax_amount: Decimal,
    /// Total invoice amount (`ImporteTotal`).
    #[schemars(with = "String")]
    pub total_amount: Decimal,
    /// Hash of the previous record in this issuer's chain; empty iff
    /// `is_first_record`.
    pub previous_hash: String,
    /// SHA-256 hex-uppercase fingerprint of this record's canonical form.
    pub record_hash: String,
    /// True iff `previous_hash` is empty.
    pub is_first_record: bool,
    /// Instant (with UTC offset) this record was generated.
    pub generation_timestamp: DateTime<FixedOffset>,
    /// Transmission-side lifecycle status.
    pub status: RecordStatus,
    /// Instant of the most recent transmission attempt, if any.
    pub transmission_timestamp: Option<DateTime<FixedOffset>>,
    /// Number of transmission attempts made so far.
    pub retry_count: u32,
    /// Earliest instant the next retry attempt may run.
    pub next_retry_at: Option<DateTime<FixedOffset>>,
    /// Response code from the tax authority, if any.
    pub authority_code: Option<String>,
    /// Response message from the tax authority, if any.
    pub authority_message: Option<String>,
    /// Código Seguro de Verificación, issued on successful reception.
    pub authority_csv: Option<String>,
    /// Deterministic QR verification URL for this record's invoice.
    pub qr_url: String,
    /// Cached rendered wire payload, if one has been generated.
    pub xml_content: Option<String>,
}

impl Record {
    /// Identity tuple used for uniqueness and idempotent-retry keying
    /// (spec §3 invariant 3, spec §5 concurrency model).
    #[must_use]
    pub fn identity(&self) -> (&str, &str, NaiveDate, RecordType) {
        (
            self.issuer_nif.as_str(),
            self.invoice_number.as_str(),
            self.invoice_date,
            self.record_type,
        )
    }
}

/// A fully-typed snapshot of the fields the Record Builder needs from an
/// external invoice/sale event.
///
/// This is the narrow seam `InvoiceSource::snapshot` returns, replacing a
/// duck-typed invoice object with one concrete, owned struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InvoiceSnapshot {
    /// NIF of the issuer.
    pub issuer_nif: String,
    /// Registered name of the issuer.
    pub issuer_name: String,
    /// Invoice series/number.
    pub invoice_number: String,
    /// Invoice issue date.
    pub invoice_date: NaiveDate,
    /// AEAT invoice type code.
    pub invoice_type: InvoiceType,
    /// Taxable base amount, unrounded.
    #[schemars(with = "String")]
    pub base_amount: Decimal,
    /// Applicable tax rate as a percentage.
    #[schemars(with = "String")]
    pub tax_rate: Decimal,
    /// Total tax amount, unrounded.
    #[schemars(with = "String")]
    pub tax_amount: Decimal,
    /// Total invoice amount, unrounded.
    #[schemars(with = "String")]
    pub total_amount: Decimal,
}
