// SPDX-License-Identifier: MIT OR Apache-2.0
//! Crate-wide error taxonomy (spec §7).
//!
//! One variant per error condition the spec names, each carrying a stable
//! `VF-<category><number>` code. Categories mirror `abp_core::error`'s
//! `ABP-X###` scheme: `V` (Validation), `H` (Hash chain), `G` (Governance —
//! mode-lock and module protection), `T` (Transmission), `R`
//! (Reconciliation), `S` (System).

use thiserror::Error;

/// Stable, machine-readable error code plus human-readable message for every
/// failure mode the record engine can surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifactuError {
    // ── Validation (V) ───────────────────────────────────────────────
    /// A monetary amount failed validation (negative, non-finite, or
    /// inconsistent with `base_amount * tax_rate`).
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    /// The issuer or recipient NIF failed format validation.
    #[error("invalid NIF: {0}")]
    InvalidNif(String),
    /// A required field was missing or empty.
    #[error("missing required field: {0}")]
    MissingField(String),

    // ── Hash chain (H) ───────────────────────────────────────────────
    /// A record with the same `(issuer_nif, invoice_number, invoice_date,
    /// record_type)` identity already exists in the chain.
    #[error("duplicate record for invoice {0}")]
    DuplicateRecord(String),
    /// The requested sequence number is not the chain's next expected value.
    #[error("chain gap: expected sequence {expected}, got {actual}")]
    ChainGap {
        /// Sequence number the chain actually expects next.
        expected: u64,
        /// Sequence number that was supplied.
        actual: u64,
    },
    /// A record's `previous_hash` does not match the prior record's
    /// `record_hash`.
    #[error("broken linkage at sequence {0}")]
    BadLinkage(u64),
    /// A record's `record_hash` does not match its recomputed canonical
    /// fingerprint.
    #[error("hash mismatch at sequence {0}")]
    HashMismatch(u64),
    /// The stored hash string is not 64 uppercase hex characters.
    #[error("malformed hash: {0}")]
    MalformedHash(String),
    /// Chain continuity cannot be locally re-established; manual
    /// intervention is required.
    #[error("chain corruption: {0}")]
    ChainCorruption(String),

    // ── Governance (G) ───────────────────────────────────────────────
    /// The operating mode has already been set once and cannot be changed.
    #[error("operating mode is locked")]
    ModeLocked,
    /// A module (VERI*FACTU enforcement) cannot be deactivated once
    /// invoices have been issued under it.
    #[error("module is protected and cannot be deactivated: {0}")]
    ModuleProtected(String),

    // ── Transmission (T) ─────────────────────────────────────────────
    /// A network- or transport-level failure occurred talking to the tax
    /// authority.
    #[error("transport error: {0}")]
    TransportError(String),
    /// The tax authority rejected the submission at the protocol level.
    #[error("authority rejected submission: {code} {message}")]
    AuthorityRejected {
        /// Authority-supplied response code.
        code: String,
        /// Authority-supplied response message.
        message: String,
    },
    /// The configured client certificate has expired.
    #[error("certificate expired")]
    CertificateExpired,
    /// The configured client certificate is missing or malformed.
    #[error("invalid certificate: {0}")]
    CertificateInvalid(String),

    // ── Reconciliation (R) ───────────────────────────────────────────
    /// Local and authority chain state disagree in a way that cannot be
    /// auto-resolved.
    #[error("reconciliation conflict: {0}")]
    ReconciliationConflict(String),
    /// No certificate is configured, so the authority cannot be queried.
    #[error("no certificate configured for reconciliation")]
    NoCertificate,

    // ── System (S) ───────────────────────────────────────────────────
    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    IoError(String),
    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(String),
    /// The configuration file or environment overrides are invalid.
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    /// An unexpected internal invariant was violated.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl VerifactuError {
    /// This error's stable `ErrorCode`.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidAmount(_) => ErrorCode::InvalidAmount,
            Self::InvalidNif(_) => ErrorCode::InvalidNif,
            Self::MissingField(_) => ErrorCode::MissingField,
            Self::DuplicateRecord(_) => ErrorCode::DuplicateRecord,
            Self::ChainGap { .. } => ErrorCode::ChainGap,
            Self::BadLinkage(_) => ErrorCode::BadLinkage,
            Self::HashMismatch(_) => ErrorCode::HashMismatch,
            Self::MalformedHash(_) => ErrorCode::MalformedHash,
            Self::ChainCorruption(_) => ErrorCode::ChainCorruption,
            Self::ModeLocked => ErrorCode::ModeLocked,
            Self::ModuleProtected(_) => ErrorCode::ModuleProtected,
            Self::TransportError(_) => ErrorCode::TransportError,
            Self::AuthorityRejected { .. } => ErrorCode::AuthorityRejected,
            Self::CertificateExpired => ErrorCode::CertificateExpired,
            Self::CertificateInvalid(_) => ErrorCode::CertificateInvalid,
            Self::ReconciliationConflict(_) => ErrorCode::ReconciliationConflict,
            Self::NoCertificate => ErrorCode::NoCertificate,
            Self::IoError(_) => ErrorCode::IoError,
            Self::SerializationError(_) => ErrorCode::SerializationError,
            Self::ConfigurationError(_) => ErrorCode::ConfigurationError,
            Self::InternalError(_) => ErrorCode::InternalError,
        }
    }
}

/// Catalog of every error condition the record engine can surface, without
/// the variant payloads. Used for matching, metrics labels, and the stable
/// `VF-<category><number>` code string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorCode {
    InvalidAmount,
    InvalidNif,
    MissingField,
    DuplicateRecord,
    ChainGap,
    BadLinkage,
    HashMismatch,
    MalformedHash,
    ChainCorruption,
    ModeLocked,
    ModuleProtected,
    TransportError,
    AuthorityRejected,
    CertificateExpired,
    CertificateInvalid,
    ReconciliationConflict,
    NoCertificate,
    IoError,
    SerializationError,
    ConfigurationError,
    InternalError,
}

impl ErrorCode {
    /// Machine-readable code string (e.g. `"VF-V001"`).
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            // Validation
            Self::InvalidAmount => "VF-V001",
            Self::InvalidNif => "VF-V002",
            Self::MissingField => "VF-V003",

            // Hash chain
            Self::DuplicateRecord => "VF-H001",
            Self::ChainGap => "VF-H002",
            Self::BadLinkage => "VF-H003",
            Self::HashMismatch => "VF-H004",
            Self::MalformedHash => "VF-H005",
            Self::ChainCorruption => "VF-H006",

            // Governance
            Self::ModeLocked => "VF-G001",
            Self::ModuleProtected => "VF-G002",

            // Transmission
            Self::TransportError => "VF-T001",
            Self::AuthorityRejected => "VF-T002",
            Self::CertificateExpired => "VF-T003",
            Self::CertificateInvalid => "VF-T004",

            // Reconciliation
            Self::ReconciliationConflict => "VF-R001",
            Self::NoCertificate => "VF-R002",

            // System
            Self::IoError => "VF-S001",
            Self::SerializationError => "VF-S002",
            Self::ConfigurationError => "VF-S003",
            Self::InternalError => "VF-S004",
        }
    }

    /// Human-readable category label.
    #[must_use]
    pub fn category(self) -> &'static str {
        match self {
            Self::InvalidAmount | Self::InvalidNif | Self::MissingField => "validation",
            Self::DuplicateRecord
            | Self::ChainGap
            | Self::BadLinkage
            | Self::HashMismatch
            | Self::MalformedHash
            | Self::ChainCorruption => "hash_chain",
            Self::ModeLocked | Self::ModuleProtected => "governance",
            Self::TransportError
            | Self::AuthorityRejected
            | Self::CertificateExpired
            | Self::CertificateInvalid => "transmission",
            Self::ReconciliationConflict | Self::NoCertificate => "reconciliation",
            Self::IoError | Self::SerializationError | Self::ConfigurationError | Self::InternalError => {
                "system"
            }
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
