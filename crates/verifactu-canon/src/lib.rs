// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! This crate extracts the canonical-string and hashing logic from the
//! record's otherwise plain data model into a dedicated module, the way
//! `abp-receipt` separates canonicalization/hashing/chain verification from
//! `abp-core`'s plain `Receipt` type.

use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use verifactu_core::{InvoiceType, Record, RecordType, VerifactuError};

/// Produce the canonical registration (`RegistroAlta`) string for the given
/// fields, in the literal field order and separators the tax authority
/// requires.
///
/// `base`/`tax`/`total` must already be rounded to two fractional digits
/// (see [`verifactu_core::money::round_money`]); this function does not
/// re-round.
#[must_use]
pub fn canonicalize_alta(
    nif: &str,
    number: &str,
    date: chrono::NaiveDate,
    invoice_type: InvoiceType,
    tax: Decimal,
    total: Decimal,
    previous_hash: &str,
    generated_at: DateTime<FixedOffset>,
) -> String {
    format!(
        "IDEmisorFactura={nif}&NumSerieFactura={number}&FechaExpedicionFactura={date}&TipoFactura={code}&CuotaTotal={tax}&ImporteTotal={total}&Huella={prev}&FechaHoraHusoGenRegistro={ts}",
        date = date.format("%d-%m-%Y"),
        code = invoice_type.code(),
        tax = verifactu_core::money::format_amount(tax),
        total = verifactu_core::money::format_amount(total),
        prev = previous_hash,
        ts = format_timestamp(generated_at),
    )
}

/// Produce the canonical cancellation (`RegistroAnulacion`) string. Per the
/// current "especificaciones huella hash" this excludes `TipoFactura` and
/// all amount fields.
#[must_use]
pub fn canonicalize_anulacion(
    nif: &str,
    number: &str,
    date: chrono::NaiveDate,
    previous_hash: &str,
    generated_at: DateTime<FixedOffset>,
) -> String {
    format!(
        "IDEmisorFactura={nif}&NumSerieFactura={number}&FechaExpedicionFactura={date}&Huella={prev}&FechaHoraHusoGenRegistro={ts}",
        date = date.format("%d-%m-%Y"),
        prev = previous_hash,
        ts = format_timestamp(generated_at),
    )
}

/// Format an instant the way the canonical string and XML wire format
/// require: `YYYY-MM-DDTHH:MM:SS±HH:MM`, offset colon mandatory.
#[must_use]
pub fn format_timestamp(instant: DateTime<FixedOffset>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// Compute the SHA-256 hex-uppercase fingerprint of a canonical string.
#[must_use]
pub fn compute_hash(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:X}", hasher.finalize())
}

/// Derive the canonical string for `record` according to its `record_type`.
#[must_use]
pub fn canonical_string(record: &Record) -> String {
    match record.record_type {
        RecordType::Registration => canonicalize_alta(
            &record.issuer_nif,
            &record.invoice_number,
            record.invoice_date,
            record.invoice_type,
            record.tax_amount,
            record.total_amount,
            &record.previous_hash,
            record.generation_timestamp,
        ),
        RecordType::Cancellation => canonicalize_anulacion(
            &record.issuer_nif,
            &record.invoice_number,
            record.invoice_date,
            &record.previous_hash,
            record.generation_timestamp,
        ),
    }
}

/// Recompute `record`'s fingerprint from its own fields.
#[must_use]
pub fn compute_record_hash(record: &Record) -> String {
    compute_hash(&canonical_string(record))
}

/// Verify that `record.record_hash` matches its recomputed fingerprint.
///
/// # Errors
///
/// Returns [`VerifactuError::HashMismatch`] if the stored hash does not
/// match the recomputed one.
pub fn verify_hash(record: &Record) -> Result<(), VerifactuError> {
    let expected = compute_record_hash(record);
    if expected == record.record_hash {
        Ok(())
    } else {
        Err(VerifactuError::HashMismatch(record.sequence_number))
    }
}

/// Check that a hash string is exactly 64 uppercase hex characters.
#[must_use]
pub fn is_hex_upper_64(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

/// Check that `record.previous_hash` matches the hash the chain actually
/// expects next (the prior record's `record_hash`, or empty for the first
/// record in the chain).
#[must_use]
pub fn linkage_ok(expected_previous: &str, record: &Record) -> bool {
    expected_previous == record.previous_hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ts(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    /// Pins the literal canonical string and resulting hash from scenario 1.
    #[test]
    fn scenario_1_first_registration() {
        let canon = canonicalize_alta(
            "B12345678",
            "F2024-001",
            chrono::NaiveDate::from_ymd_opt(2024, 12, 25).unwrap(),
            InvoiceType::F1,
            dec!(21.00),
            dec!(121.00),
            "",
            ts("2024-12-25T10:30:00+00:00"),
        );
        assert_eq!(
            canon,
            "IDEmisorFactura=B12345678&NumSerieFactura=F2024-001&FechaExpedicionFactura=25-12-2024&TipoFactura=F1&CuotaTotal=21.00&ImporteTotal=121.00&Huella=&FechaHoraHusoGenRegistro=2024-12-25T10:30:00+00:00"
        );
        let hash = compute_hash(&canon);
        assert_eq!(
            hash,
            "2B4A4E74FCEE7C41E7F46F4ECBC039C715C36C915F221A5485BA586205DDB8CD"
        );
        assert!(is_hex_upper_64(&hash));
    }

    #[test]
    fn hash_is_64_upper_hex() {
        let canon = canonicalize_alta(
            "B12345678",
            "F2024-001",
            chrono::NaiveDate::from_ymd_opt(2024, 12, 25).unwrap(),
            InvoiceType::F1,
            dec!(21.00),
            dec!(121.00),
            "",
            ts("2024-12-25T10:30:00+00:00"),
        );
        let hash = compute_hash(&canon);
        assert!(is_hex_upper_64(&hash), "not 64 upper hex: {hash}");
    }

    #[test]
    fn cancellation_form_excludes_type_and_amounts() {
        let canon = canonicalize_anulacion(
            "B12345678",
            "F2024-001",
            chrono::NaiveDate::from_ymd_opt(2024, 12, 25).unwrap(),
            "ABC",
            ts("2024-12-25T10:30:00+00:00"),
        );
        assert_eq!(
            canon,
            "IDEmisorFactura=B12345678&NumSerieFactura=F2024-001&FechaExpedicionFactura=25-12-2024&Huella=ABC&FechaHoraHusoGenRegistro=2024-12-25T10:30:00+00:00"
        );
        assert!(!canon.contains("TipoFactura"));
        assert!(!canon.contains("CuotaTotal"));
        assert!(!canon.contains("ImporteTotal"));
    }

    #[test]
    fn timestamp_offset_has_colon() {
        assert_eq!(
            format_timestamp(ts("2024-12-25T10:30:00+02:00")),
            "2024-12-25T10:30:00+02:00"
        );
    }

    #[test]
    fn zero_tax_formats_as_two_decimals() {
        let canon = canonicalize_alta(
            "B12345678",
            "F2024-001",
            chrono::NaiveDate::from_ymd_opt(2024, 12, 25).unwrap(),
            InvoiceType::F1,
            dec!(0),
            dec!(100.00),
            "",
            ts("2024-12-25T10:30:00+00:00"),
        );
        assert!(canon.contains("CuotaTotal=0.00"));
    }

    proptest::proptest! {
        #[test]
        fn determinism(seed in 0u64..10_000) {
            let total = Decimal::new((seed as i64) * 7 + 100, 2);
            let canon_a = canonicalize_alta(
                "B12345678", "F2024-001",
                chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                InvoiceType::F1, total, total, "", ts("2024-01-01T00:00:00+00:00"),
            );
            let canon_b = canonicalize_alta(
                "B12345678", "F2024-001",
                chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                InvoiceType::F1, total, total, "", ts("2024-01-01T00:00:00+00:00"),
            );
            proptest::prop_assert_eq!(canon_a.clone(), canon_b.clone());
            proptest::prop_assert_eq!(compute_hash(&canon_a), compute_hash(&canon_b));
        }
    }
}
