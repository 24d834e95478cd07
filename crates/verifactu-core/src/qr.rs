// SPDX-License-Identifier: MIT OR Apache-2.0
//! QR verification URL construction (spec §6).
//!
//! PNG/SVG rendering of the QR code is out of scope; this module only
//! builds the deterministic URL the rendered code must encode, grounded on
//! `original_source/services/qr_service.py`.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::money::format_amount;

const QR_BASE_URL: &str =
    "https://www2.agenciatributaria.gob.es/wlpl/TIKE-CONT/ValidarQR";

/// Build the AEAT QR verification URL for an invoice.
///
/// `total` must already be rounded to two fractional digits via
/// [`crate::money::round_money`].
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use rust_decimal_macros::dec;
/// use verifactu_core::qr::build_qr_url;
///
/// let url = build_qr_url(
///     "B12345678",
///     "F2024-001",
///     NaiveDate::from_ymd_opt(2024, 12, 25).unwrap(),
///     dec!(121.00),
/// );
/// assert_eq!(
///     url,
///     "https://www2.agenciatributaria.gob.es/wlpl/TIKE-CONT/ValidarQR?\
///      nif=B12345678&numserie=F2024-001&fecha=25-12-2024&importe=121.00"
/// );
/// ```
#[must_use]
pub fn build_qr_url(nif: &str, number: &str, date: NaiveDate, total: Decimal) -> String {
    format!(
        "{base}?nif={nif}&numserie={number}&fecha={date}&importe={total}",
        base = QR_BASE_URL,
        date = date.format("%d-%m-%Y"),
        total = format_amount(total),
    )
}
