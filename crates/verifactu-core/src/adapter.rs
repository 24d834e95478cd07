// SPDX-License-Identifier: MIT OR Apache-2.0
//! The invoice adapter seam (spec §4.J, §9).
//!
//! External invoicing/sales domains are "duck-typed" in the source system
//! this engine was modeled on — anything exposing the right attributes can
//! be turned into a record. Here that becomes one narrow trait with a
//! single method, the same shape `abp_core::ext`'s extension traits use to
//! pull a typed view out of a looser host type.

use crate::InvoiceSnapshot;

/// Turns an external invoice/sale event into a fully-typed [`InvoiceSnapshot`].
///
/// Implementors own the mapping from their domain's invoice representation
/// into the engine's narrow view; the Record Builder consumes only the
/// snapshot and never reaches back into the source type.
pub trait InvoiceSource {
    /// Produce a snapshot of this invoice's identity and amounts.
    fn snapshot(&self) -> InvoiceSnapshot;
}

impl InvoiceSource for InvoiceSnapshot {
    fn snapshot(&self) -> InvoiceSnapshot {
        self.clone()
    }
}
