// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transport selection: a real AEAT client when a certificate is
//! configured, otherwise a stub that reports every call as unreachable
//! rather than forcing every CLI invocation to carry one.

use async_trait::async_trait;
use verifactu_core::{Record, VerifactuError};
use verifactu_transmission::{QueryOutcome, RealClient, TransmissionClient, TransmissionOutcome, TransportErrorKind};

/// Stands in for [`RealClient`] when no certificate is configured. Every
/// operation reports the authority as unreachable instead of panicking or
/// silently no-op'ing, so `reconcile`/`create_record` degrade the same way
/// they would against a genuinely unreachable authority.
pub struct NoCertificateClient;

#[async_trait]
impl TransmissionClient for NoCertificateClient {
    async fn submit_registration(&self, _record: &Record) -> TransmissionOutcome {
        TransmissionOutcome::TransportError(TransportErrorKind::Connection)
    }

    async fn submit_cancellation(&self, _record: &Record) -> TransmissionOutcome {
        TransmissionOutcome::TransportError(TransportErrorKind::Connection)
    }

    async fn query_records(&self, _issuer: &str, _year: i32, _limit: usize) -> QueryOutcome {
        QueryOutcome::TransportError(TransportErrorKind::Connection)
    }

    async fn probe_connection(&self) -> Result<(), TransportErrorKind> {
        Err(TransportErrorKind::Connection)
    }
}

/// The transport the CLI runs the engine against, chosen once at startup
/// from whether a certificate is configured.
pub enum Transport {
    /// A live AEAT client.
    Real(RealClient),
    /// No certificate configured; every call reports unreachable.
    NoCertificate(NoCertificateClient),
}

#[async_trait]
impl TransmissionClient for Transport {
    async fn submit_registration(&self, record: &Record) -> TransmissionOutcome {
        match self {
            Self::Real(c) => c.submit_registration(record).await,
            Self::NoCertificate(c) => c.submit_registration(record).await,
        }
    }

    async fn submit_cancellation(&self, record: &Record) -> TransmissionOutcome {
        match self {
            Self::Real(c) => c.submit_cancellation(record).await,
            Self::NoCertificate(c) => c.submit_cancellation(record).await,
        }
    }

    async fn query_records(&self, issuer: &str, year: i32, limit: usize) -> QueryOutcome {
        match self {
            Self::Real(c) => c.query_records(issuer, year, limit).await,
            Self::NoCertificate(c) => c.query_records(issuer, year, limit).await,
        }
    }

    async fn probe_connection(&self) -> Result<(), TransportErrorKind> {
        match self {
            Self::Real(c) => c.probe_connection().await,
            Self::NoCertificate(c) => c.probe_connection().await,
        }
    }
}

/// Build the transport named by `cert_path` (or a stub if none is
/// configured), reading the PKCS#12 password from
/// `VERIFACTU_CERTIFICATE_PASSWORD`.
pub fn build_transport(
    cert_path: Option<&str>,
    environment: verifactu_core::Environment,
    software: verifactu_transmission::SoftwareIdentity,
) -> Result<Transport, VerifactuError> {
    let Some(path) = cert_path else {
        return Ok(Transport::NoCertificate(NoCertificateClient));
    };

    let der = std::fs::read(path).map_err(|e| VerifactuError::CertificateInvalid(e.to_string()))?;
    let password = std::env::var("VERIFACTU_CERTIFICATE_PASSWORD").unwrap_or_default();
    let client = RealClient::new(environment, &der, &password, software)?;
    Ok(Transport::Real(client))
}
