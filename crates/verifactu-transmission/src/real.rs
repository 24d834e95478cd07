// SPDX-License-Identifier: MIT OR Apache-2.0
//! Real AEAT client: SOAP over mutual TLS, grounded on
//! `original_source/services/aeat_client.py::AEATClient`.

use crate::soap::{build_alta_envelope, build_anulacion_envelope, build_consulta_envelope, SoftwareIdentity};
use crate::{
    endpoint_for, QueryOutcome, QueryRecord, TransmissionClient, TransmissionOutcome, TransportErrorKind,
    CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, SOAP_ACTION_ALTA, SOAP_ACTION_ANULACION, SOAP_ACTION_CONSULTA,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use quick_xml::events::Event as XmlEvent;
use quick_xml::reader::Reader;
use reqwest::{Client, Identity};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use verifactu_core::{Environment, Record, RecordType, VerifactuError};

/// Number of socket-level retry attempts on a transient 5xx response,
/// matching `AEATClient`'s default `retry_attempts=3`. This is distinct
/// from the logical retry queue: it only covers the single HTTP exchange.
const TRANSIENT_RETRY_ATTEMPTS: u32 = 3;

/// A live client to the AEAT VERI*FACTU web service, authenticated with a
/// PKCS#12 client certificate.
pub struct RealClient {
    http: Client,
    endpoint: String,
    software: SoftwareIdentity,
}

impl RealClient {
    /// Build a client for `environment`, presenting `pkcs12_der` (a
    /// PKCS#12 bundle, as produced by exporting the AEAT certificate) for
    /// mutual TLS.
    pub fn new(
        environment: Environment,
        pkcs12_der: &[u8],
        pkcs12_password: &str,
        software: SoftwareIdentity,
    ) -> Result<Self, VerifactuError> {
        let identity = Identity::from_pkcs12_der(pkcs12_der, pkcs12_password)
            .map_err(|e| VerifactuError::CertificateInvalid(e.to_string()))?;

        let http = Client::builder()
            .identity(identity)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .build()
            .map_err(|e| VerifactuError::TransportError(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: endpoint_for(environment).to_string(),
            software,
        })
    }

    /// Build a client against an arbitrary endpoint with no client
    /// certificate, bypassing [`RealClient::new`]'s mutual-TLS setup. Used
    /// to exercise the retry/parsing logic against a local mock server.
    #[cfg(test)]
    fn for_test(endpoint: String, software: SoftwareIdentity) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .build()
            .expect("test client builds");
        Self { http, endpoint, software }
    }

    async fn post_with_retry(&self, body: String, soap_action: &str) -> Result<String, TransportErrorKind> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .http
                .post(&self.endpoint)
                .header("Content-Type", "text/xml; charset=utf-8")
                .header("SOAPAction", soap_action)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() && attempt < TRANSIENT_RETRY_ATTEMPTS {
                        tracing::info!(attempt, %status, "transient AEAT error, retrying");
                        tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                        continue;
                    }
                    if !status.is_success() {
                        return Err(TransportErrorKind::Connection);
                    }
                    return response.text().await.map_err(|_| TransportErrorKind::Parse);
                }
                Err(e) if e.is_timeout() => return Err(TransportErrorKind::Timeout),
                Err(e) if e.is_connect() => return Err(TransportErrorKind::Connection),
                Err(e) if e.is_builder() || e.to_string().contains("tls") => {
                    return Err(TransportErrorKind::Tls)
                }
                Err(_) => return Err(TransportErrorKind::Connection),
            }
        }
    }
}

fn local_name(qname: &[u8]) -> &[u8] {
    match qname.iter().position(|b| *b == b':') {
        Some(idx) => &qname[idx + 1..],
        None => qname,
    }
}

struct ParsedResponse {
    success: bool,
    code: String,
    message: String,
    csv: Option<String>,
}

fn parse_submission_response(xml: &str) -> Result<ParsedResponse, TransportErrorKind> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current: Option<Vec<u8>> = None;
    let mut success = false;
    let mut code = String::new();
    let mut message = String::new();
    let mut csv = None;

    loop {
        match reader.read_event().map_err(|_| TransportErrorKind::Parse)? {
            XmlEvent::Start(e) => current = Some(local_name(e.name().as_ref()).to_vec()),
            XmlEvent::Text(t) => {
                if let Some(tag) = &current {
                    let text = t.unescape().map_err(|_| TransportErrorKind::Parse)?.into_owned();
                    match tag.as_slice() {
                        b"EstadoEnvio" | b"EstadoRegistro" => success = text == "Correcto",
                        b"CodigoErrorRegistro" => code = text,
                        b"DescripcionErrorRegistro" => message = text,
                        b"CSV" => csv = Some(text),
                        _ => {}
                    }
                }
            }
            XmlEvent::End(_) => current = None,
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    if code.is_empty() && success {
        code = "OK".to_string();
        message = "Record accepted".to_string();
    }

    Ok(ParsedResponse {
        success,
        code,
        message,
        csv,
    })
}

fn parse_query_response(xml: &str) -> Result<Vec<QueryRecord>, TransportErrorKind> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut records = Vec::new();
    let mut in_record = false;
    let mut current: Option<Vec<u8>> = None;

    let mut number = String::new();
    let mut date_str = String::new();
    let mut hash = String::new();
    let mut nif = String::new();
    let mut total: Option<Decimal> = None;
    let mut csv = None;
    let mut record_type = RecordType::Registration;

    loop {
        match reader.read_event().map_err(|_| TransportErrorKind::Parse)? {
            XmlEvent::Start(e) => {
                let name = local_name(e.name().as_ref()).to_vec();
                if name == b"RegistroRespuestaConsulta" {
                    in_record = true;
                    number.clear();
                    date_str.clear();
                    hash.clear();
                    nif.clear();
                    total = None;
                    csv = None;
                    record_type = RecordType::Registration;
                }
                current = Some(name);
            }
            XmlEvent::Text(t) if in_record => {
                if let Some(tag) = &current {
                    let text = t.unescape().map_err(|_| TransportErrorKind::Parse)?.into_owned();
                    match tag.as_slice() {
                        b"NumSerieFactura" => number = text,
                        b"FechaExpedicionFactura" => date_str = text,
                        b"Huella" => hash = text,
                        b"NIF" | b"IDEmisorFactura" => nif = text,
                        b"ImporteTotal" => total = Decimal::from_str(&text).ok(),
                        b"CSV" => csv = Some(text),
                        b"TipoRegistro" => {
                            record_type = if text == "A" {
                                RecordType::Cancellation
                            } else {
                                RecordType::Registration
                            };
                        }
                        _ => {}
                    }
                }
            }
            XmlEvent::End(e) => {
                if local_name(e.name().as_ref()) == b"RegistroRespuestaConsulta" {
                    in_record = false;
                    if !number.is_empty() && !hash.is_empty() {
                        let parts: Vec<&str> = date_str.split('-').collect();
                        let invoice_date = match parts.as_slice() {
                            [d, m, y] => NaiveDate::from_ymd_opt(
                                y.parse().unwrap_or(1970),
                                m.parse().unwrap_or(1),
                                d.parse().unwrap_or(1),
                            )
                            .unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
                            _ => NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
                        };
                        records.push(QueryRecord {
                            invoice_number: number.clone(),
                            invoice_date,
                            record_type,
                            record_hash: hash.clone(),
                            issuer_nif: nif.clone(),
                            total_amount: total,
                            csv: csv.clone(),
                        });
                    }
                }
                current = None;
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    records.sort_by(|a, b| b.invoice_date.cmp(&a.invoice_date));
    Ok(records)
}

#[async_trait]
impl TransmissionClient for RealClient {
    async fn submit_registration(&self, record: &Record) -> TransmissionOutcome {
        let body = build_alta_envelope(record, &self.software);
        match self.post_with_retry(body, SOAP_ACTION_ALTA).await {
            Ok(xml) => match parse_submission_response(&xml) {
                Ok(parsed) if parsed.success => TransmissionOutcome::Success {
                    code: parsed.code,
                    message: parsed.message,
                    csv: parsed.csv.unwrap_or_default(),
                },
                Ok(parsed) => TransmissionOutcome::Rejected {
                    code: parsed.code,
                    message: parsed.message,
                },
                Err(kind) => TransmissionOutcome::TransportError(kind),
            },
            Err(kind) => TransmissionOutcome::TransportError(kind),
        }
    }

    async fn submit_cancellation(&self, record: &Record) -> TransmissionOutcome {
        let body = build_anulacion_envelope(record, &self.software);
        match self.post_with_retry(body, SOAP_ACTION_ANULACION).await {
            Ok(xml) => match parse_submission_response(&xml) {
                Ok(parsed) if parsed.success => TransmissionOutcome::Success {
                    code: parsed.code,
                    message: parsed.message,
                    csv: parsed.csv.unwrap_or_default(),
                },
                Ok(parsed) => TransmissionOutcome::Rejected {
                    code: parsed.code,
                    message: parsed.message,
                },
                Err(kind) => TransmissionOutcome::TransportError(kind),
            },
            Err(kind) => TransmissionOutcome::TransportError(kind),
        }
    }

    async fn query_records(&self, issuer: &str, year: i32, limit: usize) -> QueryOutcome {
        let body = build_consulta_envelope(issuer, issuer, year);
        match self.post_with_retry(body, SOAP_ACTION_CONSULTA).await {
            Ok(xml) => match parse_query_response(&xml) {
                Ok(mut records) => {
                    records.truncate(limit);
                    QueryOutcome::Success(records)
                }
                Err(kind) => QueryOutcome::TransportError(kind),
            },
            Err(kind) => QueryOutcome::TransportError(kind),
        }
    }

    async fn probe_connection(&self) -> Result<(), TransportErrorKind> {
        let response = self
            .http
            .request(reqwest::Method::OPTIONS, &self.endpoint)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match response {
            Ok(r) if r.status().as_u16() < 500 => Ok(()),
            Ok(_) => Err(TransportErrorKind::Connection),
            Err(e) if e.is_timeout() => Err(TransportErrorKind::Timeout),
            Err(_) => Err(TransportErrorKind::Connection),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_name_strips_namespace_prefix() {
        assert_eq!(local_name(b"sf:EstadoEnvio"), b"EstadoEnvio");
        assert_eq!(local_name(b"EstadoEnvio"), b"EstadoEnvio");
    }

    #[test]
    fn parses_successful_submission_response() {
        let xml = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:sf="urn:sf">
<soapenv:Body><sf:RespuestaRegFactuSistemaFacturacion>
<sf:EstadoEnvio>Correcto</sf:EstadoEnvio>
<sf:CSV>ABC123</sf:CSV>
</sf:RespuestaRegFactuSistemaFacturacion></soapenv:Body></soapenv:Envelope>"#;
        let parsed = parse_submission_response(xml).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.csv.as_deref(), Some("ABC123"));
        assert_eq!(parsed.code, "OK");
    }

    #[test]
    fn parses_rejected_submission_response() {
        let xml = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:sf="urn:sf">
<soapenv:Body><sf:RespuestaRegFactuSistemaFacturacion>
<sf:EstadoEnvio>Incorrecto</sf:EstadoEnvio>
<sf:CodigoErrorRegistro>3000</sf:CodigoErrorRegistro>
<sf:DescripcionErrorRegistro>NIF invalido</sf:DescripcionErrorRegistro>
</sf:RespuestaRegFactuSistemaFacturacion></soapenv:Body></soapenv:Envelope>"#;
        let parsed = parse_submission_response(xml).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.code, "3000");
        assert_eq!(parsed.message, "NIF invalido");
    }

    #[test]
    fn parses_query_response_sorted_descending() {
        let xml = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:sf="urn:sf">
<soapenv:Body><sf:ConsultaLRFacturasEmitidasResponse>
<sf:RegistroRespuestaConsulta><sf:NumSerieFactura>F1</sf:NumSerieFactura><sf:FechaExpedicionFactura>01-01-2024</sf:FechaExpedicionFactura><sf:Huella>H1</sf:Huella></sf:RegistroRespuestaConsulta>
<sf:RegistroRespuestaConsulta><sf:NumSerieFactura>F2</sf:NumSerieFactura><sf:FechaExpedicionFactura>15-06-2024</sf:FechaExpedicionFactura><sf:Huella>H2</sf:Huella></sf:RegistroRespuestaConsulta>
</sf:ConsultaLRFacturasEmitidasResponse></soapenv:Body></soapenv:Envelope>"#;
        let records = parse_query_response(xml).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].invoice_number, "F2");
        assert_eq!(records[1].invoice_number, "F1");
    }

    fn sample_software() -> SoftwareIdentity {
        SoftwareIdentity {
            name: "verifactu-engine".to_string(),
            nif: "B00000000".to_string(),
            software_id: "01".to_string(),
            version: "1.0".to_string(),
        }
    }

    fn sample_record() -> Record {
        use chrono::{DateTime, FixedOffset, NaiveDate};
        use rust_decimal_macros::dec;
        use verifactu_core::{InvoiceType, RecordStatus};

        Record {
            sequence_number: 1,
            record_type: RecordType::Registration,
            invoice_type: InvoiceType::F1,
            issuer_nif: "B12345678".to_string(),
            issuer_name: "Acme S.L.".to_string(),
            invoice_number: "F2024-001".to_string(),
            invoice_date: NaiveDate::from_ymd_opt(2024, 12, 25).unwrap(),
            base_amount: dec!(100.00),
            tax_rate: dec!(21.00),
            tax_amount: dec!(21.00),
            total_amount: dec!(121.00),
            previous_hash: String::new(),
            record_hash: "ABCDEF0123456789".to_string(),
            is_first_record: true,
            generation_timestamp: DateTime::<FixedOffset>::parse_from_rfc3339("2024-12-25T10:30:00+00:00").unwrap(),
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
    async fn submit_registration_parses_success_response() {
        let server = wiremock::MockServer::start().await;
        let body = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:sf="urn:sf">
<soapenv:Body><sf:RespuestaRegFactuSistemaFacturacion>
<sf:EstadoEnvio>Correcto</sf:EstadoEnvio>
<sf:CSV>XYZ999</sf:CSV>
</sf:RespuestaRegFactuSistemaFacturacion></soapenv:Body></soapenv:Envelope>"#;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = RealClient::for_test(server.uri(), sample_software());
        let outcome = client.submit_registration(&sample_record()).await;
        match outcome {
            TransmissionOutcome::Success { csv, .. } => assert_eq!(csv, "XYZ999"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_registration_parses_rejection_without_retry() {
        let server = wiremock::MockServer::start().await;
        let body = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:sf="urn:sf">
<soapenv:Body><sf:RespuestaRegFactuSistemaFacturacion>
<sf:EstadoEnvio>Incorrecto</sf:EstadoEnvio>
<sf:CodigoErrorRegistro>3000</sf:CodigoErrorRegistro>
<sf:DescripcionErrorRegistro>NIF invalido</sf:DescripcionErrorRegistro>
</sf:RespuestaRegFactuSistemaFacturacion></soapenv:Body></soapenv:Envelope>"#;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let client = RealClient::for_test(server.uri(), sample_software());
        let outcome = client.submit_registration(&sample_record()).await;
        match outcome {
            TransmissionOutcome::Rejected { code, .. } => assert_eq!(code, "3000"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_registration_gives_up_after_repeated_5xx() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .expect(TRANSIENT_RETRY_ATTEMPTS as u64)
            .mount(&server)
            .await;

        let client = RealClient::for_test(server.uri(), sample_software());
        let outcome = client.submit_registration(&sample_record()).await;
        assert_eq!(outcome, TransmissionOutcome::TransportError(TransportErrorKind::Connection));
    }
}
