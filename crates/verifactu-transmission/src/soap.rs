// SPDX-License-Identifier: MIT OR Apache-2.0
//! SOAP 1.1 envelope construction, pinned field-for-field against
//! `original_source/services/xml_service.py::generate_alta_xml` /
//! `generate_anulacion_xml`.

use verifactu_canon::format_timestamp;
use verifactu_core::{Record, RecordType};

/// `soapenv` namespace URI.
pub const NS_SOAPENV: &str = "http://schemas.xmlsoap.org/soap/envelope/";
/// `sf` (SuministroInformacion) namespace URI, pinned verbatim from
/// `xml_service.py::NAMESPACES` per spec.md's Open Question #2.
pub const NS_SF: &str = "https://www2.agenciatributaria.gob.es/static_files/common/internet/dep/aplicaciones/es/aeat/tike/cont/ws/SuministroInformacion.xsd";

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn envelope_open() -> String {
    format!(
        "<soapenv:Envelope xmlns:soapenv=\"{NS_SOAPENV}\" xmlns:sf=\"{NS_SF}\"><soapenv:Header/><soapenv:Body>"
    )
}

const ENVELOPE_CLOSE: &str = "</soapenv:Body></soapenv:Envelope>";

/// Software identification block (`SistemaInformatico`) embedded in every
/// submission.
pub struct SoftwareIdentity {
    /// Registered software name.
    pub name: String,
    /// NIF of the software provider.
    pub nif: String,
    /// Stable software identifier.
    pub software_id: String,
    /// Software version string.
    pub version: String,
}

fn cabecera(issuer_name: &str, issuer_nif: &str) -> String {
    format!(
        "<sf:Cabecera><sf:ObligadoEmision><sf:NombreRazon>{}</sf:NombreRazon><sf:NIF>{}</sf:NIF></sf:ObligadoEmision></sf:Cabecera>",
        escape(issuer_name),
        escape(issuer_nif),
    )
}

fn sistema_informatico(software: &SoftwareIdentity) -> String {
    format!(
        "<sf:SistemaInformatico><sf:NombreRazon>{name}</sf:NombreRazon><sf:NIF>{nif}</sf:NIF><sf:NombreSistemaInformatico>{name}</sf:NombreSistemaInformatico><sf:IdSistemaInformatico>{id}</sf:IdSistemaInformatico><sf:Version>{version}</sf:Version><sf:NumeroInstalacion>1</sf:NumeroInstalacion></sf:SistemaInformatico>",
        name = escape(&software.name),
        nif = escape(&software.nif),
        id = escape(&software.software_id),
        version = escape(&software.version),
    )
}

fn encadenamiento(record: &Record) -> String {
    if record.is_first_record {
        "<sf:Encadenamiento><sf:PrimerRegistro>S</sf:PrimerRegistro></sf:Encadenamiento>".to_string()
    } else {
        format!(
            "<sf:Encadenamiento><sf:PrimerRegistro>N</sf:PrimerRegistro><sf:RegistroAnterior><sf:Huella>{}</sf:Huella></sf:RegistroAnterior></sf:Encadenamiento>",
            escape(&record.previous_hash),
        )
    }
}

/// Build the `RegFactuSistemaFacturacion` envelope for a registration
/// (`RegistroAlta`) submission.
///
/// # Panics
///
/// Panics if `record.record_type` is not [`RecordType::Registration`].
#[must_use]
pub fn build_alta_envelope(record: &Record, software: &SoftwareIdentity) -> String {
    assert_eq!(record.record_type, RecordType::Registration);

    let id_factura = format!(
        "<sf:IDFactura><sf:IDEmisorFactura>{nif}</sf:IDEmisorFactura><sf:NumSerieFactura>{num}</sf:NumSerieFactura><sf:FechaExpedicionFactura>{date}</sf:FechaExpedicionFactura></sf:IDFactura>",
        nif = escape(&record.issuer_nif),
        num = escape(&record.invoice_number),
        date = record.invoice_date.format("%d-%m-%Y"),
    );

    let desglose = format!(
        "<sf:Desglose><sf:DetalleDesglose><sf:Impuesto>01</sf:Impuesto><sf:ClaveRegimen>01</sf:ClaveRegimen><sf:TipoImpositivo>{rate}</sf:TipoImpositivo><sf:BaseImponible>{base}</sf:BaseImponible><sf:CuotaRepercutida>{tax}</sf:CuotaRepercutida></sf:DetalleDesglose></sf:Desglose>",
        rate = verifactu_core::money::format_amount(record.tax_rate),
        base = verifactu_core::money::format_amount(record.base_amount),
        tax = verifactu_core::money::format_amount(record.tax_amount),
    );

    let alta = format!(
        "<sf:RegistroAlta>{id_factura}<sf:TipoFactura>{tipo}</sf:TipoFactura><sf:DescripcionOperacion>Factura</sf:DescripcionOperacion><sf:ImporteTotal>{total}</sf:ImporteTotal>{desglose}<sf:CuotaTotal>{cuota}</sf:CuotaTotal>{encadenamiento}{sistema}<sf:FechaHoraHusoGenRegistro>{ts}</sf:FechaHoraHusoGenRegistro><sf:Huella>{hash}</sf:Huella></sf:RegistroAlta>",
        tipo = record.invoice_type.code(),
        total = verifactu_core::money::format_amount(record.total_amount),
        cuota = verifactu_core::money::format_amount(record.tax_amount),
        encadenamiento = encadenamiento(record),
        sistema = sistema_informatico(software),
        ts = format_timestamp(record.generation_timestamp),
        hash = escape(&record.record_hash),
    );

    format!(
        "{open}<sf:RegFactuSistemaFacturacion>{cabecera}<sf:RegistroFactura>{alta}</sf:RegistroFactura></sf:RegFactuSistemaFacturacion>{close}",
        open = envelope_open(),
        cabecera = cabecera(&record.issuer_name, &record.issuer_nif),
        close = ENVELOPE_CLOSE,
    )
}

/// Build the `RegFactuSistemaFacturacion` envelope for a cancellation
/// (`RegistroAnulacion`) submission.
///
/// # Panics
///
/// Panics if `record.record_type` is not [`RecordType::Cancellation`].
#[must_use]
pub fn build_anulacion_envelope(record: &Record, software: &SoftwareIdentity) -> String {
    assert_eq!(record.record_type, RecordType::Cancellation);

    let id_factura = format!(
        "<sf:IDFactura><sf:IDEmisorFactura>{nif}</sf:IDEmisorFactura><sf:NumSerieFactura>{num}</sf:NumSerieFactura><sf:FechaExpedicionFactura>{date}</sf:FechaExpedicionFactura></sf:IDFactura>",
        nif = escape(&record.issuer_nif),
        num = escape(&record.invoice_number),
        date = record.invoice_date.format("%d-%m-%Y"),
    );

    let anulacion = format!(
        "<sf:RegistroAnulacion>{id_factura}{encadenamiento}{sistema}<sf:FechaHoraHusoGenRegistro>{ts}</sf:FechaHoraHusoGenRegistro><sf:Huella>{hash}</sf:Huella></sf:RegistroAnulacion>",
        encadenamiento = encadenamiento(record),
        sistema = sistema_informatico(software),
        ts = format_timestamp(record.generation_timestamp),
        hash = escape(&record.record_hash),
    );

    format!(
        "{open}<sf:RegFactuSistemaFacturacion>{cabecera}<sf:RegistroFactura>{anulacion}</sf:RegistroFactura></sf:RegFactuSistemaFacturacion>{close}",
        open = envelope_open(),
        cabecera = cabecera(&record.issuer_name, &record.issuer_nif),
        close = ENVELOPE_CLOSE,
    )
}

/// Build a `ConsultaFacturas` query envelope for `issuer`'s records in
/// `year`.
#[must_use]
pub fn build_consulta_envelope(issuer_nif: &str, issuer_name: &str, year: i32) -> String {
    format!(
        "{open}<sf:ConsultaLRFacturasEmitidas>{cabecera}<sf:FiltroConsulta><sf:PeriodoImputacion><sf:Ejercicio>{year}</sf:Ejercicio></sf:PeriodoImputacion></sf:FiltroConsulta></sf:ConsultaLRFacturasEmitidas>{close}",
        open = envelope_open(),
        cabecera = cabecera(issuer_name, issuer_nif),
        close = ENVELOPE_CLOSE,
    )
}
