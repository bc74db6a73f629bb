//! DER certificates, CSRs and CRLs into [`CertificateInfo`].

use certpol_core::{
    ArtifactKind, BackendError, BackendResult, CertificateInfo, CertificateKind, Digest,
    DistinguishedName, ExtensionSet, KeyAlgorithm, NameAttribute, Principals, PublicKey,
    Revocation, RevocationReason, SerialNumber,
};
use chrono::{DateTime, TimeZone, Utc};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::{CertificateRevocationList, RevokedCertificate};
use x509_parser::time::ASN1Time;
use x509_parser::x509::{SubjectPublicKeyInfo, X509Name};

use super::extensions;
use super::keys::algorithm_from_spki;

/// Digest named by a signature algorithm OID. `None` for schemes with a
/// fixed digest and for unknown algorithms.
pub fn digest_of(signature_oid: &str) -> Option<Digest> {
    match signature_oid {
        "1.2.840.113549.1.1.5" | "1.2.840.10045.4.1" => Some(Digest::Sha1),
        "1.2.840.113549.1.1.14" | "1.2.840.10045.4.3.1" => Some(Digest::Sha224),
        "1.2.840.113549.1.1.11" | "1.2.840.10045.4.3.2" => Some(Digest::Sha256),
        "1.2.840.113549.1.1.12" | "1.2.840.10045.4.3.3" => Some(Digest::Sha384),
        "1.2.840.113549.1.1.13" | "1.2.840.10045.4.3.4" => Some(Digest::Sha512),
        _ => None,
    }
}

/// Parse a DER certificate.
pub fn certificate(der: &[u8]) -> BackendResult<CertificateInfo> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|_| BackendError::Unrecognized { what: "certificate" })?;
    Ok(CertificateInfo {
        kind: CertificateKind::X509,
        artifact: ArtifactKind::Certificate,
        public_key: public_key(cert.public_key())?,
        serial_number: Some(SerialNumber::from_bytes(cert.raw_serial())),
        subject: Some(name(cert.subject())),
        issuer: Some(name(cert.issuer())),
        not_before: Some(asn1_to_utc(cert.validity().not_before)),
        not_after: Some(asn1_to_utc(cert.validity().not_after)),
        extensions: extensions::from_certificate(cert.extensions()),
        options: ExtensionSet::new(),
        principals: Principals::Unspecified,
        key_id: None,
        cert_type: None,
        digest: digest_of(&cert.signature_algorithm.algorithm.to_id_string()),
        revoked: Vec::new(),
    })
}

/// Parse a DER certificate signing request.
pub fn request(der: &[u8]) -> BackendResult<CertificateInfo> {
    let (_, csr) = X509CertificationRequest::from_der(der)
        .map_err(|_| BackendError::Unrecognized { what: "csr" })?;
    let info = &csr.certification_request_info;
    let subject = name(&info.subject);
    let extensions = csr
        .requested_extensions()
        .map(|exts| extensions::from_request(exts, subject.is_empty()))
        .unwrap_or_default();
    Ok(CertificateInfo {
        kind: CertificateKind::X509,
        artifact: ArtifactKind::Csr,
        public_key: public_key(&info.subject_pki)?,
        serial_number: None,
        subject: Some(subject),
        issuer: None,
        not_before: None,
        not_after: None,
        extensions,
        options: ExtensionSet::new(),
        principals: Principals::Unspecified,
        key_id: None,
        cert_type: None,
        digest: digest_of(&csr.signature_algorithm.algorithm.to_id_string()),
        revoked: Vec::new(),
    })
}

/// Key family named by a signature algorithm OID
fn signature_key_algorithm(signature_oid: &str) -> KeyAlgorithm {
    match signature_oid {
        "1.3.101.112" => KeyAlgorithm::Ed25519,
        "1.2.840.10045.4.3.3" | "1.2.840.10045.4.3.4" => KeyAlgorithm::EcdsaP384,
        oid if oid.starts_with("1.2.840.10045.") => KeyAlgorithm::EcdsaP256,
        _ => KeyAlgorithm::Rsa,
    }
}

fn revocation(entry: &RevokedCertificate<'_>) -> Revocation {
    let invalidity_date = entry.extensions().iter().find_map(|ext| match ext.parsed_extension() {
        ParsedExtension::InvalidityDate(t) => Some(asn1_to_utc(*t)),
        _ => None,
    });
    Revocation {
        serial_number: SerialNumber::from_bytes(entry.raw_serial()),
        revocation_date: asn1_to_utc(entry.revocation_date),
        reason: entry
            .reason_code()
            .and_then(|(_, code)| RevocationReason::from_code(code.0)),
        invalidity_date,
    }
}

/// Parse a DER certificate revocation list.
///
/// The issuer key is not recoverable from a CRL, so `public_key` carries
/// only the key family of the signature.
pub fn crl(der: &[u8]) -> BackendResult<CertificateInfo> {
    let (_, crl) = CertificateRevocationList::from_der(der)
        .map_err(|_| BackendError::Unrecognized { what: "crl" })?;
    let signature_oid = crl.signature_algorithm.algorithm.to_id_string();
    Ok(CertificateInfo {
        kind: CertificateKind::X509,
        artifact: ArtifactKind::Crl,
        public_key: PublicKey::new(
            CertificateKind::X509,
            signature_key_algorithm(&signature_oid),
            Vec::new(),
        ),
        serial_number: crl
            .crl_number()
            .map(|n| SerialNumber::from_bytes(&n.to_bytes_be())),
        subject: None,
        issuer: Some(name(crl.issuer())),
        not_before: Some(asn1_to_utc(crl.last_update())),
        not_after: crl.next_update().map(asn1_to_utc),
        extensions: extensions::from_certificate(crl.extensions()),
        options: ExtensionSet::new(),
        principals: Principals::Unspecified,
        key_id: None,
        cert_type: None,
        digest: digest_of(&signature_oid),
        revoked: crl.iter_revoked_certificates().map(revocation).collect(),
    })
}

fn public_key(spki: &SubjectPublicKeyInfo<'_>) -> BackendResult<PublicKey> {
    Ok(PublicKey::new(
        CertificateKind::X509,
        algorithm_from_spki(spki)?,
        spki.raw.to_vec(),
    ))
}

/// Name attributes outside the supported vocabulary are dropped.
fn name(x509: &X509Name<'_>) -> DistinguishedName {
    x509.iter_attributes()
        .filter_map(|attr| {
            let attribute = NameAttribute::from_oid(&attr.attr_type().to_id_string())?;
            let value = attr.as_str().ok()?;
            Some((attribute, value.to_string()))
        })
        .collect()
}

/// Convert an ASN.1 `GeneralizedTime` / `UTCTime` to `DateTime<Utc>`.
fn asn1_to_utc(t: ASN1Time) -> DateTime<Utc> {
    Utc.timestamp_opt(t.timestamp(), 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_oids() {
        assert_eq!(digest_of("1.2.840.10045.4.3.2"), Some(Digest::Sha256));
        assert_eq!(digest_of("1.2.840.113549.1.1.12"), Some(Digest::Sha384));
        assert_eq!(digest_of("1.3.101.112"), None);
    }

    #[test]
    fn test_garbage_is_unrecognized() {
        assert_eq!(
            certificate(b"nope").unwrap_err(),
            BackendError::Unrecognized { what: "certificate" }
        );
        assert_eq!(
            request(b"nope").unwrap_err(),
            BackendError::Unrecognized { what: "csr" }
        );
    }
}
