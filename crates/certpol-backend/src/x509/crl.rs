//! Certificate revocation lists: rcgen builds and signs them, x509-parser
//! reads them back, ring checks their signatures.

use certpol_core::{
    BackendError, BackendResult, Certificate, CertificateRequest, ExtensionKind, KeyAlgorithm,
    PublicKey, Revocation, RevocationReason, SerialNumber,
};
use chrono::{DateTime, Duration, Utc};
use rcgen::{
    CertificateParams, CertificateRevocationListParams, Issuer, KeyIdMethod, KeyPair,
    RevokedCertParams,
};
use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;
use x509_parser::x509::SubjectPublicKeyInfo;

use super::keys::algorithm_from_spki;
use super::{distinguished_name, offset, parse, to_pem, TAG_CERTIFICATE};
use crate::crypto_err;

pub(super) const TAG_CRL: &str = "X509 CRL";

/// Lifetime of a CRL that names neither `not_after` nor `ttl`
const FALLBACK_CRL_TTL_SECS: i64 = 7 * 86_400;

/// Update window of a CRL: `not_before` is this update, `not_after` the
/// next one.
pub(super) fn update_window(request: &CertificateRequest) -> BackendResult<(DateTime<Utc>, DateTime<Utc>)> {
    let this_update = request.not_before.unwrap_or_else(Utc::now);
    let next_update = match request.not_after {
        Some(next_update) => next_update,
        None => {
            let ttl = request
                .ttl
                .map_or(FALLBACK_CRL_TTL_SECS, |t| i64::try_from(t).unwrap_or(i64::MAX));
            Duration::try_seconds(ttl)
                .and_then(|d| this_update.checked_add_signed(d))
                .ok_or_else(|| BackendError::invalid("ttl", "update window out of range"))?
        }
    };
    if next_update <= this_update {
        return Err(BackendError::invalid("not_after", "next update must follow this update"));
    }
    Ok((this_update, next_update))
}

/// Entries of the requested CRL as of `now`.
///
/// Entries whose certificate already expired are left out unless
/// `include_expired` is set.
pub(super) fn revocations(request: &CertificateRequest, now: DateTime<Utc>) -> BackendResult<Vec<Revocation>> {
    let mut out = Vec::with_capacity(request.revoked.len());
    for entry in &request.revoked {
        let serial_number = entry.serial_number.clone().ok_or_else(|| {
            BackendError::invalid("revoked", "every entry needs a serial number or a certificate")
        })?;
        if !request.include_expired && entry.not_after.is_some_and(|t| t <= now) {
            continue;
        }
        if out.iter().any(|r: &Revocation| r.serial_number == serial_number) {
            return Err(BackendError::invalid(
                "revoked",
                format!("serial {serial_number} listed twice"),
            ));
        }
        out.push(Revocation {
            serial_number,
            revocation_date: entry.revocation_date.unwrap_or(now),
            reason: entry.reason,
            invalidity_date: entry.invalidity_date,
        });
    }
    Ok(out)
}

/// Only the authority key identifier can be requested on a CRL.
pub(super) fn check_extensions(request: &CertificateRequest) -> BackendResult<()> {
    match request
        .extensions
        .iter()
        .find(|(kind, _)| *kind != ExtensionKind::AuthorityKeyIdentifier)
    {
        Some((kind, _)) => Err(BackendError::invalid(
            "extensions",
            format!("{kind} cannot be set on a revocation list"),
        )),
        None => Ok(()),
    }
}

fn reason(reason: RevocationReason) -> rcgen::RevocationReason {
    match reason {
        RevocationReason::Unspecified => rcgen::RevocationReason::Unspecified,
        RevocationReason::KeyCompromise => rcgen::RevocationReason::KeyCompromise,
        RevocationReason::CaCompromise => rcgen::RevocationReason::CaCompromise,
        RevocationReason::AffiliationChanged => rcgen::RevocationReason::AffiliationChanged,
        RevocationReason::Superseded => rcgen::RevocationReason::Superseded,
        RevocationReason::CessationOfOperation => rcgen::RevocationReason::CessationOfOperation,
        RevocationReason::CertificateHold => rcgen::RevocationReason::CertificateHold,
        RevocationReason::RemoveFromCrl => rcgen::RevocationReason::RemoveFromCrl,
        RevocationReason::PrivilegeWithdrawn => rcgen::RevocationReason::PrivilegeWithdrawn,
        RevocationReason::AaCompromise => rcgen::RevocationReason::AaCompromise,
    }
}

/// What goes into one CRL
pub(super) struct CrlContents<'a> {
    pub number: &'a SerialNumber,
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    pub revoked: &'a [Revocation],
}

/// Sign a CRL with `key`, issued by `ca` or by the request's own name.
pub(super) fn issue(
    request: &CertificateRequest,
    contents: &CrlContents<'_>,
    ca: Option<&Certificate>,
    key: KeyPair,
) -> BackendResult<Vec<u8>> {
    let revoked_certs = contents
        .revoked
        .iter()
        .map(|r| {
            Ok(RevokedCertParams {
                serial_number: rcgen::SerialNumber::from_slice(r.serial_number.as_bytes()),
                revocation_time: offset(r.revocation_date)?,
                reason_code: r.reason.map(reason),
                invalidity_date: r.invalidity_date.map(offset).transpose()?,
            })
        })
        .collect::<BackendResult<Vec<_>>>()?;
    let params = CertificateRevocationListParams {
        this_update: offset(contents.this_update)?,
        next_update: offset(contents.next_update)?,
        crl_number: rcgen::SerialNumber::from_slice(contents.number.as_bytes()),
        issuing_distribution_point: None,
        revoked_certs,
        key_identifier_method: KeyIdMethod::Sha256,
    };
    let crl = match ca {
        Some(ca) => {
            let issuer = Issuer::from_ca_cert_pem(&to_pem(TAG_CERTIFICATE, &ca.encoded), key)
                .map_err(crypto_err)?;
            params.signed_by(&issuer)
        }
        None => {
            let mut issuer_params = CertificateParams::default();
            issuer_params.distinguished_name = distinguished_name(request)?;
            let issuer = Issuer::from_params(&issuer_params, key);
            params.signed_by(&issuer)
        }
    }
    .map_err(crypto_err)?;
    Ok(crl.der().to_vec())
}

/// ring algorithm for a CRL signature, given the signer key's curve
fn verification_algorithm(
    signature_oid: &str,
    spki: &SubjectPublicKeyInfo<'_>,
) -> Option<&'static dyn VerificationAlgorithm> {
    let p384 = algorithm_from_spki(spki).is_ok_and(|alg| alg == KeyAlgorithm::EcdsaP384);
    Some(match (signature_oid, p384) {
        ("1.3.101.112", _) => &signature::ED25519,
        ("1.2.840.10045.4.3.2", false) => &signature::ECDSA_P256_SHA256_ASN1,
        ("1.2.840.10045.4.3.2", true) => &signature::ECDSA_P384_SHA256_ASN1,
        ("1.2.840.10045.4.3.3", false) => &signature::ECDSA_P256_SHA384_ASN1,
        ("1.2.840.10045.4.3.3", true) => &signature::ECDSA_P384_SHA384_ASN1,
        ("1.2.840.113549.1.1.11", _) => &signature::RSA_PKCS1_2048_8192_SHA256,
        ("1.2.840.113549.1.1.12", _) => &signature::RSA_PKCS1_2048_8192_SHA384,
        ("1.2.840.113549.1.1.13", _) => &signature::RSA_PKCS1_2048_8192_SHA512,
        _ => return None,
    })
}

/// Whether `der` is a CRL signed by `key`
pub(super) fn verify(der: &[u8], key: &PublicKey) -> bool {
    let Ok((_, spki)) = SubjectPublicKeyInfo::from_der(key.encoded()) else {
        return false;
    };
    let Ok((_, crl)) = CertificateRevocationList::from_der(der) else {
        return false;
    };
    let oid = crl.signature_algorithm.algorithm.to_id_string();
    let Some(alg) = verification_algorithm(&oid, &spki) else {
        return false;
    };
    UnparsedPublicKey::new(alg, &spki.subject_public_key.data)
        .verify(crl.tbs_cert_list.as_ref(), &crl.signature_value.data)
        .is_ok()
}

/// Read a CRL in PEM or DER form
pub(super) fn load(bytes: &[u8]) -> BackendResult<Certificate> {
    let der = match pem::parse(bytes) {
        Ok(block) if block.tag() == TAG_CRL => block.into_contents(),
        Ok(_) => return Err(BackendError::Unrecognized { what: "crl" }),
        Err(_) => bytes.to_vec(),
    };
    let info = parse::crl(&der)?;
    Ok(Certificate { encoded: der, info })
}

#[cfg(test)]
mod tests {
    use super::*;
    use certpol_core::{ExtensionSet, RevokedCertificate};

    #[test]
    fn test_expired_entries_are_dropped() {
        let now = Utc::now();
        let mut req = CertificateRequest::x509();
        req.revoked = vec![
            RevokedCertificate {
                not_after: Some(now - Duration::days(1)),
                ..RevokedCertificate::serial(1u64)
            },
            RevokedCertificate {
                not_after: Some(now + Duration::days(1)),
                reason: Some(RevocationReason::KeyCompromise),
                ..RevokedCertificate::serial(2u64)
            },
            RevokedCertificate::serial(3u64),
        ];
        let entries = revocations(&req, now).unwrap();
        let serials: Vec<_> = entries.iter().map(|r| r.serial_number.clone()).collect();
        assert_eq!(serials, vec![SerialNumber::from(2u64), SerialNumber::from(3u64)]);
        assert_eq!(entries[0].revocation_date, now);

        req.include_expired = true;
        assert_eq!(revocations(&req, now).unwrap().len(), 3);
    }

    #[test]
    fn test_entry_needs_serial() {
        let mut req = CertificateRequest::x509();
        req.revoked = vec![RevokedCertificate::default()];
        assert!(matches!(
            revocations(&req, Utc::now()),
            Err(BackendError::InvalidSpec { field, .. }) if field == "revoked"
        ));
        req.revoked = vec![RevokedCertificate::serial(5u64), RevokedCertificate::serial(5u64)];
        assert!(revocations(&req, Utc::now()).is_err());
    }

    #[test]
    fn test_only_aki_allowed() {
        let mut req = CertificateRequest::x509();
        req.extensions = ExtensionSet::new().with(ExtensionKind::AuthorityKeyIdentifier, "keyid:always");
        assert!(check_extensions(&req).is_ok());
        req.extensions = ExtensionSet::new().with(ExtensionKind::BasicConstraints, "CA:FALSE");
        assert!(matches!(
            check_extensions(&req),
            Err(BackendError::InvalidSpec { field, .. }) if field == "extensions"
        ));
    }

    #[test]
    fn test_update_window_default() {
        let req = CertificateRequest::x509();
        let (this_update, next_update) = update_window(&req).unwrap();
        assert_eq!((next_update - this_update).num_seconds(), FALLBACK_CRL_TTL_SECS);
    }
}
