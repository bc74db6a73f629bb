//! # certpol-backend
//!
//! [`CertificateBackend`] implementations:
//!
//! - [`X509Backend`]: X.509 certificates, CSRs and CRLs (rcgen, x509-parser),
//!   stored as PEM, DER, PKCS#7 bundles (cms) or PKCS#12 stores (p12-keystore)
//! - [`SshBackend`]: OpenSSH user and host certificates (ssh-key)

mod ssh;
mod x509;

use std::sync::Arc;

use certpol_core::{BackendError, BackendResult, CertificateBackend, CertificateKind, CertificateRequest};
use chrono::{DateTime, Duration, Utc};

pub use ssh::SshBackend;
pub use x509::X509Backend;

/// Validity used when a request names neither `not_after` nor `ttl`
const FALLBACK_TTL_SECS: i64 = 30 * 86_400;

/// Backend for a certificate family
#[must_use]
pub fn backend_for(kind: CertificateKind) -> Arc<dyn CertificateBackend> {
    match kind {
        CertificateKind::X509 => Arc::new(X509Backend::new()),
        CertificateKind::Ssh => Arc::new(SshBackend::new()),
    }
}

pub(crate) fn crypto_err(e: impl std::fmt::Display) -> BackendError {
    BackendError::Crypto(e.to_string())
}

/// Validity window of a request: `not_before` defaults to now, `not_after`
/// to `not_before + ttl`.
pub(crate) fn validity(request: &CertificateRequest) -> BackendResult<(DateTime<Utc>, DateTime<Utc>)> {
    let not_before = request.not_before.unwrap_or_else(Utc::now);
    let not_after = match request.not_after {
        Some(not_after) => not_after,
        None => {
            let ttl = request
                .ttl
                .map_or(FALLBACK_TTL_SECS, |t| i64::try_from(t).unwrap_or(i64::MAX));
            Duration::try_seconds(ttl)
                .and_then(|d| not_before.checked_add_signed(d))
                .ok_or_else(|| BackendError::invalid("ttl", "validity period out of range"))?
        }
    };
    if not_after <= not_before {
        return Err(BackendError::invalid(
            "not_after",
            "must be later than not_before",
        ));
    }
    Ok((not_before, not_after))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_defaults() {
        let req = CertificateRequest::x509();
        let (nb, na) = validity(&req).unwrap();
        assert_eq!((na - nb).num_seconds(), FALLBACK_TTL_SECS);

        let mut req = CertificateRequest::ssh();
        req.ttl = Some(3_600);
        let (nb, na) = validity(&req).unwrap();
        assert_eq!((na - nb).num_seconds(), 3_600);
    }

    #[test]
    fn test_backend_for_kind() {
        assert_eq!(backend_for(CertificateKind::X509).kind(), CertificateKind::X509);
        assert_eq!(backend_for(CertificateKind::Ssh).kind(), CertificateKind::Ssh);
    }
}
