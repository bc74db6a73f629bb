//! Change detection between an artifact on disk and a resolved request.
//!
//! Detection never fails. Everything that could go wrong (parsing the
//! existing artifact, building the draft) happens before [`detect`] is
//! called, so by the time it runs both sides are fully decoded.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::backend::{Certificate, CertificateBackend, Draft, LoadedArtifact};
use crate::compare::compare;
use crate::types::{
    ArtifactKind, ChangeSet, CertificateKind, Encoding, Principals, PrincipalsDiff,
    RevocationsDiff, ALL_PRINCIPALS,
};

/// What the artifact should look like after this run
#[derive(Debug, Clone, Copy)]
pub struct DesiredArtifact<'a> {
    /// Unsigned draft built from the resolved request
    pub draft: &'a Draft,
    /// Target encoding
    pub encoding: Encoding,
    /// Certificates to append after the leaf
    pub chain: &'a [Certificate],
    pub pkcs12_friendlyname: Option<&'a str>,
    pub pkcs12_passphrase: Option<&'a str>,
}

impl<'a> DesiredArtifact<'a> {
    #[must_use]
    pub const fn new(draft: &'a Draft, encoding: Encoding) -> Self {
        Self {
            draft,
            encoding,
            chain: &[],
            pkcs12_friendlyname: None,
            pkcs12_passphrase: None,
        }
    }
}

/// Renewal settings
#[derive(Debug, Clone, Copy)]
pub struct DetectOptions {
    /// Reissue once less than this much validity remains
    pub renewal_threshold: Duration,
    /// Reference time for the threshold
    pub now: DateTime<Utc>,
}

impl DetectOptions {
    #[must_use]
    pub fn new(renewal_threshold: Duration) -> Self {
        Self {
            renewal_threshold,
            now: Utc::now(),
        }
    }
}

/// Compute the changes needed to turn `existing` into `desired`.
///
/// Validity dates are never compared directly: a certificate is renewed
/// only once its remaining validity drops below the threshold, and a CRL
/// once its next update comes within it. Serial numbers (CRL numbers for
/// revocation lists) are compared only when the request names one.
pub fn detect(
    backend: &dyn CertificateBackend,
    existing: &LoadedArtifact,
    desired: &DesiredArtifact<'_>,
    options: &DetectOptions,
) -> ChangeSet {
    let have = &existing.certificate.info;
    let draft = desired.draft;
    let want = &draft.info;
    let is_crl = want.artifact == ArtifactKind::Crl;
    let is_signed = want.artifact != ArtifactKind::Csr;

    let mut changes = ChangeSet {
        // a CRL's key is its issuer's, checked through the signature
        private_key: !is_crl && have.public_key != want.public_key,
        digest: have.digest != want.digest,
        ..ChangeSet::default()
    };

    if is_signed {
        changes.signing_private_key =
            !backend.verify_signature(&existing.certificate, &draft.signer.public_key);
        changes.expiration = have.expires_within(options.now, options.renewal_threshold);
    }

    if draft.request.serial_number.is_some() {
        changes.serial_number = have.serial_number != want.serial_number;
    }

    match want.kind {
        CertificateKind::X509 => {
            if !is_crl {
                changes.subject_name = have.subject != want.subject;
            }
            if is_signed {
                changes.issuer_name = have.issuer != want.issuer;
            }
        }
        CertificateKind::Ssh => {
            changes.key_id = have.key_id != want.key_id;
            changes.cert_type = have.cert_type != want.cert_type;
            changes.principals = principals_diff(&have.principals, &want.principals);
        }
    }

    if is_crl {
        changes.revocations = RevocationsDiff::between(&have.revoked, &want.revoked);
    }

    let extensions = compare(&have.extensions, &want.extensions);
    if !extensions.is_empty() {
        changes.extensions = Some(extensions);
    }
    let critical_options = compare(&have.options, &want.options);
    if !critical_options.is_empty() {
        changes.critical_options = Some(critical_options);
    }

    changes.encoding = existing.encoding != desired.encoding;
    // bundles and stores do not keep certificate order
    let ordered = existing.encoding != Encoding::Pkcs7 && existing.encoding != Encoding::Pkcs12;
    changes.additional_certs = !same_chain(&existing.chain, desired.chain, ordered);
    if existing.encoding == Encoding::Pkcs12 && desired.encoding == Encoding::Pkcs12 {
        changes.pkcs12_friendlyname =
            existing.friendly_name.as_deref() != desired.pkcs12_friendlyname;
        changes.pkcs12_passphrase = existing.protected != desired.pkcs12_passphrase.is_some();
    }

    debug!(
        fields = ?changes.changed_fields(),
        fingerprint = %existing.certificate.fingerprint(),
        "Change detection finished"
    );
    changes
}

fn same_chain(existing: &[Certificate], desired: &[Certificate], ordered: bool) -> bool {
    if ordered {
        return existing.len() == desired.len()
            && existing
                .iter()
                .zip(desired)
                .all(|(a, b)| a.encoded == b.encoded);
    }
    fn set(certs: &[Certificate]) -> Vec<&[u8]> {
        let mut encoded: Vec<&[u8]> = certs.iter().map(|c| c.encoded.as_slice()).collect();
        encoded.sort_unstable();
        encoded
    }
    set(existing) == set(desired)
}

/// Principal names as a set, with "all principals" as a single marker
fn principal_set(principals: &Principals) -> BTreeSet<&str> {
    match principals {
        Principals::List(names) => names.iter().map(String::as_str).collect(),
        Principals::All | Principals::Unspecified => BTreeSet::from([ALL_PRINCIPALS]),
    }
}

fn principals_diff(have: &Principals, want: &Principals) -> Option<PrincipalsDiff> {
    let have = principal_set(have);
    let want = principal_set(want);
    let diff = PrincipalsDiff {
        added: want.difference(&have).map(|s| (*s).to_string()).collect(),
        removed: have.difference(&want).map(|s| (*s).to_string()).collect(),
    };
    (!diff.added.is_empty() || !diff.removed.is_empty()).then_some(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{cn, private_key, public_key, signer, FakeBackend};
    use crate::backend::{LoadedArtifact, SignerIdentity};
    use crate::types::{
        CertificateRequest, Digest, ExtensionKind, ResolvedRequest, SerialNumber, SshCertType,
    };

    fn request() -> CertificateRequest {
        let mut req = CertificateRequest::x509();
        req.name_attributes = cn("web1.example.com");
        req.ttl = Some(30 * 86_400);
        req.extensions
            .insert_raw(ExtensionKind::KeyUsage, "critical,digitalSignature");
        req
    }

    fn draft_for(backend: &FakeBackend, req: &CertificateRequest, ca: &SignerIdentity) -> Draft {
        backend
            .build_draft(
                ArtifactKind::Certificate,
                &ResolvedRequest::unrestricted(req.clone()),
                &public_key("leaf"),
                ca,
            )
            .unwrap()
    }

    fn issue(backend: &FakeBackend, req: &CertificateRequest) -> LoadedArtifact {
        let draft = draft_for(backend, req, &signer("ca"));
        LoadedArtifact {
            certificate: backend.sign(&draft, &private_key("ca"), None).unwrap(),
            encoding: Encoding::Pem,
            chain: Vec::new(),
            friendly_name: None,
            protected: false,
        }
    }

    fn run(backend: &FakeBackend, existing: &LoadedArtifact, draft: &Draft) -> ChangeSet {
        detect(
            backend,
            existing,
            &DesiredArtifact::new(draft, Encoding::Pem),
            &DetectOptions::new(Duration::days(7)),
        )
    }

    #[test]
    fn test_freshly_issued_artifact_needs_nothing() {
        let backend = FakeBackend::default();
        let req = request();
        let existing = issue(&backend, &req);
        let draft = draft_for(&backend, &req, &signer("ca"));
        let changes = run(&backend, &existing, &draft);
        assert!(changes.is_empty(), "{:?}", changes.changed_fields());
    }

    #[test]
    fn test_explicit_dates_do_not_trigger_reissue() {
        let backend = FakeBackend::default();
        let existing = issue(&backend, &request());
        let mut req = request();
        req.not_before = Some(Utc::now() - Duration::days(3));
        req.not_after = Some(Utc::now() + Duration::days(300));
        let draft = draft_for(&backend, &req, &signer("ca"));
        assert!(run(&backend, &existing, &draft).is_empty());
    }

    #[test]
    fn test_expiring_certificate_is_renewed() {
        let backend = FakeBackend::default();
        let mut req = request();
        req.ttl = Some(86_400);
        let existing = issue(&backend, &req);
        let draft = draft_for(&backend, &request(), &signer("ca"));
        let changes = run(&backend, &existing, &draft);
        assert!(changes.expiration);
        assert_eq!(changes.changed_fields(), vec!["expiration"]);
    }

    #[test]
    fn test_removed_extension_is_reported() {
        let backend = FakeBackend::default();
        let existing = issue(&backend, &request());
        let mut req = request();
        req.extensions.remove(ExtensionKind::KeyUsage);
        let draft = draft_for(&backend, &req, &signer("ca"));
        let changes = run(&backend, &existing, &draft);
        let diff = changes.extensions.unwrap();
        assert_eq!(diff.removed, vec![ExtensionKind::KeyUsage]);
        assert!(diff.added.is_empty());
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn test_new_ca_key_is_reported() {
        let backend = FakeBackend::default();
        let existing = issue(&backend, &request());
        let draft = draft_for(&backend, &request(), &signer("new-ca"));
        let changes = run(&backend, &existing, &draft);
        assert!(changes.signing_private_key);
        assert!(!changes.private_key);
    }

    #[test]
    fn test_subject_and_digest_changes() {
        let backend = FakeBackend::default();
        let existing = issue(&backend, &request());
        let mut req = request();
        req.name_attributes = cn("web2.example.com");
        req.digest = Some(Digest::Sha384);
        let draft = draft_for(&backend, &req, &signer("ca"));
        let changes = run(&backend, &existing, &draft);
        assert!(changes.subject_name);
        assert!(changes.issuer_name);
        assert!(changes.digest);
    }

    #[test]
    fn test_serial_compared_only_when_requested() {
        let backend = FakeBackend::default();
        let mut req = request();
        req.serial_number = Some(SerialNumber::from(7));
        let existing = issue(&backend, &req);

        let draft = draft_for(&backend, &request(), &signer("ca"));
        assert!(!run(&backend, &existing, &draft).serial_number);

        req.serial_number = Some(SerialNumber::from(8));
        let draft = draft_for(&backend, &req, &signer("ca"));
        assert!(run(&backend, &existing, &draft).serial_number);
    }

    #[test]
    fn test_encoding_change_is_metadata_only() {
        let backend = FakeBackend::default();
        let req = request();
        let existing = issue(&backend, &req);
        let draft = draft_for(&backend, &req, &signer("ca"));
        let chain = [existing.certificate.clone()];
        let desired = DesiredArtifact {
            chain: &chain,
            ..DesiredArtifact::new(&draft, Encoding::Der)
        };
        let changes = detect(
            &backend,
            &existing,
            &desired,
            &DetectOptions::new(Duration::days(7)),
        );
        assert!(changes.encoding);
        assert!(changes.additional_certs);
        assert!(changes.is_metadata_only());
    }

    #[test]
    fn test_bundle_chain_order_is_ignored() {
        let backend = FakeBackend::default();
        let req = request();
        let mut existing = issue(&backend, &req);
        let first = issue(&backend, &req).certificate;
        let mut second = first.clone();
        second.encoded.push(b'!');
        existing.chain = vec![first.clone(), second.clone()];
        let draft = draft_for(&backend, &req, &signer("ca"));
        let swapped = [second, first];
        let run_with = |encoding: Encoding, existing: &LoadedArtifact| {
            let desired = DesiredArtifact {
                chain: &swapped,
                ..DesiredArtifact::new(&draft, encoding)
            };
            detect(&backend, existing, &desired, &DetectOptions::new(Duration::days(7)))
        };

        assert!(run_with(Encoding::Pem, &existing).additional_certs);
        existing.encoding = Encoding::Pkcs7;
        assert!(!run_with(Encoding::Pkcs7, &existing).additional_certs);
    }

    #[test]
    fn test_csr_skips_signature_and_expiry() {
        let backend = FakeBackend::default();
        let req = request();
        let mut existing = issue(&backend, &req);
        existing.certificate.info.artifact = ArtifactKind::Csr;
        existing.certificate.info.not_after = Some(Utc::now());
        let mut draft = draft_for(&backend, &req, &signer("someone-else"));
        draft.info.artifact = ArtifactKind::Csr;
        let changes = run(&backend, &existing, &draft);
        assert!(!changes.signing_private_key);
        assert!(!changes.expiration);
    }

    #[test]
    fn test_crl_entries_and_next_update() {
        use crate::types::{Revocation, RevocationReason};

        let backend = FakeBackend::default();
        let req = request();
        let entry = |serial: u64, reason| Revocation {
            serial_number: serial.into(),
            revocation_date: Utc::now(),
            reason,
            invalidity_date: None,
        };
        let mut existing = issue(&backend, &req);
        existing.certificate.info.artifact = ArtifactKind::Crl;
        existing.certificate.info.subject = None;
        existing.certificate.info.public_key = public_key("");
        existing.certificate.info.revoked = vec![entry(1, None)];
        let mut draft = draft_for(&backend, &req, &signer("ca"));
        draft.info.artifact = ArtifactKind::Crl;
        draft.info.public_key = public_key("ca");
        draft.info.revoked = vec![entry(1, None)];

        // subject and key of a CRL are not compared
        assert!(run(&backend, &existing, &draft).is_empty());

        draft.info.revoked.push(entry(2, Some(RevocationReason::Superseded)));
        let changes = run(&backend, &existing, &draft);
        assert_eq!(changes.changed_fields(), vec!["revocations"]);
        assert_eq!(changes.revocations.unwrap().added, vec!["02".to_string()]);

        draft.info.revoked.truncate(1);
        existing.certificate.info.not_after = Some(Utc::now() + Duration::days(1));
        assert!(run(&backend, &existing, &draft).expiration);
    }

    #[test]
    fn test_ssh_identity_fields() {
        let backend = FakeBackend::default();
        let mut req = CertificateRequest::ssh();
        req.key_id = Some("alice".into());
        req.cert_type = Some(SshCertType::User);
        req.principals = Principals::List(vec!["alice".into(), "root".into()]);
        req.ttl = Some(30 * 86_400);
        let existing = issue(&backend, &req);

        req.key_id = Some("bob".into());
        req.cert_type = Some(SshCertType::Host);
        req.principals = Principals::All;
        let draft = draft_for(&backend, &req, &signer("ca"));
        let changes = run(&backend, &existing, &draft);
        assert!(changes.key_id);
        assert!(changes.cert_type);
        assert!(!changes.subject_name);
        assert_eq!(
            changes.principals,
            Some(PrincipalsDiff {
                added: vec![ALL_PRINCIPALS.to_string()],
                removed: vec!["alice".to_string(), "root".to_string()],
            })
        );
    }

    #[test]
    fn test_principal_order_is_irrelevant() {
        let a = Principals::List(vec!["a".into(), "b".into()]);
        let b = Principals::List(vec!["b".into(), "a".into()]);
        assert_eq!(principals_diff(&a, &b), None);
        assert_eq!(principals_diff(&Principals::All, &Principals::Unspecified), None);
    }
}
