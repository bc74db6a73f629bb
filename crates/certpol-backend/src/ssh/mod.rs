//! OpenSSH certificate backend built on ssh-key.
//!
//! Private keys are held as unencrypted OpenSSH text, public keys as the
//! comment-free `algorithm base64` line, certificates as their
//! `*-cert-v01@openssh.com` line.

use certpol_core::{
    ArtifactKind, AttributeValue, BackendError, BackendResult, Certificate, CertificateBackend,
    CertificateInfo, CertificateKind, Digest, Draft, EncodeOptions, Encoding, ExtensionKind,
    ExtensionSet, ExtensionValue, KeyAlgorithm, LoadedArtifact, Principals, PrivateKey, PublicKey,
    ResolvedRequest, SerialNumber, SignerIdentity, SshCertType, SshSection,
};
use chrono::{DateTime, TimeZone, Utc};
use rand_core::{OsRng, RngCore};
use ssh_key::certificate::{Builder, CertType};
use ssh_key::{Algorithm, EcdsaCurve, HashAlg, LineEnding, public::KeyData};
use tracing::debug;

use crate::{crypto_err, validity};

const LOAD_ORDER: [Encoding; 1] = [Encoding::OpenSsh];

/// OpenSSH user and host certificates
#[derive(Debug, Clone, Copy, Default)]
pub struct SshBackend;

impl SshBackend {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn text<'a>(bytes: &'a [u8], what: &'static str) -> BackendResult<&'a str> {
    std::str::from_utf8(bytes)
        .map(str::trim)
        .map_err(|_| BackendError::Unrecognized { what })
}

fn key_algorithm(alg: &Algorithm) -> BackendResult<KeyAlgorithm> {
    match alg {
        Algorithm::Ed25519 => Ok(KeyAlgorithm::Ed25519),
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        } => Ok(KeyAlgorithm::EcdsaP256),
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP384,
        } => Ok(KeyAlgorithm::EcdsaP384),
        Algorithm::Rsa { .. } => Ok(KeyAlgorithm::Rsa),
        _ => Err(BackendError::Unrecognized { what: "key" }),
    }
}

fn ssh_algorithm(alg: KeyAlgorithm) -> Algorithm {
    match alg {
        KeyAlgorithm::Ed25519 => Algorithm::Ed25519,
        KeyAlgorithm::EcdsaP256 => Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        },
        KeyAlgorithm::EcdsaP384 => Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP384,
        },
        KeyAlgorithm::Rsa => Algorithm::Rsa { hash: None },
    }
}

/// Digest a CA key signs certificates with. RSA keys sign with
/// rsa-sha2-512; the other algorithms have a fixed digest.
fn signing_digest(key: KeyAlgorithm, requested: Option<Digest>) -> BackendResult<Option<Digest>> {
    let natural = match key {
        KeyAlgorithm::Rsa => Some(Digest::Sha512),
        other => other.natural_digest(),
    };
    match requested {
        Some(digest) if key != KeyAlgorithm::Ed25519 && Some(digest) != natural => {
            Err(BackendError::UnsupportedDigest(digest.to_string()))
        }
        _ => Ok(natural),
    }
}

fn digest_of_signature(alg: &Algorithm) -> Option<Digest> {
    match alg {
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        } => Some(Digest::Sha256),
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP384,
        } => Some(Digest::Sha384),
        Algorithm::Rsa { hash: None } => Some(Digest::Sha1),
        Algorithm::Rsa {
            hash: Some(HashAlg::Sha256),
        } => Some(Digest::Sha256),
        Algorithm::Rsa {
            hash: Some(HashAlg::Sha512),
        } => Some(Digest::Sha512),
        _ => None,
    }
}

fn public_handle(key_data: &KeyData) -> BackendResult<PublicKey> {
    let algorithm = key_algorithm(&key_data.algorithm())?;
    let line = ssh_key::PublicKey::new(key_data.clone(), "")
        .to_openssh()
        .map_err(crypto_err)?;
    Ok(PublicKey::new(
        CertificateKind::Ssh,
        algorithm,
        line.trim().as_bytes().to_vec(),
    ))
}

fn ssh_public(key: &PublicKey) -> BackendResult<ssh_key::PublicKey> {
    ssh_key::PublicKey::from_openssh(text(key.encoded(), "public key")?)
        .map_err(|_| BackendError::Unrecognized { what: "public key" })
}

fn ssh_private(key: &PrivateKey) -> BackendResult<ssh_key::PrivateKey> {
    ssh_key::PrivateKey::from_openssh(key.encoded())
        .map_err(|_| BackendError::Unrecognized { what: "private key" })
}

fn private_handle(key: &ssh_key::PrivateKey) -> BackendResult<PrivateKey> {
    let algorithm = key_algorithm(&key.algorithm())?;
    let text = key.to_openssh(LineEnding::LF).map_err(crypto_err)?;
    Ok(PrivateKey::new(
        CertificateKind::Ssh,
        algorithm,
        text.as_bytes().to_vec(),
    ))
}

fn timestamp(t: DateTime<Utc>) -> BackendResult<u64> {
    u64::try_from(t.timestamp()).map_err(|_| BackendError::invalid("validity", "before 1970"))
}

fn datetime(secs: u64) -> Option<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(|s| Utc.timestamp_opt(s, 0).single())
}

/// Check every entry belongs in `section` and normalize its flag and value.
fn canonical_section(set: &ExtensionSet, section: SshSection) -> BackendResult<ExtensionSet> {
    let field = match section {
        SshSection::CriticalOption => "options",
        SshSection::Extension => "extensions",
    };
    set.iter()
        .map(|(kind, value)| {
            if kind.ssh_section() != Some(section) {
                return Err(BackendError::invalid(
                    field,
                    format!("{kind} does not belong in OpenSSH {field}"),
                ));
            }
            let value = match &value.value {
                AttributeValue::Present => AttributeValue::Present,
                AttributeValue::Text(s) if s.is_empty() => AttributeValue::Present,
                AttributeValue::Text(s) => AttributeValue::Text(s.clone()),
                _ => {
                    return Err(BackendError::invalid(
                        kind.name(),
                        "OpenSSH option values must be text",
                    ))
                }
            };
            Ok((
                kind,
                ExtensionValue {
                    critical: section == SshSection::CriticalOption,
                    value,
                },
            ))
        })
        .collect()
}

fn section_from_certificate<'a>(
    entries: impl IntoIterator<Item = (&'a String, &'a String)>,
    section: SshSection,
) -> ExtensionSet {
    entries
        .into_iter()
        .filter_map(|(name, data)| {
            let Some(kind) = ExtensionKind::from_name(name).filter(|k| k.ssh_section() == Some(section))
            else {
                debug!(name = %name, "Ignoring unknown OpenSSH certificate option");
                return None;
            };
            let value = if data.is_empty() {
                AttributeValue::Present
            } else {
                AttributeValue::Text(data.clone())
            };
            Some((
                kind,
                ExtensionValue {
                    critical: section == SshSection::CriticalOption,
                    value,
                },
            ))
        })
        .collect()
}

fn option_data(value: &ExtensionValue) -> String {
    match &value.value {
        AttributeValue::Text(s) => s.clone(),
        _ => String::new(),
    }
}

fn info(cert: &ssh_key::Certificate) -> BackendResult<CertificateInfo> {
    let principals = if cert.valid_principals().is_empty() {
        Principals::All
    } else {
        Principals::List(cert.valid_principals().to_vec())
    };
    Ok(CertificateInfo {
        kind: CertificateKind::Ssh,
        artifact: ArtifactKind::Certificate,
        public_key: public_handle(cert.public_key())?,
        serial_number: Some(SerialNumber::from(cert.serial())),
        subject: None,
        issuer: None,
        not_before: datetime(cert.valid_after()),
        not_after: datetime(cert.valid_before()),
        extensions: section_from_certificate(cert.extensions().iter(), SshSection::Extension),
        options: section_from_certificate(
            cert.critical_options().iter(),
            SshSection::CriticalOption,
        ),
        principals,
        key_id: Some(cert.key_id().to_string()).filter(|id| !id.is_empty()),
        cert_type: Some(match cert.cert_type() {
            CertType::User => SshCertType::User,
            CertType::Host => SshCertType::Host,
        }),
        digest: digest_of_signature(&cert.signature().algorithm()),
        revoked: Vec::new(),
    })
}

impl CertificateBackend for SshBackend {
    fn kind(&self) -> CertificateKind {
        CertificateKind::Ssh
    }

    fn load_order(&self) -> &'static [Encoding] {
        &LOAD_ORDER
    }

    fn default_encoding(&self) -> Encoding {
        Encoding::OpenSsh
    }

    fn generate_private_key(&self, algorithm: KeyAlgorithm) -> BackendResult<PrivateKey> {
        let key = ssh_key::PrivateKey::random(&mut OsRng, ssh_algorithm(algorithm))
            .map_err(crypto_err)?;
        private_handle(&key)
    }

    fn load_private_key(&self, bytes: &[u8], passphrase: Option<&str>) -> BackendResult<PrivateKey> {
        let key = ssh_key::PrivateKey::from_openssh(bytes)
            .map_err(|_| BackendError::Unrecognized { what: "private key" })?;
        let key = if key.is_encrypted() {
            let passphrase = passphrase.ok_or(BackendError::Encrypted)?;
            key.decrypt(passphrase)
                .map_err(|_| BackendError::WrongPassphrase)?
        } else {
            key
        };
        private_handle(&key)
    }

    fn encode_private_key(
        &self,
        key: &PrivateKey,
        passphrase: Option<&str>,
    ) -> BackendResult<Vec<u8>> {
        let Some(passphrase) = passphrase else {
            return Ok(key.encoded().to_vec());
        };
        let encrypted = ssh_private(key)?
            .encrypt(&mut OsRng, passphrase)
            .map_err(crypto_err)?;
        let text = encrypted.to_openssh(LineEnding::LF).map_err(crypto_err)?;
        Ok(text.as_bytes().to_vec())
    }

    fn load_public_key(&self, bytes: &[u8]) -> BackendResult<PublicKey> {
        let key = ssh_key::PublicKey::from_openssh(text(bytes, "public key")?)
            .map_err(|_| BackendError::Unrecognized { what: "public key" })?;
        public_handle(key.key_data())
    }

    fn derive_public_key(&self, key: &PrivateKey) -> BackendResult<PublicKey> {
        public_handle(ssh_private(key)?.public_key().key_data())
    }

    fn encode_public_key(&self, key: &PublicKey) -> BackendResult<Vec<u8>> {
        let mut out = key.encoded().to_vec();
        out.push(b'\n');
        Ok(out)
    }

    fn decode_certificate(
        &self,
        bytes: &[u8],
        encoding: Encoding,
        _passphrase: Option<&str>,
    ) -> BackendResult<LoadedArtifact> {
        if encoding != Encoding::OpenSsh {
            return Err(BackendError::UnsupportedEncoding(encoding));
        }
        let line = text(bytes, "certificate")?;
        let cert = ssh_key::Certificate::from_openssh(line)
            .map_err(|_| BackendError::Unrecognized { what: "certificate" })?;
        let certificate = Certificate {
            encoded: line.as_bytes().to_vec(),
            info: info(&cert)?,
        };
        Ok(LoadedArtifact::new(certificate, encoding, Vec::new()))
    }

    fn load_csr(&self, _bytes: &[u8]) -> BackendResult<Certificate> {
        Err(BackendError::invalid("csr", "OpenSSH has no signing requests"))
    }

    fn build_draft(
        &self,
        artifact: ArtifactKind,
        request: &ResolvedRequest,
        subject_key: &PublicKey,
        signer: &SignerIdentity,
    ) -> BackendResult<Draft> {
        if request.kind != CertificateKind::Ssh {
            return Err(BackendError::invalid("kind", "not an OpenSSH request"));
        }
        match artifact {
            ArtifactKind::Certificate => {}
            ArtifactKind::Csr => {
                return Err(BackendError::invalid("csr", "OpenSSH has no signing requests"));
            }
            ArtifactKind::Crl => {
                return Err(BackendError::invalid("revoked", "OpenSSH has no revocation lists"));
            }
        }
        if !request.append_certs.is_empty() {
            return Err(BackendError::invalid(
                "append_certs",
                "OpenSSH certificates cannot carry additional certificates",
            ));
        }
        // Parse early so a malformed key fails here, not at signing time
        ssh_public(subject_key)?;

        let principals = match &request.principals {
            Principals::List(names) if names.is_empty() => {
                return Err(BackendError::invalid(
                    "principals",
                    "no principal survived the signing policy; an empty list would allow every principal",
                ))
            }
            Principals::List(names) => Principals::List(names.clone()),
            Principals::All | Principals::Unspecified => Principals::All,
        };
        let (not_before, not_after) = validity(request)?;
        let serial = match &request.serial_number {
            Some(serial) => SerialNumber::from(serial.to_u64()),
            None => SerialNumber::from(OsRng.next_u64()),
        };

        let info = CertificateInfo {
            kind: CertificateKind::Ssh,
            artifact,
            public_key: subject_key.clone(),
            serial_number: Some(serial),
            subject: None,
            issuer: None,
            not_before: Some(not_before),
            not_after: Some(not_after),
            extensions: canonical_section(&request.extensions, SshSection::Extension)?,
            options: canonical_section(&request.options, SshSection::CriticalOption)?,
            principals,
            key_id: request.key_id.clone().filter(|id| !id.is_empty()),
            cert_type: Some(request.cert_type.unwrap_or_default()),
            digest: signing_digest(signer.public_key.algorithm(), request.digest)?,
            revoked: Vec::new(),
        };
        debug!(
            key_id = ?info.key_id,
            principals = ?info.principals,
            "Built OpenSSH certificate draft"
        );
        Ok(Draft {
            request: request.clone(),
            signer: signer.clone(),
            info,
        })
    }

    fn sign(
        &self,
        draft: &Draft,
        key: &PrivateKey,
        digest: Option<Digest>,
    ) -> BackendResult<Certificate> {
        signing_digest(key.algorithm(), digest.or(draft.request.digest))?;
        let ca = ssh_private(key)?;
        if public_handle(ca.public_key().key_data())? != draft.signer.public_key {
            return Err(BackendError::invalid(
                "signing_private_key",
                "does not match the signer's public key",
            ));
        }
        let d = &draft.info;
        let subject = ssh_public(&d.public_key)?;
        let (Some(not_before), Some(not_after)) = (d.not_before, d.not_after) else {
            return Err(BackendError::invalid("validity", "draft has no validity period"));
        };

        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.key_data().clone(),
            timestamp(not_before)?,
            timestamp(not_after)?,
        )
        .map_err(crypto_err)?;
        builder
            .serial(d.serial_number.as_ref().map_or(0, SerialNumber::to_u64))
            .map_err(crypto_err)?;
        builder
            .key_id(d.key_id.clone().unwrap_or_default())
            .map_err(crypto_err)?;
        builder
            .cert_type(match d.cert_type.unwrap_or_default() {
                SshCertType::User => CertType::User,
                SshCertType::Host => CertType::Host,
            })
            .map_err(crypto_err)?;
        match &d.principals {
            Principals::List(names) => {
                for name in names {
                    builder.valid_principal(name.clone()).map_err(crypto_err)?;
                }
            }
            Principals::All | Principals::Unspecified => {
                builder.all_principals_valid().map_err(crypto_err)?;
            }
        }
        for (kind, value) in d.options.iter() {
            builder
                .critical_option(kind.name(), option_data(value))
                .map_err(crypto_err)?;
        }
        for (kind, value) in d.extensions.iter() {
            builder
                .extension(kind.name(), option_data(value))
                .map_err(crypto_err)?;
        }
        let cert = builder.sign(&ca).map_err(crypto_err)?;
        let encoded = cert.to_openssh().map_err(crypto_err)?;
        debug!(serial = cert.serial(), key_id = %cert.key_id(), "Signed OpenSSH certificate");
        Ok(Certificate {
            encoded: encoded.trim().as_bytes().to_vec(),
            info: info(&cert)?,
        })
    }

    fn verify_signature(&self, certificate: &Certificate, key: &PublicKey) -> bool {
        let Ok(ca) = ssh_public(key) else {
            return false;
        };
        let Ok(line) = text(&certificate.encoded, "certificate") else {
            return false;
        };
        let Ok(cert) = ssh_key::Certificate::from_openssh(line) else {
            return false;
        };
        let fingerprint = ca.fingerprint(HashAlg::Sha256);
        cert.signature_key() == ca.key_data()
            && cert
                .validate_at(cert.valid_after(), [&fingerprint])
                .is_ok()
    }

    fn encode(
        &self,
        certificate: &Certificate,
        encoding: Encoding,
        options: EncodeOptions<'_>,
    ) -> BackendResult<Vec<u8>> {
        if encoding != Encoding::OpenSsh {
            return Err(BackendError::UnsupportedEncoding(encoding));
        }
        if !options.chain.is_empty() {
            return Err(BackendError::invalid(
                "append_certs",
                "OpenSSH certificates cannot carry additional certificates",
            ));
        }
        let mut out = certificate.encoded.clone();
        out.push(b'\n');
        Ok(out)
    }
}
