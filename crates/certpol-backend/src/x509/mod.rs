//! X.509 backend built on rcgen (building and signing) and x509-parser
//! (parsing and signature verification).

mod containers;
mod crl;
mod extensions;
mod keys;
mod parse;

use certpol_core::{
    ArtifactKind, BackendError, BackendResult, Certificate, CertificateBackend, CertificateKind,
    CertificateRequest, Digest, Draft, EncodeOptions, Encoding, KeyAlgorithm, LoadedArtifact,
    NameAttribute,
    PrivateKey, PublicKey, ResolvedRequest, SerialNumber, SignerIdentity,
};
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DnType, Issuer, KeyPair, SignatureAlgorithm};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use self::keys::SubjectKey;
use crate::{crypto_err, validity};

const TAG_CERTIFICATE: &str = "CERTIFICATE";
const TAG_CSR: &str = "CERTIFICATE REQUEST";
const TAG_CSR_LEGACY: &str = "NEW CERTIFICATE REQUEST";

/// PEM block with LF line endings
pub(crate) fn to_pem(tag: &str, der: &[u8]) -> String {
    pem::encode_config(
        &pem::Pem::new(tag, der.to_vec()),
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

/// X.509 certificates, CSRs and CRLs
#[derive(Debug, Clone, Copy, Default)]
pub struct X509Backend;

impl X509Backend {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Signature algorithm and recorded digest for a signing key.
///
/// Ed25519 ignores the requested digest. ECDSA keys sign with the digest
/// matching their curve. RSA keys sign with SHA-256 unless told otherwise.
fn signature_algorithm(
    key: KeyAlgorithm,
    requested: Option<Digest>,
) -> BackendResult<(&'static SignatureAlgorithm, Option<Digest>)> {
    match (key, requested) {
        (KeyAlgorithm::Ed25519, _) => Ok((&rcgen::PKCS_ED25519, None)),
        (KeyAlgorithm::EcdsaP256, None | Some(Digest::Sha256)) => {
            Ok((&rcgen::PKCS_ECDSA_P256_SHA256, Some(Digest::Sha256)))
        }
        (KeyAlgorithm::EcdsaP384, None | Some(Digest::Sha384)) => {
            Ok((&rcgen::PKCS_ECDSA_P384_SHA384, Some(Digest::Sha384)))
        }
        (KeyAlgorithm::Rsa, None | Some(Digest::Sha256)) => {
            Ok((&rcgen::PKCS_RSA_SHA256, Some(Digest::Sha256)))
        }
        (KeyAlgorithm::Rsa, Some(Digest::Sha384)) => Ok((&rcgen::PKCS_RSA_SHA384, Some(Digest::Sha384))),
        (KeyAlgorithm::Rsa, Some(Digest::Sha512)) => Ok((&rcgen::PKCS_RSA_SHA512, Some(Digest::Sha512))),
        (_, Some(digest)) => Err(BackendError::UnsupportedDigest(digest.to_string())),
    }
}

fn random_serial() -> BackendResult<SerialNumber> {
    let mut bytes = [0u8; 16];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| BackendError::Crypto("random number generator failed".into()))?;
    // positive and full width
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    Ok(SerialNumber::from_bytes(&bytes))
}

fn offset(t: DateTime<Utc>) -> BackendResult<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(t.timestamp())
        .map_err(|e| BackendError::invalid("validity", e.to_string()))
}

fn dn_type(attr: NameAttribute) -> DnType {
    match attr {
        NameAttribute::C => DnType::CountryName,
        NameAttribute::ST => DnType::StateOrProvinceName,
        NameAttribute::L => DnType::LocalityName,
        NameAttribute::O => DnType::OrganizationName,
        NameAttribute::OU => DnType::OrganizationalUnitName,
        NameAttribute::CN => DnType::CommonName,
        other => DnType::CustomDnType(
            other
                .oid()
                .split('.')
                .filter_map(|arc| arc.parse().ok())
                .collect(),
        ),
    }
}

fn distinguished_name(request: &CertificateRequest) -> BackendResult<rcgen::DistinguishedName> {
    let mut dn = match &request.subject {
        Some(subject) => subject
            .to_dn()
            .map_err(|e| BackendError::invalid("subject", e))?,
        None => certpol_core::DistinguishedName::new(),
    };
    for (attr, value) in &request.name_attributes {
        dn.push(*attr, value.clone());
    }
    let mut out = rcgen::DistinguishedName::new();
    for (attr, value) in dn.iter() {
        out.push(dn_type(attr), value);
    }
    Ok(out)
}

fn params(
    request: &CertificateRequest,
    serial: Option<&SerialNumber>,
    validity: Option<(DateTime<Utc>, DateTime<Utc>)>,
    subject: &SubjectKey,
) -> BackendResult<CertificateParams> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(request)?;
    if let Some((not_before, not_after)) = validity {
        params.not_before = offset(not_before)?;
        params.not_after = offset(not_after)?;
    }
    params.serial_number = serial.map(|s| rcgen::SerialNumber::from_slice(s.as_bytes()));
    extensions::apply(&mut params, &request.extensions, subject)?;
    Ok(params)
}

/// Sign `params` as a certificate for `subject`, issued by `ca` or by the
/// params' own name when there is no CA certificate.
fn issue(
    params: &CertificateParams,
    subject: &SubjectKey,
    ca: Option<&Certificate>,
    key: KeyPair,
) -> BackendResult<Vec<u8>> {
    let cert = match ca {
        Some(ca) => {
            let issuer = Issuer::from_ca_cert_pem(&to_pem(TAG_CERTIFICATE, &ca.encoded), key)
                .map_err(crypto_err)?;
            params.signed_by(subject, &issuer)
        }
        None => {
            let issuer = Issuer::from_params(params, key);
            params.signed_by(subject, &issuer)
        }
    }
    .map_err(crypto_err)?;
    Ok(cert.der().to_vec())
}

fn signer_algorithm(signer: &SignerIdentity) -> KeyAlgorithm {
    signer.public_key.algorithm()
}

/// Sign the revocation list described by `draft.info` with `pair`.
fn sign_crl(draft: &Draft, pair: KeyPair, derived: PublicKey) -> BackendResult<Certificate> {
    if derived != draft.signer.public_key {
        return Err(BackendError::invalid(
            "signing_private_key",
            "does not match the signer's public key",
        ));
    }
    let (this_update, next_update) = draft
        .info
        .not_before
        .zip(draft.info.not_after)
        .ok_or_else(|| BackendError::invalid("validity", "draft has no update window"))?;
    let number = draft
        .info
        .serial_number
        .clone()
        .ok_or_else(|| BackendError::invalid("serial_number", "draft has no CRL number"))?;
    let contents = crl::CrlContents {
        number: &number,
        this_update,
        next_update,
        revoked: &draft.info.revoked,
    };
    let der = crl::issue(&draft.request, &contents, draft.signer.certificate.as_ref(), pair)?;
    let mut info = parse::crl(&der)?;
    info.public_key = derived;
    debug!(
        number = %number,
        revoked = info.revoked.len(),
        "Signed X.509 revocation list"
    );
    Ok(Certificate { encoded: der, info })
}

impl CertificateBackend for X509Backend {
    fn kind(&self) -> CertificateKind {
        CertificateKind::X509
    }

    fn load_order(&self) -> &'static [Encoding] {
        &Encoding::X509_LOAD_ORDER
    }

    fn default_encoding(&self) -> Encoding {
        Encoding::Pem
    }

    fn generate_private_key(&self, algorithm: KeyAlgorithm) -> BackendResult<PrivateKey> {
        keys::generate(algorithm)
    }

    fn load_private_key(&self, bytes: &[u8], passphrase: Option<&str>) -> BackendResult<PrivateKey> {
        keys::load_private(bytes, passphrase)
    }

    fn encode_private_key(
        &self,
        key: &PrivateKey,
        passphrase: Option<&str>,
    ) -> BackendResult<Vec<u8>> {
        keys::encode_private(key, passphrase)
    }

    fn load_public_key(&self, bytes: &[u8]) -> BackendResult<PublicKey> {
        keys::load_public(bytes)
    }

    fn derive_public_key(&self, key: &PrivateKey) -> BackendResult<PublicKey> {
        keys::derive_public(key)
    }

    fn encode_public_key(&self, key: &PublicKey) -> BackendResult<Vec<u8>> {
        Ok(keys::encode_public(key))
    }

    fn decode_certificate(
        &self,
        bytes: &[u8],
        encoding: Encoding,
        passphrase: Option<&str>,
    ) -> BackendResult<LoadedArtifact> {
        let ders = match encoding {
            Encoding::Pem => pem::parse_many(bytes)
                .map_err(|_| BackendError::Unrecognized { what: "certificate" })?
                .into_iter()
                .filter(|block| block.tag() == TAG_CERTIFICATE)
                .map(pem::Pem::into_contents)
                .collect(),
            Encoding::Der => vec![bytes.to_vec()],
            Encoding::Pkcs7 => return containers::decode_pkcs7(bytes),
            Encoding::Pkcs12 => return containers::decode_pkcs12(bytes, passphrase),
            other => return Err(BackendError::UnsupportedEncoding(other)),
        };
        let mut certs = ders
            .into_iter()
            .map(|der| {
                let info = parse::certificate(&der)?;
                Ok(Certificate { encoded: der, info })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        if certs.is_empty() {
            return Err(BackendError::Unrecognized { what: "certificate" });
        }
        let leaf = certs.remove(0);
        Ok(LoadedArtifact::new(leaf, encoding, certs))
    }

    fn load_crl(&self, bytes: &[u8]) -> BackendResult<LoadedArtifact> {
        let encoding = if pem::parse(bytes).is_ok() { Encoding::Pem } else { Encoding::Der };
        Ok(LoadedArtifact::new(crl::load(bytes)?, encoding, Vec::new()))
    }

    fn load_csr(&self, bytes: &[u8]) -> BackendResult<Certificate> {
        let der = match pem::parse(bytes) {
            Ok(block) if block.tag() == TAG_CSR || block.tag() == TAG_CSR_LEGACY => {
                block.into_contents()
            }
            Ok(_) => return Err(BackendError::Unrecognized { what: "csr" }),
            Err(_) => bytes.to_vec(),
        };
        let info = parse::request(&der)?;
        Ok(Certificate { encoded: der, info })
    }

    /// Renders the draft through rcgen with a throwaway signing key and
    /// parses it back, so the draft's view matches what signing produces.
    fn build_draft(
        &self,
        artifact: ArtifactKind,
        request: &ResolvedRequest,
        subject_key: &PublicKey,
        signer: &SignerIdentity,
    ) -> BackendResult<Draft> {
        if request.kind != CertificateKind::X509 {
            return Err(BackendError::invalid("kind", "not an X.509 request"));
        }
        if !request.append_certs.is_empty() && !request.encoding.supports_chain() {
            return Err(BackendError::invalid(
                "append_certs",
                format!("{} output cannot carry additional certificates", request.encoding),
            ));
        }
        let subject = SubjectKey::from_public(subject_key)?;
        let throwaway = KeyPair::generate_for(&rcgen::PKCS_ED25519).map_err(crypto_err)?;

        let mut info = match artifact {
            ArtifactKind::Certificate => {
                let (_, digest) = signature_algorithm(signer_algorithm(signer), request.digest)?;
                let serial = match &request.serial_number {
                    Some(serial) => serial.clone(),
                    None => random_serial()?,
                };
                let params = params(request, Some(&serial), Some(validity(request)?), &subject)?;
                let der = issue(&params, &subject, signer.certificate.as_ref(), throwaway)?;
                let mut info = parse::certificate(&der)?;
                info.digest = digest;
                info
            }
            ArtifactKind::Csr => {
                let (_, digest) = signature_algorithm(subject_key.algorithm(), request.digest)?;
                let params = params(request, None, None, &subject)?;
                let csr = params.serialize_request(&throwaway).map_err(crypto_err)?;
                let mut info = parse::request(csr.der())?;
                info.digest = digest;
                info
            }
            ArtifactKind::Crl => {
                crl::check_extensions(request)?;
                let (_, digest) = signature_algorithm(signer_algorithm(signer), request.digest)?;
                let (this_update, next_update) = crl::update_window(request)?;
                let revoked = crl::revocations(request, this_update)?;
                let number = request.serial_number.clone().unwrap_or_else(|| SerialNumber::from(1u64));
                let contents = crl::CrlContents {
                    number: &number,
                    this_update,
                    next_update,
                    revoked: &revoked,
                };
                let der = crl::issue(request, &contents, signer.certificate.as_ref(), throwaway)?;
                let mut info = parse::crl(&der)?;
                info.digest = digest;
                info
            }
        };
        // a CRL carries its issuer's key
        info.public_key = subject_key.clone();

        debug!(
            artifact = ?artifact,
            subject = ?info.subject,
            extensions = info.extensions.len(),
            "Built X.509 draft"
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
        let (alg, _) = signature_algorithm(key.algorithm(), digest.or(draft.request.digest))?;
        let pair = keys::key_pair(key.encoded(), Some(alg))?;
        let derived = keys::derive_public(key)?;

        let subject = SubjectKey::from_public(&draft.info.public_key)?;
        let der = match draft.info.artifact {
            ArtifactKind::Certificate => {
                if derived != draft.signer.public_key {
                    return Err(BackendError::invalid(
                        "signing_private_key",
                        "does not match the signer's public key",
                    ));
                }
                let validity = draft
                    .info
                    .not_before
                    .zip(draft.info.not_after)
                    .ok_or_else(|| BackendError::invalid("validity", "draft has no validity period"))?;
                let params = params(
                    &draft.request,
                    draft.info.serial_number.as_ref(),
                    Some(validity),
                    &subject,
                )?;
                issue(&params, &subject, draft.signer.certificate.as_ref(), pair)?
            }
            ArtifactKind::Csr => {
                if derived != draft.info.public_key {
                    return Err(BackendError::invalid(
                        "private_key",
                        "does not match the CSR public key",
                    ));
                }
                let params = params(&draft.request, None, None, &subject)?;
                params
                    .serialize_request(&pair)
                    .map_err(crypto_err)?
                    .der()
                    .to_vec()
            }
            ArtifactKind::Crl => return sign_crl(draft, pair, derived),
        };

        let info = match draft.info.artifact {
            ArtifactKind::Csr => parse::request(&der)?,
            _ => parse::certificate(&der)?,
        };
        debug!(serial = ?info.serial_number.as_ref().map(ToString::to_string), "Signed X.509 artifact");
        Ok(Certificate { encoded: der, info })
    }

    fn verify_signature(&self, certificate: &Certificate, key: &PublicKey) -> bool {
        let Ok((_, spki)) = SubjectPublicKeyInfo::from_der(key.encoded()) else {
            return false;
        };
        match certificate.info.artifact {
            ArtifactKind::Certificate => x509_parser::parse_x509_certificate(&certificate.encoded)
                .is_ok_and(|(_, cert)| cert.verify_signature(Some(&spki)).is_ok()),
            ArtifactKind::Csr => {
                certificate.info.public_key == *key
                    && X509CertificationRequest::from_der(&certificate.encoded)
                        .is_ok_and(|(_, csr)| csr.verify_signature().is_ok())
            }
            ArtifactKind::Crl => crl::verify(&certificate.encoded, key),
        }
    }

    fn encode(
        &self,
        certificate: &Certificate,
        encoding: Encoding,
        options: EncodeOptions<'_>,
    ) -> BackendResult<Vec<u8>> {
        match encoding {
            Encoding::Pem => {
                let tag = match certificate.info.artifact {
                    ArtifactKind::Certificate => TAG_CERTIFICATE,
                    ArtifactKind::Csr => TAG_CSR,
                    ArtifactKind::Crl => crl::TAG_CRL,
                };
                let mut out = to_pem(tag, &certificate.encoded);
                for extra in options.chain {
                    out.push_str(&to_pem(TAG_CERTIFICATE, &extra.encoded));
                }
                Ok(out.into_bytes())
            }
            Encoding::Der => {
                if !options.chain.is_empty() {
                    return Err(BackendError::invalid(
                        "append_certs",
                        "DER output cannot carry additional certificates",
                    ));
                }
                Ok(certificate.encoded.clone())
            }
            Encoding::Pkcs7 | Encoding::Pkcs12 if certificate.info.artifact != ArtifactKind::Certificate => {
                Err(BackendError::invalid(
                    "encoding",
                    format!("{encoding} output holds certificates only"),
                ))
            }
            Encoding::Pkcs7 => containers::encode_pkcs7(certificate, options.chain),
            Encoding::Pkcs12 => containers::encode_pkcs12(
                certificate,
                options.chain,
                options.embed_key,
                options.passphrase,
                options.friendly_name,
            ),
            other => Err(BackendError::UnsupportedEncoding(other)),
        }
    }
}
