//! Local issuance: key material loading, drafting, signing and the
//! serial-named side copy. Shared by the orchestrator and the CA server.

use std::path::{Component, Path, PathBuf};

use certpol_core::{
    load_certificate, ArtifactKind, Certificate, CertificateBackend, CertificateKind, Draft,
    EncodeOptions, Error, FilesystemError, Material, PrivateKey, PublicKey, ResolvedRequest,
    Result, ResultExt, SignerIdentity, Stage,
};
use tracing::{debug, info};

use crate::fs::FileSink;

/// Mode of serial-named copies
const COPY_MODE: u32 = 0o644;

/// CA key plus the identity it signs as
#[derive(Debug, Clone)]
pub struct SigningMaterial {
    pub key: PrivateKey,
    pub identity: SignerIdentity,
}

/// Public key a certificate is issued for, plus the private key when the
/// request supplied one
#[derive(Debug, Clone)]
pub struct SubjectKey {
    pub public: PublicKey,
    pub private: Option<PrivateKey>,
}

/// Local issuance with one backend and one file sink
#[derive(Clone, Copy)]
pub struct LocalIssuer<'a> {
    pub backend: &'a dyn CertificateBackend,
    pub fs: &'a dyn FileSink,
}

impl<'a> LocalIssuer<'a> {
    #[must_use]
    pub fn new(backend: &'a dyn CertificateBackend, fs: &'a dyn FileSink) -> Self {
        Self { backend, fs }
    }

    /// Bytes of a piece of key or certificate material
    pub async fn read(&self, material: &Material, stage: Stage) -> Result<Vec<u8>> {
        match material {
            Material::Inline(bytes) => Ok(bytes.clone()),
            Material::Path(path) => self.fs.read(path).await.stage(stage),
        }
    }

    /// Load the CA key and certificate a request names. `None` when the
    /// request carries no signing key.
    pub async fn signer(&self, request: &ResolvedRequest) -> Result<Option<SigningMaterial>> {
        let Some(material) = &request.signing_private_key else {
            return Ok(None);
        };
        let bytes = self.read(material, Stage::LoadingSigningKey).await?;
        let key = self
            .backend
            .load_private_key(&bytes, request.signing_private_key_passphrase.as_deref())
            .stage(Stage::LoadingSigningKey)?;
        let public_key = self
            .backend
            .derive_public_key(&key)
            .stage(Stage::DerivingPublicKey)?;
        let certificate = self.signing_cert(request).await?;
        Ok(Some(SigningMaterial {
            key,
            identity: SignerIdentity {
                public_key,
                certificate,
            },
        }))
    }

    /// The CA certificate named by `signing_cert`, X.509 only
    pub async fn signing_cert(&self, request: &ResolvedRequest) -> Result<Option<Certificate>> {
        let Some(material) = &request.signing_cert else {
            return Ok(None);
        };
        if request.kind != CertificateKind::X509 {
            return Ok(None);
        }
        let bytes = self.read(material, Stage::LoadingSigningCert).await?;
        let loaded =
            load_certificate(self.backend, &bytes, None).stage(Stage::LoadingSigningCert)?;
        Ok(Some(loaded.certificate))
    }

    /// Public identity of the signer without access to its private key:
    /// from `signing_public_key`, else from the CA certificate.
    pub async fn signer_identity(&self, request: &ResolvedRequest) -> Result<Option<SignerIdentity>> {
        let certificate = self.signing_cert(request).await?;
        let public_key = match (&request.signing_public_key, &certificate) {
            (Some(material), _) => {
                let bytes = self.read(material, Stage::LoadingSigningKey).await?;
                self.backend
                    .load_public_key(&bytes)
                    .stage(Stage::LoadingSigningKey)?
            }
            (None, Some(cert)) => cert.info.public_key.clone(),
            (None, None) => return Ok(None),
        };
        Ok(Some(SignerIdentity {
            public_key,
            certificate,
        }))
    }

    /// Subject public key: explicit public key, else derived from the
    /// private key, else taken from the CSR, else the signer's own key
    /// (self-signed).
    pub async fn subject_key(
        &self,
        request: &ResolvedRequest,
        signer: &PublicKey,
    ) -> Result<SubjectKey> {
        let stage = Stage::DerivingPublicKey;
        if let Some(material) = &request.public_key {
            let bytes = self.read(material, stage).await?;
            let public = self.backend.load_public_key(&bytes).stage(stage)?;
            return Ok(SubjectKey {
                public,
                private: None,
            });
        }
        if let Some(material) = &request.private_key {
            let bytes = self.read(material, stage).await?;
            let private = self
                .backend
                .load_private_key(&bytes, request.private_key_passphrase.as_deref())
                .stage(stage)?;
            let public = self.backend.derive_public_key(&private).stage(stage)?;
            return Ok(SubjectKey {
                public,
                private: Some(private),
            });
        }
        if let Some(material) = &request.csr {
            let bytes = self.read(material, stage).await?;
            let csr = self.backend.load_csr(&bytes).stage(stage)?;
            return Ok(SubjectKey {
                public: csr.info.public_key,
                private: None,
            });
        }
        debug!("No subject key given, issuing self-signed");
        Ok(SubjectKey {
            public: signer.clone(),
            private: None,
        })
    }

    /// Certificates to append after the issued one, in order
    pub async fn chain(&self, request: &ResolvedRequest) -> Result<Vec<Certificate>> {
        let mut out = Vec::new();
        for material in &request.append_certs {
            let bytes = self.read(material, Stage::LoadingExisting).await?;
            let loaded =
                load_certificate(self.backend, &bytes, None).stage(Stage::LoadingExisting)?;
            out.push(loaded.certificate);
            out.extend(loaded.chain);
        }
        Ok(out)
    }

    /// Sign a draft and write the side copy the request asks for
    pub async fn sign(
        &self,
        draft: &Draft,
        key: &PrivateKey,
    ) -> Result<Certificate> {
        let request = &draft.request;
        let cert = self
            .backend
            .sign(draft, key, request.digest)
            .stage(Stage::Signing)?;
        info!(
            serial = ?cert.info.serial_number.as_ref().map(ToString::to_string),
            kind = %request.kind,
            "Issued certificate"
        );
        if let Some(dir) = &request.copypath {
            self.write_copy(dir, &cert, request.prepend_cn).await?;
        }
        Ok(cert)
    }

    /// Load everything, draft and sign. The CA server's issuance path.
    pub async fn issue(&self, request: &ResolvedRequest) -> Result<Certificate> {
        let signing = self.signer(request).await?.ok_or(Error::MissingSigningKey)?;
        let subject = self.subject_key(request, &signing.identity.public_key).await?;
        let draft = self
            .backend
            .build_draft(
                ArtifactKind::Certificate,
                request,
                &subject.public,
                &signing.identity,
            )
            .stage(Stage::BuildingDraft)?;
        self.sign(&draft, &signing.key).await
    }

    /// Write `<dir>/[<CN>-]<serial>.crt` (`.cert` for OpenSSH). The name
    /// must stay a single plain component of `dir`.
    pub async fn write_copy(
        &self,
        dir: &Path,
        cert: &Certificate,
        prepend_cn: bool,
    ) -> Result<PathBuf> {
        let name = copy_name(cert, prepend_cn);
        let mut components = Path::new(&name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(Error::from(FilesystemError::UnsafeName { name }).at(Stage::WritingCopy));
        }
        let path = dir.join(name);
        let bytes = self
            .backend
            .encode(cert, self.backend.default_encoding(), EncodeOptions::default())
            .stage(Stage::WritingCopy)?;
        self.fs
            .write_atomic(&path, &bytes, COPY_MODE)
            .await
            .stage(Stage::WritingCopy)?;
        debug!(path = %path.display(), "Wrote certificate copy");
        Ok(path)
    }
}

/// File name of a serial-named copy. The CN is requester-controlled on a
/// CA, so separators and control characters in it become `_`.
#[must_use]
pub fn copy_name(cert: &Certificate, prepend_cn: bool) -> String {
    let serial = cert
        .info
        .serial_number
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    let serial = match serial.trim_start_matches('0') {
        "" => "0",
        trimmed => trimmed,
    };
    let extension = match cert.info.kind {
        CertificateKind::X509 => "crt",
        CertificateKind::Ssh => "cert",
    };
    let prefix = match cert.info.common_name().map(file_safe) {
        Some(cn) if prepend_cn && !cn.is_empty() => format!("{cn}-"),
        _ => String::new(),
    };
    format!("{prefix}{serial}.{extension}")
}

fn file_safe(cn: &str) -> String {
    let cn: String = cn
        .chars()
        .map(|c| if matches!(c, '/' | '\\') || c.is_control() { '_' } else { c })
        .collect();
    match cn.trim_matches('.') {
        "" => String::new(),
        _ => cn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;
    use certpol_backend::X509Backend;
    use certpol_core::{CertificateRequest, KeyAlgorithm, NameAttribute};

    fn ca_request(dir: &Path) -> (CertificateRequest, X509Backend) {
        let backend = X509Backend::new();
        let key = backend.generate_private_key(KeyAlgorithm::EcdsaP256).unwrap();
        let pem = backend.encode_private_key(&key, None).unwrap();
        let key_path = dir.join("ca.key");
        std::fs::write(&key_path, pem).unwrap();

        let mut req = CertificateRequest::x509();
        req.signing_private_key = Some(Material::Path(key_path));
        req.name_attributes = vec![(NameAttribute::CN, "ca.example".into())];
        (req, backend)
    }

    #[tokio::test]
    async fn test_self_signed_issue_with_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (mut req, backend) = ca_request(dir.path());
        req.copypath = Some(dir.path().join("issued"));
        req.prepend_cn = true;
        let fs = LocalFs::new();
        let issuer = LocalIssuer::new(&backend, &fs);

        let cert = issuer
            .issue(&ResolvedRequest::unrestricted(req))
            .await
            .unwrap();
        assert_eq!(cert.info.subject, cert.info.issuer);

        let copy = dir.path().join("issued").join(copy_name(&cert, true));
        assert!(copy.file_name().unwrap().to_string_lossy().starts_with("ca.example-"));
        let on_disk = std::fs::read(&copy).unwrap();
        let loaded = load_certificate(&backend, &on_disk, None).unwrap();
        assert_eq!(loaded.certificate, cert);
    }

    #[tokio::test]
    async fn test_copy_name_cannot_leave_copypath() {
        let dir = tempfile::tempdir().unwrap();
        let (mut req, backend) = ca_request(dir.path());
        req.name_attributes = vec![(NameAttribute::CN, "../../x\\y".into())];
        req.copypath = Some(dir.path().join("a").join("issued"));
        req.prepend_cn = true;
        let fs = LocalFs::new();
        let cert = LocalIssuer::new(&backend, &fs)
            .issue(&ResolvedRequest::unrestricted(req))
            .await
            .unwrap();

        let name = copy_name(&cert, true);
        assert!(name.starts_with(".._.._x_y-"), "{name}");
        let written: Vec<_> = std::fs::read_dir(dir.path().join("a").join("issued"))
            .unwrap()
            .collect();
        assert_eq!(written.len(), 1);
        assert!(!dir.path().join("x").exists());
    }

    #[test]
    fn test_dot_only_cn_is_dropped() {
        assert_eq!(file_safe(".."), "");
        assert_eq!(file_safe("."), "");
        assert_eq!(file_safe("www.example.com"), "www.example.com");
        assert_eq!(file_safe("a/b"), "a_b");
    }

    #[tokio::test]
    async fn test_missing_signing_key() {
        let backend = X509Backend::new();
        let fs = LocalFs::new();
        let err = LocalIssuer::new(&backend, &fs)
            .issue(&ResolvedRequest::unrestricted(CertificateRequest::x509()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingSigningKey));
    }

    #[tokio::test]
    async fn test_unreadable_signing_key_has_stage() {
        let backend = X509Backend::new();
        let fs = LocalFs::new();
        let mut req = CertificateRequest::x509();
        req.signing_private_key = Some(Material::Path("/nonexistent/ca.key".into()));
        let err = LocalIssuer::new(&backend, &fs)
            .issue(&ResolvedRequest::unrestricted(req))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::LoadingSigningKey));
    }

    #[tokio::test]
    async fn test_subject_key_from_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let (mut req, backend) = ca_request(dir.path());
        let leaf = backend.generate_private_key(KeyAlgorithm::Ed25519).unwrap();
        req.private_key = Some(Material::Inline(backend.encode_private_key(&leaf, None).unwrap()));
        let fs = LocalFs::new();
        let issuer = LocalIssuer::new(&backend, &fs);
        let resolved = ResolvedRequest::unrestricted(req);
        let signing = issuer.signer(&resolved).await.unwrap().unwrap();
        let subject = issuer
            .subject_key(&resolved, &signing.identity.public_key)
            .await
            .unwrap();
        assert_eq!(subject.public, backend.derive_public_key(&leaf).unwrap());
        assert!(subject.private.is_some());
    }
}
