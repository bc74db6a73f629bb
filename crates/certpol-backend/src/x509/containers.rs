//! Certificate containers: PKCS#7 certificate bundles (cms) and PKCS#12
//! key stores (p12-keystore).

use certpol_core::{BackendError, BackendResult, Certificate, Encoding, LoadedArtifact, PrivateKey};
use cms::cert::CertificateChoices;
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{CertificateSet, EncapsulatedContentInfo, SignedData, SignerInfos};
use p12_keystore::{KeyStore, KeyStoreEntry, PrivateKeyChain};
use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use tracing::debug;
use x509_cert::der::asn1::{ObjectIdentifier, SetOfVec};
use x509_cert::der::{Any, Decode, Encode};

use super::{parse, to_pem};
use crate::crypto_err;

pub(super) const TAG_PKCS7: &str = "PKCS7";

const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");

/// Alias prefix of certificates stored next to the key chain
const CHAIN_ALIAS: &str = "chain";

fn certificate(der: Vec<u8>) -> BackendResult<Certificate> {
    let info = parse::certificate(&der)?;
    Ok(Certificate { encoded: der, info })
}

/// Order a bag of certificates as leaf first, then up the issuer links.
///
/// The leaf is the certificate that issued none of the others. Anything
/// not on the leaf's path keeps its original position after the path.
fn leaf_first(mut certs: Vec<Certificate>) -> Vec<Certificate> {
    let issued_other = |c: &Certificate, all: &[Certificate]| {
        all.iter()
            .any(|o| o.encoded != c.encoded && o.info.issuer == c.info.subject)
    };
    let Some(leaf) = certs.iter().position(|c| !issued_other(c, &certs)) else {
        return certs;
    };
    let mut ordered = vec![certs.remove(leaf)];
    loop {
        let current = &ordered[ordered.len() - 1];
        if current.info.issuer == current.info.subject {
            break;
        }
        match certs.iter().position(|c| c.info.subject == current.info.issuer) {
            Some(next) => ordered.push(certs.remove(next)),
            None => break,
        }
    }
    ordered.extend(certs);
    ordered
}

/// PKCS#7 SignedData with no signers carrying `certificate` and `chain`
pub(super) fn encode_pkcs7(certificate: &Certificate, chain: &[Certificate]) -> BackendResult<Vec<u8>> {
    let choices = std::iter::once(certificate)
        .chain(chain)
        .map(|c| {
            x509_cert::Certificate::from_der(&c.encoded)
                .map(CertificateChoices::Certificate)
                .map_err(crypto_err)
        })
        .collect::<BackendResult<Vec<_>>>()?;
    let signed = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::new(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet(SetOfVec::try_from(choices).map_err(crypto_err)?)),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::new()),
    };
    let info = ContentInfo {
        content_type: ID_SIGNED_DATA,
        content: Any::encode_from(&signed).map_err(crypto_err)?,
    };
    let der = info.to_der().map_err(crypto_err)?;
    Ok(to_pem(TAG_PKCS7, &der).into_bytes())
}

/// Read a PKCS#7 bundle in PEM or DER form
pub(super) fn decode_pkcs7(bytes: &[u8]) -> BackendResult<LoadedArtifact> {
    let unrecognized = || BackendError::Unrecognized { what: "pkcs7" };
    let der = match pem::parse(bytes) {
        Ok(block) if block.tag() == TAG_PKCS7 => block.into_contents(),
        Ok(_) => return Err(unrecognized()),
        Err(_) => bytes.to_vec(),
    };
    let info = ContentInfo::from_der(&der).map_err(|_| unrecognized())?;
    if info.content_type != ID_SIGNED_DATA {
        return Err(unrecognized());
    }
    let signed = SignedData::from_der(&info.content.to_der().map_err(crypto_err)?)
        .map_err(|_| unrecognized())?;
    let certs = signed
        .certificates
        .map(|set| set.0.into_vec())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|choice| match choice {
            CertificateChoices::Certificate(cert) => Some(cert),
            CertificateChoices::Other(_) => None,
        })
        .map(|cert| certificate(cert.to_der().map_err(crypto_err)?))
        .collect::<BackendResult<Vec<_>>>()?;

    let mut ordered = leaf_first(certs).into_iter();
    let leaf = ordered.next().ok_or_else(unrecognized)?;
    Ok(LoadedArtifact::new(leaf, Encoding::Pkcs7, ordered.collect()))
}

/// Outer PFX shape: a sequence starting with version 3
fn is_pfx(bytes: &[u8]) -> bool {
    yasna::parse_ber(bytes, |r| {
        r.read_sequence(|r| {
            let version = r.next().read_u8()?;
            r.next().read_der()?;
            r.read_optional(|r| r.read_der())?;
            Ok(version)
        })
    })
    .is_ok_and(|version| version == 3)
}

/// PKCS#12 store holding `key` with `certificate`, plus `chain` as
/// separate certificate entries.
pub(super) fn encode_pkcs12(
    certificate: &Certificate,
    chain: &[Certificate],
    key: Option<&PrivateKey>,
    passphrase: Option<&str>,
    friendly_name: Option<&str>,
) -> BackendResult<Vec<u8>> {
    let key = key.ok_or_else(|| {
        BackendError::invalid("private_key", "PKCS#12 output needs the private key")
    })?;
    let leaf = p12_keystore::Certificate::from_der(&certificate.encoded).map_err(crypto_err)?;
    let alias = friendly_name.map_or_else(|| leaf.subject().to_string(), str::to_string);
    let local_key_id = digest(&SHA1_FOR_LEGACY_USE_ONLY, &certificate.encoded);

    let mut store = KeyStore::new();
    store.add_entry(
        &alias,
        KeyStoreEntry::PrivateKeyChain(PrivateKeyChain::new(
            key.encoded(),
            local_key_id.as_ref(),
            [leaf],
        )),
    );
    for (i, extra) in chain.iter().enumerate() {
        let cert = p12_keystore::Certificate::from_der(&extra.encoded).map_err(crypto_err)?;
        store.add_entry(&format!("{CHAIN_ALIAS}-{i:03}"), KeyStoreEntry::Certificate(cert));
    }
    store.writer(passphrase.unwrap_or_default()).write().map_err(crypto_err)
}

/// Read a PKCS#12 store.
///
/// Without a passphrase only unprotected stores open. A store that opens
/// with the empty passphrase while one was given counts as unprotected.
pub(super) fn decode_pkcs12(bytes: &[u8], passphrase: Option<&str>) -> BackendResult<LoadedArtifact> {
    if !is_pfx(bytes) {
        return Err(BackendError::Unrecognized { what: "pkcs12" });
    }
    let given = passphrase.filter(|p| !p.is_empty());
    let (store, protected) = match (KeyStore::from_pkcs12(bytes, given.unwrap_or_default()), given) {
        (Ok(store), _) => (store, given.is_some()),
        (Err(e), None) => {
            debug!(error = %e, "PKCS#12 store did not open without a passphrase");
            return Err(BackendError::Encrypted);
        }
        (Err(e), Some(_)) => match KeyStore::from_pkcs12(bytes, "") {
            Ok(store) => (store, false),
            Err(_) => {
                debug!(error = %e, "PKCS#12 store did not open with the given passphrase");
                return Err(BackendError::WrongPassphrase);
            }
        },
    };

    let (alias, key_chain) = store
        .private_key_chain()
        .ok_or(BackendError::Unrecognized { what: "pkcs12" })?;
    let mut chain_certs = key_chain.chain().iter();
    let leaf = chain_certs
        .next()
        .ok_or(BackendError::Unrecognized { what: "pkcs12" })?;
    let friendly_name = (alias != leaf.subject()).then(|| alias.to_string());

    let mut extras: Vec<(&str, &p12_keystore::Certificate)> = store
        .entries()
        .filter_map(|(name, entry)| match entry {
            KeyStoreEntry::Certificate(cert) => Some((AsRef::<str>::as_ref(name), cert)),
            _ => None,
        })
        .collect();
    extras.sort_by(|a, b| a.0.cmp(b.0));

    let chain = chain_certs
        .chain(extras.into_iter().map(|(_, cert)| cert))
        .map(|cert| certificate(cert.as_der().to_vec()))
        .collect::<BackendResult<Vec<_>>>()?;
    Ok(LoadedArtifact {
        certificate: certificate(leaf.as_der().to_vec())?,
        encoding: Encoding::Pkcs12,
        chain,
        friendly_name,
        protected,
    })
}
