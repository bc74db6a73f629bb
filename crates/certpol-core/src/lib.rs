//! # certpol-core
//!
//! Signing-policy merge and change-detection engines for X.509 and OpenSSH
//! certificates.
//!
//! ## Architecture
//!
//! ```text
//! CertificateRequest ──merge(policy)──▶ ResolvedRequest
//!                                            │
//!                                  CertificateBackend::build_draft
//!                                            │
//! LoadedArtifact ◀───────detect────────── Draft ──sign──▶ Certificate
//!        │
//!        └── ChangeSet: empty → no-op, metadata only → re-encode, else reissue
//! ```
//!
//! Both engines are pure. They never fail and never touch the filesystem or
//! the network; cryptography sits behind the [`CertificateBackend`] trait.
//!
//! ## Example
//!
//! ```rust,ignore
//! use certpol_core::{merge, detect, DesiredArtifact, DetectOptions};
//!
//! let resolved = merge(Some(&policy), &request);
//! let draft = backend.build_draft(ArtifactKind::Certificate, &resolved, &key, &signer)?;
//! let changes = detect(&*backend, &existing, &DesiredArtifact::new(&draft, Encoding::Pem), &options);
//! if changes.is_empty() {
//!     return Ok(());
//! }
//! ```

mod backend;
mod compare;
mod detect;
mod error;
mod merge;
mod serde_b64;
pub mod types;

pub use backend::{
    load_certificate, BackendResult, Certificate, CertificateBackend, CertificateInfo, Draft,
    EncodeOptions, LoadedArtifact, PrivateKey, PublicKey, SignerIdentity,
};
pub use compare::{compare, ExtensionDiff};
pub use detect::{detect, DesiredArtifact, DetectOptions};
pub use error::{
    BackendError, Error, FilesystemError, PolicyError, Result, ResultExt, Stage, TransportError,
};
pub use merge::merge;
pub use types::*;
