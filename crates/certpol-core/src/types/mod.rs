//! Data model shared by the engines, the backends and the orchestrator.

mod attribute;
mod changeset;
mod envelope;
mod extension;
mod name;
mod policy;
mod request;
mod revocation;

pub use attribute::AttributeValue;
pub use changeset::{ChangeSet, PrincipalsDiff, ALL_PRINCIPALS};
pub use envelope::{
    PeerReplyEnvelope, PeerRequestEnvelope, PolicyDescription, ReplyData, SIGN_PROCEDURE,
};
pub use extension::{Allowed, ExtensionKind, ExtensionSet, ExtensionValue, SshSection};
pub use name::{DistinguishedName, NameAttribute, SubjectSpec};
pub use policy::{PolicyOverrides, SigningPolicy};
pub use request::{
    ArtifactKind, CertificateKind, CertificateRequest, Digest, Encoding, KeyAlgorithm, Material,
    Principals, ResolvedRequest, SerialNumber, SshCertType,
};
pub use revocation::{Revocation, RevocationReason, RevocationsDiff, RevokedCertificate};
