use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::Encoding;

/// Result type alias for certpol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while looking up or authorizing a signing policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// The named policy does not exist in the policy store
    #[error("signing_policy must be specified and defined on signing minion")]
    NotFound {
        /// Name the requester asked for
        name: String,
    },

    /// The requester identity did not satisfy the policy's matcher
    #[error("requester not permitted to use specified signing policy")]
    RequesterNotPermitted,

    /// The policy restricts requesters but the request carried no verified identity
    #[error("requester sending this request could not be identified")]
    RequesterUnidentified,

    /// A compound matcher expression was configured but no trusted matcher is available
    #[error("compound requester matching is not available on this node")]
    MatcherUnavailable,
}

/// Errors raised by a certificate backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// A passphrase is required but none was supplied
    #[error("input is encrypted and no passphrase was supplied")]
    Encrypted,

    /// The supplied passphrase did not decrypt the key
    #[error("wrong passphrase for encrypted input")]
    WrongPassphrase,

    /// Input did not parse in any supported format
    #[error("could not load {what}: unrecognized format")]
    Unrecognized {
        /// What was being loaded (private key, certificate, ...)
        what: &'static str,
    },

    /// The resolved request cannot be turned into a draft
    #[error("invalid value for {field}: {reason}")]
    InvalidSpec {
        /// Offending request field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Digest name is unknown or unusable with the signing key
    #[error("unsupported digest: {0}")]
    UnsupportedDigest(String),

    /// The backend cannot read or write this encoding
    #[error("encoding {0} is not supported by this backend")]
    UnsupportedEncoding(Encoding),

    /// Underlying cryptographic library failure
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl BackendError {
    /// Shorthand for [`BackendError::InvalidSpec`]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while talking to a remote CA peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel returned nothing for the peer (unreachable, unauthorized or timed out)
    #[error("ca_server {peer} did not respond, it might be missing or the request was not authorized")]
    NoResponse {
        /// Peer that was called
        peer: String,
    },

    /// The reply did not have the envelope shape
    #[error("ca_server returned a malformed reply: {0}")]
    MalformedReply(String),

    /// The peer answered with errors
    #[error("ca_server reported errors:\n{}", .messages.join("\n"))]
    RemoteError {
        /// Messages reported by the peer
        messages: Vec<String>,
    },
}

/// Errors raised by the file sink
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Target is a symlink and the caller did not opt in to replacing it
    #[error("{} is a symlink, refusing to replace it without overwrite_symlink", .path.display())]
    SymlinkNotAllowed {
        /// Target path
        path: PathBuf,
    },

    /// A file name derived from certificate contents is not a plain name
    #[error("refusing to write {name:?}: not a plain file name")]
    UnsafeName {
        /// Offending name
        name: String,
    },

    /// Read, write or permission change failed
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Step of the issuance workflow an error surfaced in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Policy lookup (local store or remote policy fetch)
    LoadingPolicy,
    /// Loading the CA private key
    LoadingSigningKey,
    /// Loading the CA certificate
    LoadingSigningCert,
    /// Deriving the subject public key
    DerivingPublicKey,
    /// Reading the artifact already on disk
    LoadingExisting,
    /// Creating a managed private key
    GeneratingKey,
    /// Reading certificates listed for revocation
    LoadingRevoked,
    /// Assembling the unsigned draft
    BuildingDraft,
    /// Signing the draft
    Signing,
    /// Serializing the artifact
    Encoding,
    /// Writing the target artifact
    WritingArtifact,
    /// Writing the copypath side copy
    WritingCopy,
    /// Talking to a remote CA
    RequestingPeer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LoadingPolicy => "while loading signing policy",
            Self::LoadingSigningKey => "while loading signing key",
            Self::LoadingSigningCert => "while loading signing certificate",
            Self::DerivingPublicKey => "while deriving public key",
            Self::LoadingExisting => "while loading existing artifact",
            Self::GeneratingKey => "while generating private key",
            Self::LoadingRevoked => "while loading revoked certificates",
            Self::BuildingDraft => "while building draft",
            Self::Signing => "while signing",
            Self::Encoding => "while encoding",
            Self::WritingArtifact => "while writing artifact",
            Self::WritingCopy => "while writing copy",
            Self::RequestingPeer => "while requesting remote signing",
        };
        f.write_str(s)
    }
}

/// Stands in for CA-side failures whose text may name local paths
const CA_SIDE_FAILURE: &str = "failed on the CA server. See CA server log for details.";

/// Top-level error for certpol operations
#[derive(Error, Debug)]
pub enum Error {
    /// Policy lookup or authorization failed
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Certificate backend failed
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Peer protocol failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// File sink failed
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    /// Local issuance without a remote CA and without a signing key
    #[error("no signing_private_key configured and no ca_server given")]
    MissingSigningKey,

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),

    /// Wire payload could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another error, annotated with the stage it happened in
    #[error("{stage}: {source}")]
    Stage {
        /// Where it happened
        stage: Stage,
        /// What happened
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with stage context. Errors that already carry a stage keep it.
    #[must_use]
    pub fn at(self, stage: Stage) -> Self {
        match self {
            Self::Stage { .. } => self,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The error with any stage context stripped
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// The stage this error surfaced in, if recorded
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Returns true if retrying the same call later may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::Transport(TransportError::NoResponse { .. })
                | Self::Filesystem(FilesystemError::Io { .. })
        )
    }

    /// Returns true if the error came from policy lookup or authorization
    #[must_use]
    pub fn is_policy_error(&self) -> bool {
        matches!(self.root(), Self::Policy(_))
    }

    /// Messages suitable for a remote requester. Stage context is kept.
    /// Filesystem, configuration and crypto library failures are replaced
    /// by a generic message since their text can name files on this node.
    #[must_use]
    pub fn remote_messages(&self) -> Vec<String> {
        match self.root() {
            Self::Transport(TransportError::RemoteError { messages }) => messages.clone(),
            Self::Filesystem(_) | Self::Config(_) | Self::Backend(BackendError::Crypto(_)) => {
                vec![match self.stage() {
                    Some(stage) => format!("{stage}: {CA_SIDE_FAILURE}"),
                    None => CA_SIDE_FAILURE.to_string(),
                }]
            }
            _ => vec![self.to_string()],
        }
    }
}

/// Attach stage context to fallible results
pub trait ResultExt<T> {
    /// Convert the error and record the stage it happened in
    fn stage(self, stage: Stage) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: Stage) -> Result<T> {
        self.map_err(|e| e.into().at(stage))
    }
}
