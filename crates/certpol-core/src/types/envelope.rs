//! Wire envelopes of the remote signing protocol.

use serde::{Deserialize, Serialize};

use super::{CertificateRequest, Material, SigningPolicy};
use crate::TransportError;

/// Procedure name a CA peer serves signing requests under
pub const SIGN_PROCEDURE: &str = "sign_remote_certificate";

/// Request sent from a requester to one CA peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRequestEnvelope {
    /// Policy to sign under
    pub signing_policy_name: String,
    /// Requested certificate
    pub request_kwargs: CertificateRequest,
    /// Only return the policy, do not sign anything
    #[serde(default)]
    pub get_policy_only: bool,
    /// Verified identity of the requester, filled in by the channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_identity: Option<String>,
}

/// Reply from a CA peer. Exactly one of `data` and `errors` is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReplyEnvelope {
    #[serde(default)]
    pub data: Option<ReplyData>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Payload of a successful reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyData {
    /// Signed artifact, in the encoding the backend produces by default
    Certificate(#[serde(with = "crate::serde_b64")] Vec<u8>),
    /// Policy description for change detection
    Policy(PolicyDescription),
}

/// What a requester learns about a policy: the redacted policy plus the
/// public identity of the CA, enough to run change detection locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDescription {
    /// Policy with secrets and the requester matcher removed
    pub policy: SigningPolicy,
    /// Public key derived from the CA signing key
    pub signer_public_key: Material,
    /// CA certificate, when the policy names one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_certificate: Option<Material>,
}

impl PeerReplyEnvelope {
    #[must_use]
    pub const fn ok(data: ReplyData) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub const fn err(errors: Vec<String>) -> Self {
        Self { data: None, errors }
    }

    /// Interpret the envelope. Errors win over data.
    pub fn into_result(self) -> Result<ReplyData, TransportError> {
        if !self.errors.is_empty() {
            return Err(TransportError::RemoteError {
                messages: self.errors,
            });
        }
        self.data
            .ok_or_else(|| TransportError::MalformedReply("reply carries neither data nor errors".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_win() {
        let reply = PeerReplyEnvelope {
            data: Some(ReplyData::Certificate(vec![1])),
            errors: vec!["nope".into()],
        };
        assert_eq!(
            reply.into_result(),
            Err(TransportError::RemoteError {
                messages: vec!["nope".into()]
            })
        );
    }

    #[test]
    fn test_empty_reply_is_malformed() {
        let reply = PeerReplyEnvelope::err(Vec::new());
        assert!(matches!(
            reply.into_result(),
            Err(TransportError::MalformedReply(_))
        ));
    }

    #[test]
    fn test_wire_shape() {
        let reply = PeerReplyEnvelope::ok(ReplyData::Certificate(b"abc".to_vec()));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["data"]["certificate"], "YWJj");
        assert_eq!(json["errors"], serde_json::json!([]));
        let back: PeerReplyEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, reply);
    }
}
