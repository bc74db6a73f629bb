//! Requester side of the peer protocol.

use std::sync::Arc;
use std::time::Duration;

use certpol_core::{
    CertificateKind, CertificateRequest, PeerReplyEnvelope, PeerRequestEnvelope,
    PolicyDescription, ReplyData, TransportError, SIGN_PROCEDURE,
};
use tracing::{debug, error, instrument};

use super::PeerChannel;

/// Sends signing and policy requests to CA peers
#[derive(Clone)]
pub struct PeerClient {
    channel: Arc<dyn PeerChannel>,
    timeout: Duration,
}

impl PeerClient {
    #[must_use]
    pub fn new(channel: Arc<dyn PeerChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    /// Send one envelope to one peer and interpret the reply.
    ///
    /// A timeout is reported the same way as a missing reply.
    #[instrument(skip(self, envelope), fields(policy = %envelope.signing_policy_name))]
    pub async fn request(
        &self,
        peer: &str,
        envelope: &PeerRequestEnvelope,
    ) -> Result<ReplyData, TransportError> {
        let args = serde_json::to_value(envelope)
            .map_err(|e| TransportError::MalformedReply(format!("could not encode request: {e}")))?;
        debug!(peer = %peer, policy_only = envelope.get_policy_only, "Calling CA peer");

        let no_response = || TransportError::NoResponse {
            peer: peer.to_string(),
        };
        let replies = tokio::time::timeout(
            self.timeout,
            self.channel.call(peer, SIGN_PROCEDURE, args),
        )
        .await
        .map_err(|_| no_response())?;

        let reply = match replies.get(peer) {
            Some(reply) => reply.clone(),
            None => replies.into_values().next().ok_or_else(no_response)?,
        };
        let reply: PeerReplyEnvelope = serde_json::from_value(reply).map_err(|e| {
            error!(peer = %peer, error = %e, "Received invalid reply from CA peer");
            TransportError::MalformedReply(
                "received invalid return value from ca_server, see the requester log for details"
                    .into(),
            )
        })?;
        reply.into_result()
    }

    /// Ask `peer` to sign `request` under `policy`. Returns the artifact in
    /// the peer backend's default encoding.
    pub async fn sign(
        &self,
        peer: &str,
        policy: &str,
        request: &CertificateRequest,
    ) -> Result<Vec<u8>, TransportError> {
        let envelope = PeerRequestEnvelope {
            signing_policy_name: policy.to_string(),
            request_kwargs: request.for_remote(),
            get_policy_only: false,
            requester_identity: None,
        };
        match self.request(peer, &envelope).await? {
            ReplyData::Certificate(bytes) => Ok(bytes),
            ReplyData::Policy(_) => Err(TransportError::MalformedReply(
                "expected a certificate, got a policy".into(),
            )),
        }
    }

    /// Fetch the redacted policy and the CA's public identity
    pub async fn get_policy(
        &self,
        peer: &str,
        kind: CertificateKind,
        policy: &str,
    ) -> Result<PolicyDescription, TransportError> {
        let envelope = PeerRequestEnvelope {
            signing_policy_name: policy.to_string(),
            request_kwargs: CertificateRequest::new(kind),
            get_policy_only: true,
            requester_identity: None,
        };
        match self.request(peer, &envelope).await? {
            ReplyData::Policy(description) => Ok(description),
            ReplyData::Certificate(_) => Err(TransportError::MalformedReply(
                "expected a policy, got a certificate".into(),
            )),
        }
    }
}
