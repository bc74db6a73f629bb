//! Remote signing between a requester and a CA peer.
//!
//! ## Architecture
//!
//! ```text
//! requester                                  CA peer
//! ─────────                                  ───────
//! PeerClient ──PeerRequestEnvelope──▶ PeerChannel ──▶ CaServer
//!     ▲                                                 │ policy lookup
//!     │                                                 │ requester matcher
//!     └──────────── PeerReplyEnvelope ◀─────────────────┘ merge, draft, sign
//! ```
//!
//! The channel carries JSON and is responsible for authenticating the
//! caller: whatever `requester_identity` the requester put into the
//! envelope is replaced by the identity the channel verified.

mod client;
mod local;
mod server;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use client::PeerClient;
pub use local::LocalChannel;
pub use server::CaServer;

/// Transport to other nodes.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Call `procedure` on `peer`. Returns the replies keyed by the name of
    /// the peer that answered; empty when nobody did (unknown peer, call
    /// not authorized, transport failure).
    async fn call(
        &self,
        peer: &str,
        procedure: &str,
        args: serde_json::Value,
    ) -> BTreeMap<String, serde_json::Value>;
}
