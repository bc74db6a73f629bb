//! # certpol
//!
//! Certificate issuance under signing policies, locally or through a
//! remote CA peer.
//!
//! ## Architecture
//!
//! ```text
//! ManagedCertificate ──▶ Manager ──policy──▶ PolicyStore (node overrides, then config)
//!                           │      └─remote─▶ PolicyCache ──▶ PeerClient ──▶ CaServer
//!                           │
//!                     merge + detect (certpol-core)
//!                           │
//!              NoOp │ ReEncode │ Issue ──▶ FileSink (atomic write, backup)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use certpol::{Config, ManagedCertificate, Manager};
//!
//! let manager = Manager::from_config(Config::load("/etc/certpol/config.toml".as_ref())?)?;
//! let spec = ManagedCertificate::new("/etc/pki/www.crt", request).policy("www");
//! let outcome = manager.certificate(&spec).await?;
//! println!("{:?} {:?}", outcome.action, outcome.changes.changed_fields());
//! ```

pub mod cache;
pub mod config;
pub mod fs;
pub mod issue;
pub mod manager;
pub mod matcher;
pub mod peer;
pub mod store;

pub use cache::PolicyCache;
pub use config::Config;
pub use fs::{FileSink, LocalFs};
pub use issue::LocalIssuer;
pub use manager::{
    Action, KeyOutcome, ManagedCertificate, ManagedCrl, ManagedCsr, ManagedPrivateKey, Manager,
    Outcome, Reason,
};
pub use matcher::{RequesterMatcher, StaticMatcher, TrustedMatcher};
pub use peer::{CaServer, LocalChannel, PeerChannel, PeerClient};
pub use store::{LayeredStore, PolicyStore};

pub use certpol_core;
