//! Bifrost is a minimal mTLS certificate authority toolkit.
//!
//! Clients are identified by ECDSA P-256 key pairs. A key and an operator
//! chosen namespace deterministically derive a UUID identity; the CA issues
//! short-lived client certificates whose subject encodes that identity, and
//! the hofund/heimdallr middlewares carry the authenticated identity across
//! HTTP hops.

pub mod ca;
pub mod client;
pub mod errors;
pub mod http;
pub mod identity;
pub mod proxy;
pub mod signal;
pub mod telemetry;
pub mod tls;
pub mod x509;

#[cfg(test)]
pub(crate) mod test_support;

pub use ca::{Ca, GAUNTLET_TIMEOUT, Gauntlet, GauntletContext, MAX_ISSUE_VALIDITY};
pub use errors::Error;
pub use identity::{PrivateKey, PublicKey, derive_id};
pub use x509::{Certificate, CertificateRequest};
