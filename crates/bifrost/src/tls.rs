//! rustls configuration for the identity proxy: mutual TLS with the Bifrost
//! CA as the only trusted client root.

use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::errors::Error;
use crate::identity::PrivateKey;
use crate::x509::Certificate;

/// Peer certificates presented on an accepted TLS connection. The acceptor
/// records them into request extensions for hofund to consume.
#[derive(Clone, Debug)]
pub struct PeerCertificates(pub Arc<Vec<CertificateDer<'static>>>);

/// A server config that requires and verifies client certificates against
/// the CA certificate. TLS secrets are logged to `SSLKEYLOGFILE` when that
/// environment variable is set.
pub fn mtls_server_config(
	ca_cert: &Certificate,
	server_chain: Vec<CertificateDer<'static>>,
	server_key: &PrivateKey,
) -> Result<ServerConfig, Error> {
	let mut roots = RootCertStore::empty();
	roots
		.add(ca_cert.der().clone())
		.map_err(|err| Error::CertificateInvalid(format!("CA certificate is not a root: {err}")))?;
	let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
		.build()
		.map_err(|err| Error::Unexpected(anyhow::anyhow!("building client verifier: {err}")))?;

	let key = PrivateKeyDer::Pkcs8(server_key.to_pkcs8_der()?.into());
	let mut config = ServerConfig::builder()
		.with_client_cert_verifier(verifier)
		.with_single_cert(server_chain, key)
		.map_err(|err| Error::Unexpected(anyhow::anyhow!("building server config: {err}")))?;
	config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	config.key_log = Arc::new(rustls::KeyLogFile::new());
	Ok(config)
}
