//! Fixtures shared by the integration suites.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bifrost::ca::{self, Ca, Gauntlet};
use bifrost::identity::PrivateKey;
use bifrost::telemetry::metrics::Metrics;
use bifrost::x509::{Certificate, CertificateRequest};
use time::OffsetDateTime;
use tokio::sync::watch;
use uuid::Uuid;

pub struct TestCa {
	pub namespace: Uuid,
	pub ca: Arc<Ca>,
}

impl TestCa {
	pub fn new(gauntlet: Option<Gauntlet>) -> TestCa {
		let namespace = Uuid::new_v4();
		let key = PrivateKey::generate();
		let cert = ca::issue_ca_certificate(
			namespace,
			&key,
			OffsetDateTime::now_utc() - time::Duration::HOUR,
			OffsetDateTime::now_utc() + time::Duration::days(30),
		)
		.expect("test CA certificate");
		let ca = Ca::new(cert, key, gauntlet, Arc::new(Metrics::unregistered())).expect("test CA");
		TestCa {
			namespace,
			ca: Arc::new(ca),
		}
	}

	pub async fn client_cert(&self) -> (Certificate, PrivateKey) {
		let key = PrivateKey::generate();
		let csr = CertificateRequest::create(self.namespace, &key).expect("test CSR");
		let now = OffsetDateTime::now_utc();
		let der = self
			.ca
			.issue_certificate(
				&csr,
				now - time::Duration::MINUTE,
				now + time::Duration::HOUR,
			)
			.await
			.expect("test client certificate");
		(
			Certificate::from_der(der).expect("issued certificate"),
			key,
		)
	}
}

/// Serve the CA API on an ephemeral port. The returned sender stops the
/// listener.
pub async fn start_ca_server(ca: Arc<Ca>) -> (SocketAddr, watch::Sender<bool>) {
	let (stop_tx, stop_rx) = watch::channel(false);
	let server = bifrost::http::Server::bind("ca", "127.0.0.1:0".parse().unwrap(), stop_rx, ca)
		.await
		.expect("bind test CA server");
	let addr = server.address();
	server.spawn(|ca, req| ca::web::handle(ca.as_ref().clone(), req));
	(addr, stop_tx)
}

/// A server certificate verifier that accepts anything. Integration tests
/// talk to ephemeral servers whose certificates carry no names.
pub mod insecure {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
	use rustls::{DigitallySignedStruct, SignatureScheme};

	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer,
			_intermediates: &[CertificateDer],
			_server_name: &ServerName,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			vec![
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::ED25519,
			]
		}
	}
}
