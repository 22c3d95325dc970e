//! Shared fixtures for unit tests.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::ca::{Ca, Gauntlet, issue_ca_certificate};
use crate::identity::PrivateKey;
use crate::telemetry::metrics::Metrics;
use crate::x509::{Certificate, CertificateRequest};

pub(crate) struct TestCa {
	pub namespace: Uuid,
	pub ca: Arc<Ca>,
}

impl TestCa {
	pub(crate) async fn new() -> TestCa {
		Self::with_gauntlet(None).await
	}

	pub(crate) async fn with_gauntlet(gauntlet: Option<Gauntlet>) -> TestCa {
		let namespace = Uuid::new_v4();
		let key = PrivateKey::generate();
		let cert = issue_ca_certificate(
			namespace,
			&key,
			OffsetDateTime::now_utc() - time::Duration::HOUR,
			OffsetDateTime::now_utc() + time::Duration::days(30),
		)
		.expect("test CA certificate");
		let ca = Ca::new(cert, key, gauntlet, Arc::new(Metrics::unregistered()))
			.expect("test CA");
		TestCa {
			namespace,
			ca: Arc::new(ca),
		}
	}

	/// Issue a fresh client certificate valid for the next hour.
	pub(crate) async fn client_cert(&self) -> (Certificate, PrivateKey) {
		let key = PrivateKey::generate();
		let csr = CertificateRequest::create(self.namespace, &key).expect("test CSR");
		let now = OffsetDateTime::now_utc();
		let der = self
			.ca
			.issue_certificate(&csr, now - time::Duration::MINUTE, now + time::Duration::HOUR)
			.await
			.expect("test client certificate");
		(Certificate::from_der(der).expect("issued certificate"), key)
	}
}
