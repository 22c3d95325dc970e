//! A tiny certificate authority. It holds one (certificate, key) pair for
//! the lifetime of the process and signs short-lived client certificates in
//! its own namespace.

pub mod gauntlet;
pub mod web;

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
	KeyUsagePurpose, SerialNumber,
};
use rustls_pki_types::CertificateSigningRequestDer;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::Error;
use crate::identity::{self, PrivateKey};
use crate::telemetry::metrics::{Metrics, NamespaceLabels};
use crate::x509::{Certificate, CertificateRequest};

pub use gauntlet::{GAUNTLET_TIMEOUT, Gauntlet, GauntletContext, tls_client_cert_template};

/// Maximum validity window of an issued certificate.
pub const MAX_ISSUE_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub struct Ca {
	cert: Arc<Certificate>,
	issuer: Issuer<'static, KeyPair>,
	gauntlet: gauntlet::Runner,
	metrics: Arc<Metrics>,
}

impl Ca {
	/// Build a CA from its certificate and key. The certificate must satisfy
	/// the CA profile and match the private key.
	pub fn new(
		cert: Certificate,
		key: PrivateKey,
		gauntlet: Option<Gauntlet>,
		metrics: Arc<Metrics>,
	) -> Result<Ca, Error> {
		if !cert.is_ca {
			return Err(Error::CertificateInvalid(
				"certificate is not a certificate authority".to_string(),
			));
		}
		if cert.public_key != key.public_key() {
			return Err(Error::KeyInvalid(
				"private key does not match the certificate".to_string(),
			));
		}
		let issuer = Issuer::from_ca_cert_der(cert.der(), key.to_key_pair()?)
			.map_err(|err| Error::CertificateInvalid(format!("certificate cannot sign: {err}")))?;
		info!(namespace = %cert.namespace, id = %cert.id, "certificate authority ready");
		Ok(Ca {
			cert: Arc::new(cert),
			issuer,
			gauntlet: gauntlet::Runner::new(gauntlet, metrics.clone()),
			metrics,
		})
	}

	pub fn namespace(&self) -> Uuid {
		self.cert.namespace
	}

	pub fn certificate(&self) -> &Certificate {
		&self.cert
	}

	/// Issue a client certificate for a CSR.
	///
	/// The CSR must satisfy the profile and carry the CA's own namespace, and
	/// the validity window must fit inside [`MAX_ISSUE_VALIDITY`]. The
	/// gauntlet supplies the template; validity bounds, issuer, subject, and
	/// (when unset) a random serial are overwritten before signing over the
	/// CSR's public key.
	pub async fn issue_certificate(
		&self,
		csr_der: &[u8],
		not_before: OffsetDateTime,
		not_after: OffsetDateTime,
	) -> Result<Vec<u8>, Error> {
		let start = std::time::Instant::now();
		let csr = Arc::new(CertificateRequest::from_der(csr_der.to_vec())?);
		let labels = NamespaceLabels::from(csr.namespace);
		self.metrics.requests.get_or_create(&labels).inc();

		if csr.namespace != self.cert.namespace {
			return Err(Error::RequestInvalid(format!(
				"namespace mismatch: csr has {}, ca has {}",
				csr.namespace, self.cert.namespace
			)));
		}
		check_validity(not_before, not_after)?;

		let template = self.gauntlet.run(&csr).await?;
		let template = self.issuance_controls(template, &csr, not_before, not_after);

		let der = CertificateSigningRequestDer::from(csr_der.to_vec());
		let signing = rcgen::CertificateSigningRequestParams::from_der(&der)
			.map_err(|err| Error::RequestInvalid(format!("malformed certificate request: {err}")))?;
		let signed = template
			.signed_by(&signing.public_key, &self.issuer)
			.map_err(|err| Error::Unexpected(anyhow::anyhow!("signing certificate: {err}")))?;
		let der = signed.der().to_vec();

		self.metrics.issued_certs.get_or_create(&labels).inc();
		self
			.metrics
			.issue_duration
			.get_or_create(&labels)
			.observe(start.elapsed().as_secs_f64());
		self
			.metrics
			.issue_size
			.get_or_create(&labels)
			.observe(der.len() as f64);
		debug!(namespace = %csr.namespace, id = %csr.id, "issued certificate");
		Ok(der)
	}

	/// Overwrite the template fields the CA controls. Everything else on the
	/// template (SANs, extensions, custom key usages, an explicit serial) is
	/// honored as the gauntlet produced it.
	fn issuance_controls(
		&self,
		mut template: CertificateParams,
		csr: &CertificateRequest,
		not_before: OffsetDateTime,
		not_after: OffsetDateTime,
	) -> CertificateParams {
		template.not_before = not_before;
		template.not_after = not_after;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::OrganizationName, self.cert.namespace.to_string());
		dn.push(DnType::CommonName, csr.id.to_string());
		template.distinguished_name = dn;
		if template.serial_number.is_none() {
			template.serial_number = Some(random_serial());
		}
		template
	}

	/// Wait for all in-flight gauntlet workers to finish. New issuances are
	/// aborted once closing starts.
	pub async fn close(&self) {
		self.gauntlet.close().await;
	}
}

/// A cryptographically random serial in [0, 2^63).
fn random_serial() -> SerialNumber {
	SerialNumber::from(rand::rng().random::<u64>() >> 1)
}

fn check_validity(not_before: OffsetDateTime, not_after: OffsetDateTime) -> Result<(), Error> {
	if not_after < not_before {
		return Err(Error::RequestInvalid(format!(
			"invalid validity window: not-after {not_after} is before not-before {not_before}"
		)));
	}
	if not_after - not_before > MAX_ISSUE_VALIDITY {
		return Err(Error::RequestInvalid(format!(
			"invalid validity window: {} exceeds the maximum {:?}",
			not_after - not_before,
			MAX_ISSUE_VALIDITY
		)));
	}
	Ok(())
}

/// Self-issue a root certificate satisfying the CA profile.
pub fn issue_ca_certificate(
	namespace: Uuid,
	key: &PrivateKey,
	not_before: OffsetDateTime,
	not_after: OffsetDateTime,
) -> Result<Certificate, Error> {
	if namespace.is_nil() {
		return Err(Error::RequestInvalid(
			"namespace must not be the nil uuid".to_string(),
		));
	}
	let key_pair = key.to_key_pair()?;
	let id = identity::derive_id(namespace, &key.public_key());
	let mut params = CertificateParams::default();
	let mut dn = DistinguishedName::new();
	dn.push(DnType::OrganizationName, namespace.to_string());
	dn.push(DnType::CommonName, id.to_string());
	params.distinguished_name = dn;
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![
		KeyUsagePurpose::KeyCertSign,
		KeyUsagePurpose::DigitalSignature,
	];
	params.not_before = not_before;
	params.not_after = not_after;
	params.serial_number = Some(random_serial());
	let cert = params
		.self_signed(&key_pair)
		.map_err(|err| Error::Unexpected(anyhow::anyhow!("self signing: {err}")))?;
	Certificate::from_der(cert.der().to_vec())
}

/// Resolve `not-before`/`not-after` inputs into a concrete validity window.
///
/// Each accepts RFC3339, or a `+` prefixed duration offset (`+1h30m`).
/// `not-before` additionally accepts the literal `now` and defaults to now;
/// `not-after` offsets are relative to `not-before` and default to one hour.
pub fn parse_validity(
	not_before: Option<&str>,
	not_after: Option<&str>,
) -> Result<(OffsetDateTime, OffsetDateTime), Error> {
	let now = OffsetDateTime::now_utc();
	let not_before = match not_before {
		None | Some("") | Some("now") => now,
		Some(s) => parse_time_or_offset(s, now)?,
	};
	let not_after = match not_after {
		None | Some("") => not_before + time::Duration::HOUR,
		Some(s) => parse_time_or_offset(s, not_before)?,
	};
	Ok((not_before, not_after))
}

fn parse_time_or_offset(s: &str, base: OffsetDateTime) -> Result<OffsetDateTime, Error> {
	if let Some(offset) = s.strip_prefix('+') {
		let nanos = go_parse_duration::parse_duration(offset)
			.map_err(|err| Error::RequestInvalid(format!("invalid duration offset '{s}': {err:?}")))?;
		return Ok(base + time::Duration::nanoseconds(nanos));
	}
	OffsetDateTime::parse(s, &Rfc3339)
		.map_err(|err| Error::RequestInvalid(format!("invalid timestamp '{s}': {err}")))
}
