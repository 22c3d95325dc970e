//! The Bifrost certificate profile.
//!
//! Certificates and certificate requests are constrained X.509: ECDSA over
//! P-256 signed with SHA-256, with the namespace UUID as the sole subject
//! organization and the derived identity UUID as the subject common name.
//! Parsing validates the profile and attaches the derived identity.

use std::io::Cursor;

use rcgen::{CertificateParams, DistinguishedName, DnType};
use rustls_pemfile::Item;
use rustls_pki_types::CertificateDer;
use ::time::OffsetDateTime;
use uuid::Uuid;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::oid_registry::{self, Oid};
use x509_parser::prelude::*;

use crate::errors::Error;
use crate::identity::{self, PrivateKey, PublicKey};

/// A certificate validated against the Bifrost profile.
#[derive(Clone, Debug)]
pub struct Certificate {
	/// Identity derived from the namespace and public key; equal to the
	/// subject common name.
	pub id: Uuid,
	/// Namespace encoded in the subject organization.
	pub namespace: Uuid,
	pub public_key: PublicKey,
	pub is_ca: bool,
	pub not_before: OffsetDateTime,
	pub not_after: OffsetDateTime,
	der: CertificateDer<'static>,
}

impl PartialEq for Certificate {
	fn eq(&self, other: &Self) -> bool {
		self.der == other.der
	}
}

impl Eq for Certificate {}

impl Certificate {
	/// Parse and validate a DER encoded certificate.
	pub fn from_der(der: Vec<u8>) -> Result<Certificate, Error> {
		let parsed = parse_certificate(&der).map_err(Error::CertificateInvalid)?;
		Ok(Certificate {
			id: parsed.id,
			namespace: parsed.namespace,
			public_key: parsed.public_key,
			is_ca: parsed.is_ca,
			not_before: parsed.not_before,
			not_after: parsed.not_after,
			der: CertificateDer::from(der),
		})
	}

	/// Parse and validate a PEM encoded certificate. The first PEM block is
	/// used; trailing data is ignored.
	pub fn from_pem(pem: &[u8]) -> Result<Certificate, Error> {
		let mut reader = std::io::BufReader::new(Cursor::new(pem));
		match rustls_pemfile::read_one(&mut reader) {
			Ok(Some(Item::X509Certificate(der))) => Self::from_der(der.to_vec()),
			Ok(Some(_)) => Err(Error::CertificateInvalid(
				"PEM block is not a certificate".to_string(),
			)),
			Ok(None) => Err(Error::CertificateInvalid("no PEM data found".to_string())),
			Err(err) => Err(Error::CertificateInvalid(format!("malformed PEM: {err}"))),
		}
	}

	pub fn der(&self) -> &CertificateDer<'static> {
		&self.der
	}

	pub fn to_pem(&self) -> String {
		der_to_pem("CERTIFICATE", self.der.as_ref())
	}
}

/// A certificate signing request validated against the Bifrost profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRequest {
	/// Identity derived from the namespace and public key; equal to the
	/// subject common name.
	pub id: Uuid,
	/// Namespace encoded in the subject organization.
	pub namespace: Uuid,
	pub public_key: PublicKey,
	der: Vec<u8>,
}

impl CertificateRequest {
	/// Build and sign a CSR for the key's identity in the namespace,
	/// returning its DER encoding.
	pub fn create(namespace: Uuid, key: &PrivateKey) -> Result<Vec<u8>, Error> {
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
		let csr = params
			.serialize_request(&key_pair)
			.map_err(|err| Error::Unexpected(anyhow::anyhow!("serializing request: {err}")))?;
		Ok(csr.der().to_vec())
	}

	/// Parse and validate a DER encoded CSR, verifying its self signature.
	pub fn from_der(der: Vec<u8>) -> Result<CertificateRequest, Error> {
		let (id, namespace, public_key) = {
			let (_, csr) = X509CertificationRequest::from_der(&der)
				.map_err(|err| Error::RequestInvalid(format!("malformed certificate request: {err}")))?;
			csr.verify_signature().map_err(|err| {
				Error::RequestInvalid(format!("signature verification failed: {err}"))
			})?;
			check_signature_algorithm(&csr.signature_algorithm.algorithm)
				.map_err(Error::RequestInvalid)?;
			let info = &csr.certification_request_info;
			let public_key = public_key_from_spki(&info.subject_pki).map_err(Error::RequestInvalid)?;
			let (namespace, subject_id) =
				parse_subject(&info.subject).map_err(Error::RequestInvalid)?;
			let id = identity::derive_id(namespace, &public_key);
			if subject_id != id {
				return Err(Error::RequestInvalid(format!(
					"subject common name {subject_id} does not match derived identity {id}"
				)));
			}
			(id, namespace, public_key)
		};
		Ok(CertificateRequest {
			id,
			namespace,
			public_key,
			der,
		})
	}

	/// Parse and validate a PEM encoded CSR. The first PEM block is used;
	/// trailing data is ignored.
	pub fn from_pem(pem: &[u8]) -> Result<CertificateRequest, Error> {
		Self::from_der(csr_pem_to_der(pem)?)
	}

	pub fn der(&self) -> &[u8] {
		&self.der
	}

	pub fn to_pem(&self) -> String {
		der_to_pem("CERTIFICATE REQUEST", &self.der)
	}
}

/// Extract the DER bytes of the first CSR PEM block.
pub fn csr_pem_to_der(pem: &[u8]) -> Result<Vec<u8>, Error> {
	let mut reader = std::io::BufReader::new(Cursor::new(pem));
	match rustls_pemfile::read_one(&mut reader) {
		Ok(Some(Item::Csr(der))) => Ok(der.as_ref().to_vec()),
		Ok(Some(_)) => Err(Error::RequestInvalid(
			"PEM block is not a certificate request".to_string(),
		)),
		Ok(None) => Err(Error::RequestInvalid("no PEM data found".to_string())),
		Err(err) => Err(Error::RequestInvalid(format!("malformed PEM: {err}"))),
	}
}

pub(crate) fn der_to_pem(tag: &str, der: &[u8]) -> String {
	let block = ::pem::Pem::new(tag, der.to_vec());
	::pem::encode_config(
		&block,
		::pem::EncodeConfig::new().set_line_ending(::pem::LineEnding::LF),
	)
}

struct ParsedCertificate {
	id: Uuid,
	namespace: Uuid,
	public_key: PublicKey,
	is_ca: bool,
	not_before: OffsetDateTime,
	not_after: OffsetDateTime,
}

fn parse_certificate(der: &[u8]) -> Result<ParsedCertificate, String> {
	let (_, x509) = X509Certificate::from_der(der)
		.map_err(|err| format!("malformed certificate: {err}"))?;

	let is_ca = x509
		.basic_constraints()
		.map_err(|err| format!("duplicate basic constraints extension: {err}"))?
		.map(|ext| ext.value.ca)
		.unwrap_or(false);
	let key_usage = x509
		.key_usage()
		.map_err(|err| format!("duplicate key usage extension: {err}"))?;
	if is_ca {
		let can_sign = key_usage
			.as_ref()
			.map(|ext| ext.value.key_cert_sign())
			.unwrap_or(false);
		if !can_sign {
			return Err("CA certificate is missing the certSign key usage".to_string());
		}
	}

	check_signature_algorithm(&x509.signature_algorithm.algorithm)?;
	let public_key = public_key_from_spki(x509.public_key())?;
	let (namespace, subject_id) = parse_subject(x509.subject())?;
	let id = identity::derive_id(namespace, &public_key);
	if subject_id != id {
		return Err(format!(
			"subject common name {subject_id} does not match derived identity {id}"
		));
	}

	if !is_ca {
		let signs = key_usage
			.as_ref()
			.map(|ext| ext.value.digital_signature())
			.unwrap_or(false);
		if !signs {
			return Err("client certificate is missing the digitalSignature key usage".to_string());
		}
		let client_auth = x509
			.extended_key_usage()
			.map_err(|err| format!("duplicate extended key usage extension: {err}"))?
			.map(|ext| ext.value.client_auth || ext.value.any)
			.unwrap_or(false);
		if !client_auth {
			return Err("client certificate is missing the clientAuth extended key usage".to_string());
		}
	}

	Ok(ParsedCertificate {
		id,
		namespace,
		public_key,
		is_ca,
		not_before: x509.validity().not_before.to_datetime(),
		not_after: x509.validity().not_after.to_datetime(),
	})
}

fn check_signature_algorithm(oid: &Oid) -> Result<(), String> {
	if *oid == oid_registry::OID_SIG_ECDSA_WITH_SHA256 {
		return Ok(());
	}
	Err(format!(
		"unsupported signature algorithm '{}'",
		signature_algorithm_name(oid)
	))
}

fn signature_algorithm_name(oid: &Oid) -> String {
	if *oid == oid_registry::OID_SIG_ECDSA_WITH_SHA384 {
		"ECDSA-SHA384".to_string()
	} else if *oid == oid_registry::OID_SIG_ECDSA_WITH_SHA512 {
		"ECDSA-SHA512".to_string()
	} else if *oid == oid_registry::OID_SIG_ECDSA_WITH_SHA224 {
		"ECDSA-SHA224".to_string()
	} else if *oid == oid_registry::OID_PKCS1_SHA256WITHRSA {
		"SHA256-RSA".to_string()
	} else if *oid == oid_registry::OID_SIG_ED25519 {
		"Ed25519".to_string()
	} else {
		oid.to_id_string()
	}
}

fn parse_subject(subject: &X509Name<'_>) -> Result<(Uuid, Uuid), String> {
	let mut organizations = subject.iter_organization();
	let Some(org) = organizations.next() else {
		return Err("subject organization is missing".to_string());
	};
	if organizations.next().is_some() {
		return Err("subject has more than one organization".to_string());
	}
	let org = org
		.as_str()
		.map_err(|_| "subject organization is not a string".to_string())?;
	let namespace = Uuid::parse_str(org)
		.map_err(|err| format!("subject organization is not a valid uuid: {err}"))?;
	if namespace.is_nil() {
		return Err("subject organization is the nil uuid".to_string());
	}

	let mut common_names = subject.iter_common_name();
	let Some(cn) = common_names.next() else {
		return Err("subject common name is missing".to_string());
	};
	if common_names.next().is_some() {
		return Err("subject has more than one common name".to_string());
	}
	let cn = cn
		.as_str()
		.map_err(|_| "subject common name is not a string".to_string())?;
	let subject_id = Uuid::parse_str(cn)
		.map_err(|err| format!("subject common name is not a valid uuid: {err}"))?;

	Ok((namespace, subject_id))
}

fn public_key_from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Result<PublicKey, String> {
	if spki.algorithm.algorithm != oid_registry::OID_KEY_TYPE_EC_PUBLIC_KEY {
		return Err(format!(
			"public key algorithm {} is not ECDSA",
			spki.algorithm.algorithm.to_id_string()
		));
	}
	let curve = spki
		.algorithm
		.parameters
		.as_ref()
		.and_then(|params| params.as_oid().ok())
		.ok_or_else(|| "public key is missing the named curve parameter".to_string())?;
	if curve != oid_registry::OID_EC_P256 {
		return Err(format!(
			"public key curve {} is not P-256",
			curve.to_id_string()
		));
	}
	PublicKey::from_sec1_bytes(&spki.subject_public_key.data)
		.map_err(|err| format!("malformed EC public key: {err}"))
}
