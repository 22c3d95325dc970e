//! HTTP client for the CA issuance API.

use http::StatusCode;
use http::header::{ACCEPT, CONTENT_TYPE};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::ca::web::MEDIA_TYPE_DER;
use crate::errors::Error;
use crate::identity::PrivateKey;
use crate::x509::{Certificate, CertificateRequest};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
	#[error(transparent)]
	Bifrost(#[from] Error),

	#[error("request to certificate authority failed: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("unexpected response from certificate authority: {status}: {body}")]
	UnexpectedStatus { status: StatusCode, body: String },
}

#[derive(Clone, Debug)]
pub struct Client {
	http: reqwest::Client,
	base: String,
}

impl Client {
	pub fn new(ca_url: Url) -> Client {
		Client {
			http: reqwest::Client::new(),
			base: ca_url.as_str().trim_end_matches('/').to_string(),
		}
	}

	/// Request a certificate for the key's identity in the namespace.
	///
	/// The CSR travels as DER and the certificate comes back as DER; the
	/// returned certificate is validated against the profile and checked to
	/// belong to the requested identity. Validity bounds are optional; the CA
	/// applies its defaults when they are absent.
	pub async fn request_certificate(
		&self,
		namespace: Uuid,
		key: &PrivateKey,
		not_before: Option<&str>,
		not_after: Option<&str>,
	) -> Result<Certificate, ClientError> {
		let csr = CertificateRequest::create(namespace, key)?;
		let mut query = Vec::new();
		if let Some(not_before) = not_before {
			query.push(("not-before", not_before.to_string()));
		}
		if let Some(not_after) = not_after {
			query.push(("not-after", not_after.to_string()));
		}

		debug!(%namespace, url = %self.base, "requesting certificate");
		let resp = self
			.http
			.post(format!("{}/issue", self.base))
			.query(&query)
			.header(CONTENT_TYPE, MEDIA_TYPE_DER)
			.header(ACCEPT, MEDIA_TYPE_DER)
			.body(csr)
			.send()
			.await?;
		let status = resp.status();
		let body = resp.bytes().await?;

		match status {
			StatusCode::OK => {
				let cert = Certificate::from_der(body.to_vec())?;
				if cert.namespace != namespace {
					return Err(
						Error::CertificateInvalid(format!(
							"namespace mismatch: requested {namespace}, issued {}",
							cert.namespace
						))
						.into(),
					);
				}
				if cert.public_key != key.public_key() {
					return Err(
						Error::CertificateInvalid(
							"issued certificate carries a different public key".to_string(),
						)
						.into(),
					);
				}
				Ok(cert)
			},
			StatusCode::BAD_REQUEST => {
				Err(Error::RequestInvalid(reason(&body, "invalid certificate request")).into())
			},
			StatusCode::FORBIDDEN => {
				Err(Error::RequestDenied(reason(&body, "certificate request denied")).into())
			},
			StatusCode::SERVICE_UNAVAILABLE => {
				Err(Error::RequestAborted(reason(&body, "certificate request aborted")).into())
			},
			status => Err(ClientError::UnexpectedStatus {
				status,
				body: String::from_utf8_lossy(&body).trim().to_string(),
			}),
		}
	}

	/// Fetch the CA's namespace.
	pub async fn namespace(&self) -> Result<Uuid, ClientError> {
		let resp = self
			.http
			.get(format!("{}/namespace", self.base))
			.send()
			.await?;
		let status = resp.status();
		let body = resp.bytes().await?;
		if status != StatusCode::OK {
			return Err(ClientError::UnexpectedStatus {
				status,
				body: String::from_utf8_lossy(&body).trim().to_string(),
			});
		}
		let text = String::from_utf8_lossy(&body);
		Uuid::parse_str(text.trim())
			.map_err(|err| Error::Unexpected(anyhow::anyhow!("parsing namespace: {err}")).into())
	}

}

/// The CA responds with the error's rendered message; strip the kind prefix
/// so re-wrapping it client side does not duplicate it.
fn reason(body: &[u8], prefix: &str) -> String {
	let text = String::from_utf8_lossy(body).trim().to_string();
	match text.strip_prefix(prefix) {
		Some(rest) => rest.trim_start_matches([':', ',']).trim().to_string(),
		None => text,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_reason_strips_known_prefix() {
		assert_eq!(
			reason(b"certificate request denied, boo\n", "certificate request denied"),
			"boo"
		);
		assert_eq!(reason(b"some other message", "certificate request denied"), "some other message");
	}
}
