use http::StatusCode;

/// Error is the closed set of failure kinds the issuance pipeline produces.
/// The CA endpoint maps each kind to an HTTP status, and the client maps the
/// statuses back (see [`crate::client`]).
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("invalid certificate: {0}")]
	CertificateInvalid(String),

	#[error("invalid certificate request: {0}")]
	RequestInvalid(String),

	#[error("certificate request denied, {0}")]
	RequestDenied(String),

	#[error("certificate request aborted: {0}")]
	RequestAborted(String),

	#[error("invalid key: {0}")]
	KeyInvalid(String),

	#[error("{0}")]
	Unexpected(#[from] anyhow::Error),
}

impl Error {
	pub fn http_status(&self) -> StatusCode {
		match self {
			Error::RequestInvalid(_) => StatusCode::BAD_REQUEST,
			Error::RequestDenied(_) => StatusCode::FORBIDDEN,
			Error::RequestAborted(_) => StatusCode::SERVICE_UNAVAILABLE,
			Error::CertificateInvalid(_) | Error::KeyInvalid(_) | Error::Unexpected(_) => {
				StatusCode::INTERNAL_SERVER_ERROR
			},
		}
	}
}
