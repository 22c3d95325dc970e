//! The CA's HTTP surface: certificate issuance and namespace discovery.

use std::collections::HashMap;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use tracing::warn;

use crate::ca::{Ca, parse_validity};
use crate::errors::Error;
use crate::http::{
	HeaderMap, Method, Response, StatusCode, empty_response, header, plaintext_response,
};
use crate::x509::{self, der_to_pem};

pub const MEDIA_TYPE_PEM: &str = "text/plain";
pub const MEDIA_TYPE_DER: &str = "application/octet-stream";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MediaType {
	Pem,
	Der,
}

/// Route a request against the CA endpoints. Unknown paths return 404 so the
/// handler can be composed with other routes by the caller.
pub async fn handle(ca: Arc<Ca>, req: hyper::Request<Incoming>) -> anyhow::Result<Response> {
	match (req.method(), req.uri().path()) {
		(&Method::POST, "/issue") => Ok(issue(ca, req).await),
		(&Method::GET, "/namespace") => Ok(namespace(ca, req)),
		(_, "/issue" | "/namespace") => Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED)),
		_ => Ok(empty_response(StatusCode::NOT_FOUND)),
	}
}

async fn issue(ca: Arc<Ca>, req: hyper::Request<Incoming>) -> Response {
	let (parts, body) = req.into_parts();
	let request_type = match request_media_type(&parts.headers) {
		Ok(media_type) => media_type,
		Err(resp) => return resp,
	};
	let response_type = match response_media_type(&parts.headers, request_type) {
		Ok(media_type) => media_type,
		Err(resp) => return resp,
	};

	let query: HashMap<_, _> =
		url::form_urlencoded::parse(parts.uri.query().unwrap_or_default().as_bytes()).collect();
	let (not_before, not_after) = match parse_validity(
		query.get("not-before").map(|v| v.as_ref()),
		query.get("not-after").map(|v| v.as_ref()),
	) {
		Ok(window) => window,
		Err(err) => return error_response(err),
	};

	let body = match body.collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(err) => {
			return plaintext_response(
				StatusCode::BAD_REQUEST,
				format!("reading request body: {err}\n"),
			);
		},
	};
	if body.is_empty() {
		return error_response(Error::RequestInvalid(
			"request body is missing".to_string(),
		));
	}
	let csr_der = match request_type {
		MediaType::Der => body.to_vec(),
		MediaType::Pem => match x509::csr_pem_to_der(&body) {
			Ok(der) => der,
			Err(err) => return error_response(err),
		},
	};

	match ca.issue_certificate(&csr_der, not_before, not_after).await {
		Ok(der) => match response_type {
			MediaType::Der => binary_response(der),
			MediaType::Pem => plaintext_response(StatusCode::OK, der_to_pem("CERTIFICATE", &der)),
		},
		Err(err) => error_response(err),
	}
}

fn namespace(ca: Arc<Ca>, req: hyper::Request<Incoming>) -> Response {
	let wants_der = req
		.headers()
		.get(header::ACCEPT)
		.and_then(|value| value.to_str().ok())
		.map(|accept| {
			accept
				.split(',')
				.any(|entry| media_type(entry) == Some(MediaType::Der))
		})
		.unwrap_or(false);
	if wants_der {
		binary_response(ca.namespace().into_bytes().to_vec())
	} else {
		plaintext_response(StatusCode::OK, format!("{}\n", ca.namespace()))
	}
}

fn binary_response(body: Vec<u8>) -> Response {
	::http::Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, MEDIA_TYPE_DER)
		.body(body.into())
		.expect("builder with known status code should not fail")
}

fn error_response(err: Error) -> Response {
	let status = err.http_status();
	if status == StatusCode::INTERNAL_SERVER_ERROR {
		warn!("certificate issuance failed: {err}");
	}
	plaintext_response(status, format!("{err}\n"))
}

/// Media type of the request body. Missing and empty content types are
/// treated as PEM for compatibility with plain `curl` uploads.
fn request_media_type(headers: &HeaderMap) -> Result<MediaType, Response> {
	let Some(value) = headers.get(header::CONTENT_TYPE) else {
		return Ok(MediaType::Pem);
	};
	let Ok(value) = value.to_str() else {
		return Err(empty_response(StatusCode::UNSUPPORTED_MEDIA_TYPE));
	};
	if value.trim().is_empty() {
		return Ok(MediaType::Pem);
	}
	media_type(value).ok_or_else(|| {
		plaintext_response(
			StatusCode::UNSUPPORTED_MEDIA_TYPE,
			format!("unsupported content type '{value}'\n"),
		)
	})
}

/// Media type of the response, chosen from the Accept header. Absent and
/// wildcard accepts fall back to the request's own media type.
fn response_media_type(headers: &HeaderMap, fallback: MediaType) -> Result<MediaType, Response> {
	let Some(value) = headers.get(header::ACCEPT) else {
		return Ok(fallback);
	};
	let Ok(value) = value.to_str() else {
		return Err(empty_response(StatusCode::NOT_ACCEPTABLE));
	};
	if value.trim().is_empty() {
		return Ok(fallback);
	}
	for entry in value.split(',') {
		let entry = entry.split(';').next().unwrap_or_default().trim();
		if entry == "*/*" {
			return Ok(fallback);
		}
		if let Some(media_type) = media_type(entry) {
			return Ok(media_type);
		}
	}
	Err(plaintext_response(
		StatusCode::NOT_ACCEPTABLE,
		format!("no supported media type in '{value}'\n"),
	))
}

fn media_type(value: &str) -> Option<MediaType> {
	match value
		.split(';')
		.next()
		.unwrap_or_default()
		.trim()
		.to_ascii_lowercase()
		.as_str()
	{
		MEDIA_TYPE_PEM | "text/*" => Some(MediaType::Pem),
		MEDIA_TYPE_DER | "application/*" => Some(MediaType::Der),
		_ => None,
	}
}
