//! Hofund converts the peer certificate of a terminated TLS connection into
//! a trusted identity header for the next hop.

use std::future::{Ready, ready};
use std::task::{Context, Poll};

use futures_util::future::Either;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use tower::{Layer, Service};
use tracing::{error, warn};
use uuid::Uuid;

use crate::http::{
	HeaderName, HeaderValue, Request, Response, StatusCode, empty_response, plaintext_response,
};
use crate::tls::PeerCertificates;
use crate::x509::Certificate;

/// Header names mirroring AWS ALB mTLS passthrough: the leaf-only variant and
/// the leaf-plus-chain variant.
pub const CLIENT_CERT_LEAF_HEADER: &str = "x-amzn-mtls-clientcert-leaf";
pub const CLIENT_CERT_HEADER: &str = "x-amzn-mtls-clientcert";

/// Characters escaped in the header value. Controls cover the PEM newlines,
/// and '%' is the escape character itself.
const HEADER_ESCAPES: &AsciiSet = &CONTROLS.add(b' ').add(b'%').add(b'"');

pub(crate) fn encode_header_value(cert: &Certificate) -> HeaderValue {
	let escaped = utf8_percent_encode(&cert.to_pem(), HEADER_ESCAPES).to_string();
	HeaderValue::from_str(&escaped).expect("percent escaped PEM is a valid header value")
}

#[derive(Clone, Debug)]
pub struct HofundLayer {
	namespace: Uuid,
	header: HeaderName,
}

impl HofundLayer {
	/// Accept clients of the given namespace, publishing the leaf certificate
	/// under [`CLIENT_CERT_LEAF_HEADER`].
	pub fn new(namespace: Uuid) -> HofundLayer {
		HofundLayer {
			namespace,
			header: HeaderName::from_static(CLIENT_CERT_LEAF_HEADER),
		}
	}

	pub fn with_header(mut self, header: HeaderName) -> HofundLayer {
		self.header = header;
		self
	}
}

impl<S> Layer<S> for HofundLayer {
	type Service = Hofund<S>;

	fn layer(&self, inner: S) -> Hofund<S> {
		Hofund {
			inner,
			namespace: self.namespace,
			header: self.header.clone(),
		}
	}
}

#[derive(Clone, Debug)]
pub struct Hofund<S> {
	inner: S,
	namespace: Uuid,
	header: HeaderName,
}

impl<S> Service<Request> for Hofund<S>
where
	S: Service<Request, Response = Response>,
{
	type Response = Response;
	type Error = S::Error;
	type Future = Either<Ready<Result<Response, S::Error>>, S::Future>;

	fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), S::Error>> {
		self.inner.poll_ready(cx)
	}

	fn call(&mut self, mut req: Request) -> Self::Future {
		// The acceptor records peer certificates before handing requests to
		// the middleware chain. Their absence means hofund is mounted on a
		// server without mutual TLS, which is a deployment error.
		let Some(peer) = req.extensions().get::<PeerCertificates>().cloned() else {
			error!("hofund requires a TLS connection with a verified client certificate");
			return Either::Left(ready(Ok(empty_response(StatusCode::INTERNAL_SERVER_ERROR))));
		};
		let Some(leaf) = peer.0.first() else {
			error!("hofund requires at least one peer certificate");
			return Either::Left(ready(Ok(empty_response(StatusCode::INTERNAL_SERVER_ERROR))));
		};

		let cert = match Certificate::from_der(leaf.to_vec()) {
			Ok(cert) => cert,
			Err(err) => {
				warn!("rejecting client certificate: {err}");
				return Either::Left(ready(Ok(plaintext_response(
					StatusCode::UNAUTHORIZED,
					format!("{err}\n"),
				))));
			},
		};
		if cert.namespace != self.namespace {
			warn!(
				got = %cert.namespace,
				want = %self.namespace,
				"rejecting client certificate from foreign namespace",
			);
			return Either::Left(ready(Ok(plaintext_response(
				StatusCode::FORBIDDEN,
				"namespace mismatch\n".to_string(),
			))));
		}

		req
			.headers_mut()
			.insert(self.header.clone(), encode_header_value(&cert));
		Either::Right(self.inner.call(req))
	}
}

#[cfg(test)]
mod tests {
	use std::convert::Infallible;
	use std::sync::Arc;

	use tower::ServiceExt;

	use super::*;
	use crate::http::Body;
	use crate::test_support::TestCa;

	fn request_with_certs(certs: Option<PeerCertificates>) -> Request {
		let mut req = ::http::Request::builder()
			.uri("https://unit.test/")
			.body(Body::empty())
			.unwrap();
		if let Some(certs) = certs {
			req.extensions_mut().insert(certs);
		}
		req
	}

	fn echo_header_service(
		header: &'static str,
	) -> impl Service<Request, Response = Response, Error = Infallible> + Clone {
		tower::service_fn(move |req: Request| async move {
			let value = req
				.headers()
				.get(header)
				.and_then(|v| v.to_str().ok())
				.unwrap_or_default()
				.to_string();
			Ok(plaintext_response(StatusCode::OK, value))
		})
	}

	#[tokio::test]
	async fn test_sets_identity_header() {
		let ca = TestCa::new().await;
		let (client, _key) = ca.client_cert().await;

		let svc = HofundLayer::new(ca.namespace).layer(echo_header_service(CLIENT_CERT_LEAF_HEADER));
		let peer = PeerCertificates(Arc::new(vec![client.der().clone()]));
		let resp = svc.oneshot(request_with_certs(Some(peer))).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn test_missing_peer_certificates_is_a_server_error() {
		let ca = TestCa::new().await;
		let svc = HofundLayer::new(ca.namespace).layer(echo_header_service(CLIENT_CERT_LEAF_HEADER));
		let resp = svc.oneshot(request_with_certs(None)).await.unwrap();
		assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[tokio::test]
	async fn test_invalid_certificate_is_unauthorized() {
		let ca = TestCa::new().await;
		let svc = HofundLayer::new(ca.namespace).layer(echo_header_service(CLIENT_CERT_LEAF_HEADER));
		let peer = PeerCertificates(Arc::new(vec![vec![0u8; 8].into()]));
		let resp = svc.oneshot(request_with_certs(Some(peer))).await.unwrap();
		assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	}

	#[tokio::test]
	async fn test_foreign_namespace_is_forbidden() {
		let ca = TestCa::new().await;
		let (client, _key) = ca.client_cert().await;

		let svc =
			HofundLayer::new(Uuid::new_v4()).layer(echo_header_service(CLIENT_CERT_LEAF_HEADER));
		let peer = PeerCertificates(Arc::new(vec![client.der().clone()]));
		let resp = svc.oneshot(request_with_certs(Some(peer))).await.unwrap();
		assert_eq!(resp.status(), StatusCode::FORBIDDEN);
	}
}
