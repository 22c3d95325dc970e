//! Heimdallr is the receiving end of the identity header: it validates the
//! certificate a trusted front-end placed there and exposes it to downstream
//! handlers through a per-request store.

use std::future::{Ready, ready};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::Either;
use percent_encoding::percent_decode_str;
use tower::{Layer, Service};
use tracing::warn;
use uuid::Uuid;

use crate::http::hofund::CLIENT_CERT_LEAF_HEADER;
use crate::http::{HeaderName, Request, Response, StatusCode, plaintext_response};
use crate::x509::Certificate;

/// Private extension key: only this module can store the validated
/// certificate, so downstream code cannot spoof it.
#[derive(Clone)]
struct ClientCertificate(Arc<Certificate>);

/// The certificate heimdallr validated for this request, if any.
pub fn client_certificate<B>(req: &::http::Request<B>) -> Option<Arc<Certificate>> {
	req
		.extensions()
		.get::<ClientCertificate>()
		.map(|cert| cert.0.clone())
}

#[derive(Clone, Debug)]
pub struct HeimdallrLayer {
	namespace: Uuid,
	header: HeaderName,
}

impl HeimdallrLayer {
	pub fn new(namespace: Uuid) -> HeimdallrLayer {
		HeimdallrLayer {
			namespace,
			header: HeaderName::from_static(CLIENT_CERT_LEAF_HEADER),
		}
	}

	pub fn with_header(mut self, header: HeaderName) -> HeimdallrLayer {
		self.header = header;
		self
	}
}

impl<S> Layer<S> for HeimdallrLayer {
	type Service = Heimdallr<S>;

	fn layer(&self, inner: S) -> Heimdallr<S> {
		Heimdallr {
			inner,
			namespace: self.namespace,
			header: self.header.clone(),
		}
	}
}

#[derive(Clone, Debug)]
pub struct Heimdallr<S> {
	inner: S,
	namespace: Uuid,
	header: HeaderName,
}

impl<S> Heimdallr<S> {
	fn parse_header(&self, req: &Request) -> Result<Certificate, Response> {
		// A missing or unreadable header means the front-end is not doing its
		// job; the service is misconfigured rather than the client at fault.
		let misconfigured = || {
			plaintext_response(
				StatusCode::SERVICE_UNAVAILABLE,
				"server misconfigured\n".to_string(),
			)
		};
		let Some(value) = req.headers().get(&self.header) else {
			warn!(header = %self.header, "client certificate header is missing");
			return Err(misconfigured());
		};
		let Ok(value) = value.to_str() else {
			warn!(header = %self.header, "client certificate header is not valid text");
			return Err(misconfigured());
		};
		let Ok(pem) = percent_decode_str(value).decode_utf8() else {
			warn!(header = %self.header, "client certificate header is not percent encoded text");
			return Err(misconfigured());
		};
		match Certificate::from_pem(pem.as_bytes()) {
			Ok(cert) => Ok(cert),
			Err(err) => {
				warn!(header = %self.header, "client certificate header is not a valid certificate: {err}");
				Err(misconfigured())
			},
		}
	}
}

impl<S> Service<Request> for Heimdallr<S>
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
		let cert = match self.parse_header(&req) {
			Ok(cert) => cert,
			Err(resp) => return Either::Left(ready(Ok(resp))),
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
			.extensions_mut()
			.insert(ClientCertificate(Arc::new(cert)));
		Either::Right(self.inner.call(req))
	}
}

#[cfg(test)]
mod tests {
	use std::convert::Infallible;

	use tower::ServiceExt;

	use super::*;
	use crate::http::hofund::encode_header_value;
	use crate::http::{Body, empty_response};
	use crate::test_support::TestCa;

	fn expecting_service(
		want: Certificate,
	) -> impl Service<Request, Response = Response, Error = Infallible> + Clone {
		tower::service_fn(move |req: Request| {
			let want = want.clone();
			async move {
				let Some(got) = client_certificate(&req) else {
					return Ok(empty_response(StatusCode::IM_A_TEAPOT));
				};
				// Byte equality with what hofund encoded.
				assert_eq!(*got, want);
				Ok(plaintext_response(StatusCode::OK, got.id.to_string()))
			}
		})
	}

	#[tokio::test]
	async fn test_round_trip_from_hofund_header() {
		let ca = TestCa::new().await;
		let (client, _key) = ca.client_cert().await;

		let svc = HeimdallrLayer::new(ca.namespace).layer(expecting_service(client.clone()));
		let req = ::http::Request::builder()
			.uri("http://unit.test/")
			.header(CLIENT_CERT_LEAF_HEADER, encode_header_value(&client))
			.body(Body::empty())
			.unwrap();
		let resp = svc.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn test_missing_header_is_a_misconfiguration() {
		let ca = TestCa::new().await;
		let (client, _key) = ca.client_cert().await;
		let svc = HeimdallrLayer::new(ca.namespace).layer(expecting_service(client));
		let req = ::http::Request::builder()
			.uri("http://unit.test/")
			.body(Body::empty())
			.unwrap();
		let resp = svc.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	}

	#[tokio::test]
	async fn test_malformed_header_is_a_misconfiguration() {
		let ca = TestCa::new().await;
		let (client, _key) = ca.client_cert().await;
		let svc = HeimdallrLayer::new(ca.namespace).layer(expecting_service(client));
		let req = ::http::Request::builder()
			.uri("http://unit.test/")
			.header(CLIENT_CERT_LEAF_HEADER, "not-a-pem-certificate")
			.body(Body::empty())
			.unwrap();
		let resp = svc.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	}

	#[tokio::test]
	async fn test_foreign_namespace_is_forbidden() {
		let ca = TestCa::new().await;
		let (client, _key) = ca.client_cert().await;
		let svc = HeimdallrLayer::new(Uuid::new_v4()).layer(expecting_service(client.clone()));
		let req = ::http::Request::builder()
			.uri("http://unit.test/")
			.header(CLIENT_CERT_LEAF_HEADER, encode_header_value(&client))
			.body(Body::empty())
			.unwrap();
		let resp = svc.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::FORBIDDEN);
	}
}
