//! Full chain: mTLS client → identity proxy (hofund) → backend (heimdallr).

mod common;

use std::sync::Arc;

use bifrost::http::heimdallr::{HeimdallrLayer, client_certificate};
use bifrost::http::hofund::HofundLayer;
use bifrost::http::{Body, Server, StatusCode, plaintext_response};
use bifrost::proxy::Proxy;
use tower::Layer;
use bifrost::tls::mtls_server_config;
use common::{TestCa, insecure};
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use rustls_pki_types::{PrivateKeyDer, ServerName};
use tokio::sync::watch;
use tower::ServiceExt;

/// Backend handler: validate the identity header with heimdallr and echo the
/// authenticated certificate's identity and PEM length.
async fn backend_handler(
	namespace: uuid::Uuid,
	req: hyper::Request<hyper::body::Incoming>,
) -> anyhow::Result<bifrost::http::Response> {
	let service = HeimdallrLayer::new(namespace).layer(tower::service_fn(
		|req: bifrost::http::Request| async move {
			let Some(cert) = client_certificate(&req) else {
				return Ok::<_, std::convert::Infallible>(plaintext_response(
					StatusCode::INTERNAL_SERVER_ERROR,
					"no certificate in request context\n".to_string(),
				));
			};
			Ok(plaintext_response(
				StatusCode::OK,
				format!("{}:{}", cert.id, cert.to_pem().len()),
			))
		},
	));
	Ok(service.oneshot(req.map(Body::new)).await?)
}

#[tokio::test]
async fn test_identity_proxy_end_to_end() {
	let test_ca = TestCa::new(None);

	// Plain HTTP backend behind the proxy.
	let (_backend_stop_tx, backend_stop_rx) = watch::channel(false);
	let backend = Server::bind(
		"backend",
		"127.0.0.1:0".parse().unwrap(),
		backend_stop_rx,
		test_ca.namespace,
	)
	.await
	.unwrap();
	let backend_addr = backend.address();
	backend.spawn(|namespace, req| backend_handler(*namespace, req));

	// TLS terminating proxy. The server certificate is issued by the same CA;
	// the test client skips server verification.
	let (server_cert, server_key) = test_ca.client_cert().await;
	let tls = mtls_server_config(
		test_ca.ca.certificate(),
		vec![server_cert.der().clone()],
		&server_key,
	)
	.unwrap();
	let (_proxy_stop_tx, proxy_stop_rx) = watch::channel(false);
	let proxy = Proxy::bind(
		"127.0.0.1:0".parse().unwrap(),
		tls,
		HofundLayer::new(test_ca.namespace),
		format!("http://{backend_addr}").parse().unwrap(),
		proxy_stop_rx,
	)
	.await
	.unwrap();
	let proxy_addr = proxy.address();
	tokio::spawn(proxy.run());

	// mTLS client with an issued certificate.
	let (client_cert, client_key) = test_ca.client_cert().await;
	let client_config = rustls::ClientConfig::builder()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(insecure::NoVerifier))
		.with_client_auth_cert(
			vec![client_cert.der().clone()],
			PrivateKeyDer::Pkcs8(client_key.to_pkcs8_der().unwrap().into()),
		)
		.unwrap();
	let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
	let tcp = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
	let tls = connector
		.connect(ServerName::try_from("localhost").unwrap(), tcp)
		.await
		.unwrap();

	let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
		.await
		.unwrap();
	tokio::spawn(conn);

	let req = http::Request::builder()
		.uri("/whoami")
		.header(http::header::HOST, "bifrost.test")
		.body(String::new())
		.unwrap();
	let resp = sender.send_request(req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	let body = String::from_utf8(body.to_vec()).unwrap();

	// The backend observed the exact certificate the client presented.
	let (id, pem_len) = body.split_once(':').unwrap();
	assert_eq!(id, client_cert.id.to_string());
	assert_eq!(pem_len, client_cert.to_pem().len().to_string());
}

#[tokio::test]
async fn test_proxy_rejects_clients_without_certificates() {
	let test_ca = TestCa::new(None);

	let (server_cert, server_key) = test_ca.client_cert().await;
	let tls = mtls_server_config(
		test_ca.ca.certificate(),
		vec![server_cert.der().clone()],
		&server_key,
	)
	.unwrap();
	let (_stop_tx, stop_rx) = watch::channel(false);
	let proxy = Proxy::bind(
		"127.0.0.1:0".parse().unwrap(),
		tls,
		HofundLayer::new(test_ca.namespace),
		"http://127.0.0.1:9".parse().unwrap(),
		stop_rx,
	)
	.await
	.unwrap();
	let proxy_addr = proxy.address();
	tokio::spawn(proxy.run());

	// No client certificate configured: the handshake must fail.
	let client_config = rustls::ClientConfig::builder()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(insecure::NoVerifier))
		.with_no_client_auth();
	let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
	let tcp = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
	let tls = connector
		.connect(ServerName::try_from("localhost").unwrap(), tcp)
		.await;
	// The server refuses during or right after the handshake; either the
	// connect call errors or the first read does.
	if let Ok(mut stream) = tls {
		use tokio::io::AsyncReadExt;
		let mut buf = [0u8; 1];
		assert!(stream.read(&mut buf).await.is_err());
	}
}
