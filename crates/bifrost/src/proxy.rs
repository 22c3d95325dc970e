//! The identity proxy: a TLS terminator that authenticates Bifrost client
//! certificates and reverse proxies to a plain HTTP backend, forwarding the
//! authenticated identity in a header via hofund.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, info, warn};
use url::Url;

use crate::http::hofund::HofundLayer;
use crate::http::{
	Body, HeaderName, HeaderValue, Request, Response, StatusCode, header, plaintext_response,
};
use crate::tls::PeerCertificates;

/// Hop-by-hop headers stripped before forwarding in either direction.
fn hop_headers() -> [HeaderName; 9] {
	[
		header::CONNECTION,
		header::TE,
		header::TRAILER,
		header::TRANSFER_ENCODING,
		header::PROXY_AUTHENTICATE,
		header::PROXY_AUTHORIZATION,
		header::UPGRADE,
		HeaderName::from_static("keep-alive"),
		HeaderName::from_static("proxy-connection"),
	]
}

pub struct Proxy {
	listener: TcpListener,
	acceptor: TlsAcceptor,
	hofund: HofundLayer,
	backend: Url,
	shutdown: watch::Receiver<bool>,
}

impl Proxy {
	pub async fn bind(
		addr: SocketAddr,
		tls: rustls::ServerConfig,
		hofund: HofundLayer,
		backend: Url,
		shutdown: watch::Receiver<bool>,
	) -> anyhow::Result<Proxy> {
		let listener = TcpListener::bind(addr).await?;
		Ok(Proxy {
			listener,
			acceptor: TlsAcceptor::from(Arc::new(tls)),
			hofund,
			backend,
			shutdown,
		})
	}

	pub fn address(&self) -> SocketAddr {
		self
			.listener
			.local_addr()
			.expect("bound listener has a local address")
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let Proxy {
			listener,
			acceptor,
			hofund,
			backend,
			mut shutdown,
		} = self;
		let forward = ForwardService::new(backend.clone());
		info!(
			address = %listener.local_addr()?,
			backend = %backend,
			"identity proxy started",
		);
		loop {
			let (socket, peer) = tokio::select! {
				res = listener.accept() => match res {
					Ok(conn) => conn,
					Err(err) => {
						debug!("accept failed: {err}");
						continue;
					},
				},
				_ = shutdown.changed() => break,
			};
			socket.set_nodelay(true).ok();
			let acceptor = acceptor.clone();
			let service = hofund.layer(forward.clone().with_peer(peer));
			tokio::spawn(async move {
				if let Err(err) = serve_tls_connection(acceptor, socket, service).await {
					debug!(%peer, "connection closed: {err}");
				}
			});
		}
		info!("identity proxy stopped");
		Ok(())
	}
}

async fn serve_tls_connection<S>(
	acceptor: TlsAcceptor,
	socket: tokio::net::TcpStream,
	service: S,
) -> anyhow::Result<()>
where
	S: Service<Request, Response = Response, Error = std::convert::Infallible>
		+ Clone
		+ Send
		+ 'static,
	S::Future: Send,
{
	let stream = acceptor.accept(socket).await?;
	let (_, conn) = stream.get_ref();
	// RequireAndVerifyClientCert guarantees at least one verified certificate
	// on every accepted connection.
	let peer_certs = PeerCertificates(Arc::new(
		conn
			.peer_certificates()
			.map(|certs| certs.to_vec())
			.unwrap_or_default(),
	));

	let server = auto::Builder::new(TokioExecutor::new());
	server
		.serve_connection(
			TokioIo::new(stream),
			hyper::service::service_fn(move |mut req: hyper::Request<Incoming>| {
				let service = service.clone();
				req.extensions_mut().insert(peer_certs.clone());
				service.oneshot(req.map(Body::new))
			}),
		)
		.await
		.map_err(|err| anyhow::anyhow!("serving connection: {err}"))
}

/// Forwards requests to the backend with standard X-Forwarded headers.
#[derive(Clone)]
struct ForwardService {
	client: hyper_util::client::legacy::Client<HttpConnector, Body>,
	backend: Url,
	peer: Option<SocketAddr>,
}

impl ForwardService {
	fn new(backend: Url) -> ForwardService {
		let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
			.timer(TokioTimer::new())
			.build_http();
		ForwardService {
			client,
			backend,
			peer: None,
		}
	}

	fn with_peer(mut self, peer: SocketAddr) -> ForwardService {
		self.peer = Some(peer);
		self
	}

	async fn forward(self, mut req: Request) -> anyhow::Result<Response> {
		let host = self
			.backend
			.host_str()
			.ok_or_else(|| anyhow::anyhow!("backend url has no host"))?;
		let authority = match self.backend.port() {
			Some(port) => format!("{host}:{port}"),
			None => host.to_string(),
		};
		let authority = authority
			.parse::<::http::uri::Authority>()
			.map_err(|err| anyhow::anyhow!("backend authority: {err}"))?;

		let original_host = req
			.headers()
			.get(header::HOST)
			.cloned()
			.or_else(|| req.uri().authority().map(|a| {
				HeaderValue::from_str(a.as_str()).expect("authority is a valid header value")
			}));

		let mut parts = std::mem::take(req.uri_mut()).into_parts();
		parts.scheme = Some(::http::uri::Scheme::HTTP);
		parts.authority = Some(authority);
		if parts.path_and_query.is_none() {
			parts.path_and_query = Some(::http::uri::PathAndQuery::from_static("/"));
		}
		*req.uri_mut() = ::http::Uri::from_parts(parts)?;

		for name in hop_headers().iter() {
			req.headers_mut().remove(name);
		}
		req.headers_mut().remove(header::HOST);
		if let Some(host) = original_host {
			req
				.headers_mut()
				.insert(HeaderName::from_static("x-forwarded-host"), host);
		}
		req.headers_mut().insert(
			HeaderName::from_static("x-forwarded-proto"),
			HeaderValue::from_static("https"),
		);
		if let Some(peer) = self.peer {
			append_forwarded_for(req.headers_mut(), peer);
		}

		let resp = self.client.request(req).await?;
		let mut resp = resp.map(Body::new);
		for name in hop_headers().iter() {
			resp.headers_mut().remove(name);
		}
		Ok(resp)
	}
}

fn append_forwarded_for(headers: &mut ::http::HeaderMap, peer: SocketAddr) {
	let name = HeaderName::from_static("x-forwarded-for");
	let value = match headers.get(&name).and_then(|v| v.to_str().ok()) {
		Some(existing) => format!("{existing}, {}", peer.ip()),
		None => peer.ip().to_string(),
	};
	if let Ok(value) = HeaderValue::from_str(&value) {
		headers.insert(name, value);
	}
}

impl Service<Request> for ForwardService {
	type Response = Response;
	type Error = std::convert::Infallible;
	type Future = Pin<Box<dyn Future<Output = Result<Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, req: Request) -> Self::Future {
		let this = self.clone();
		Box::pin(async move {
			Ok(this.forward(req).await.unwrap_or_else(|err| {
				warn!("forwarding to backend failed: {err}");
				plaintext_response(StatusCode::BAD_GATEWAY, format!("upstream error: {err}\n"))
			}))
		})
	}
}
