use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::TryFutureExt;
use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::http::{Body, Response};

pub fn http1_server() -> http1::Builder {
	let mut b = http1::Builder::new();
	b.timer(TokioTimer::new());
	b
}

/// Server implements a generic plaintext HTTP/1.1 server with graceful
/// shutdown: once the shutdown watch fires, the listener stops accepting and
/// in-flight connections finish their current requests.
pub struct Server<S> {
	name: String,
	bind: TcpListener,
	shutdown: watch::Receiver<bool>,
	state: S,
}

impl<S> Server<S> {
	pub async fn bind(
		name: &str,
		addr: SocketAddr,
		shutdown: watch::Receiver<bool>,
		state: S,
	) -> anyhow::Result<Self> {
		let bind = TcpListener::bind(addr).await?;
		Ok(Server {
			name: name.to_string(),
			bind,
			shutdown,
			state,
		})
	}

	pub fn address(&self) -> SocketAddr {
		self
			.bind
			.local_addr()
			.expect("bound listener has a local address")
	}

	pub fn spawn<F, R>(self, f: F)
	where
		S: Send + Sync + 'static,
		F: Fn(Arc<S>, Request<Incoming>) -> R + Send + Sync + 'static,
		R: Future<Output = Result<Response, anyhow::Error>> + Send + 'static,
	{
		let Server {
			name,
			bind,
			mut shutdown,
			state,
		} = self;
		let address = bind.local_addr().expect("bound listener has a local address");
		let state = Arc::new(state);
		let f = Arc::new(f);
		info!(%address, component = name, "listener established");
		tokio::spawn(async move {
			loop {
				let socket = tokio::select! {
					res = bind.accept() => match res {
						Ok((socket, _peer)) => socket,
						Err(err) => {
							debug!(component = name, "accept failed: {err}");
							continue;
						},
					},
					_ = shutdown.changed() => break,
				};
				socket.set_nodelay(true).ok();
				let f = f.clone();
				let state = state.clone();
				let mut conn_shutdown = shutdown.clone();
				tokio::spawn(async move {
					let serve = http1_server()
						.half_close(true)
						.header_read_timeout(Duration::from_secs(2))
						.serve_connection(
							TokioIo::new(socket),
							hyper::service::service_fn(move |req| {
								let state = state.clone();
								// Handler failures become a 500, not a connection abort.
								f(state, req).or_else(|err| async move {
									Ok::<_, Infallible>(
										::http::Response::builder()
											.status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
											.body(Body::new(err.to_string()))
											.expect("builder with known status code should not fail"),
									)
								})
							}),
						);
					tokio::pin!(serve);
					tokio::select! {
						res = &mut serve => {
							if let Err(err) = res {
								debug!("connection closed: {err}");
							}
						},
						_ = conn_shutdown.changed() => {
							serve.as_mut().graceful_shutdown();
							let _ = serve.await;
						},
					}
				});
			}
			info!(%address, component = name, "listener drained");
		});
	}
}
