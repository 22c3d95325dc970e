//! The gauntlet is an optional policy hook consulted on every issuance. It
//! can customize the certificate template or refuse the request, but it runs
//! isolated from the issuance pipeline: on a separate worker task, under a
//! strict deadline, with panics contained.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rcgen::{CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use crate::errors::Error;
use crate::telemetry::metrics::{Metrics, NamespaceLabels};
use crate::x509::CertificateRequest;

/// Maximum wall clock time a gauntlet invocation may take.
pub const GAUNTLET_TIMEOUT: Duration = Duration::from_millis(100);

/// Passed to the gauntlet on each invocation. The cancellation token fires
/// when the invocation times out or the originating request goes away;
/// cooperative gauntlets should select on it.
pub struct GauntletContext {
	pub csr: Arc<CertificateRequest>,
	pub cancel: CancellationToken,
}

pub type GauntletFuture =
	Pin<Box<dyn Future<Output = anyhow::Result<Option<CertificateParams>>> + Send>>;

/// A policy callback. Returning `Ok(None)` accepts the request with the
/// default client template; `Ok(Some(template))` accepts it with a custom
/// template whose application specific fields (SANs, extensions, serial) are
/// honored; `Err` refuses issuance with the error message.
pub type Gauntlet = Arc<dyn Fn(GauntletContext) -> GauntletFuture + Send + Sync>;

/// The template used when no gauntlet is configured or the gauntlet returns
/// none. Validity bounds are filled in by the issuance pipeline.
pub fn tls_client_cert_template() -> CertificateParams {
	let mut params = CertificateParams::default();
	params.is_ca = IsCa::ExplicitNoCa;
	params.key_usages = vec![
		KeyUsagePurpose::DigitalSignature,
		KeyUsagePurpose::KeyEncipherment,
	];
	params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
	params
}

pub(crate) struct Runner {
	gauntlet: Option<Gauntlet>,
	workers: TaskTracker,
	metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Runner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Runner")
			.field("gauntlet", &self.gauntlet.as_ref().map(|_| "<fn>"))
			.field("workers", &self.workers)
			.field("metrics", &self.metrics)
			.finish()
	}
}

impl Runner {
	pub(crate) fn new(gauntlet: Option<Gauntlet>, metrics: Arc<Metrics>) -> Runner {
		Runner {
			gauntlet,
			workers: TaskTracker::new(),
			metrics,
		}
	}

	/// Run the gauntlet for a request and return the certificate template to
	/// issue from. The worker task is always accounted for: timeouts cancel
	/// and join it, and `close` blocks until every in-flight worker finishes.
	pub(crate) async fn run(&self, csr: &Arc<CertificateRequest>) -> Result<CertificateParams, Error> {
		let Some(gauntlet) = self.gauntlet.clone() else {
			return Ok(tls_client_cert_template());
		};
		if self.workers.is_closed() {
			return Err(Error::RequestAborted(
				"certificate authority is shutting down".to_string(),
			));
		}

		let labels = NamespaceLabels::from(csr.namespace);
		let cancel = CancellationToken::new();
		// If this future is dropped because the request went away, the guard
		// cancels the worker's context.
		let _guard = cancel.clone().drop_guard();
		let ctx = GauntletContext {
			csr: csr.clone(),
			cancel: cancel.clone(),
		};

		let start = Instant::now();
		let mut worker = self.workers.spawn(gauntlet(ctx));
		let result = match tokio::time::timeout(GAUNTLET_TIMEOUT, &mut worker).await {
			Ok(Ok(Ok(Some(template)))) => Ok(template),
			Ok(Ok(Ok(None))) => Ok(tls_client_cert_template()),
			Ok(Ok(Err(denial))) => {
				self.metrics.gauntlet_denied.get_or_create(&labels).inc();
				Err(Error::RequestDenied(denial.to_string()))
			},
			Ok(Err(join_error)) => {
				self.metrics.gauntlet_aborted.get_or_create(&labels).inc();
				warn!(namespace = %csr.namespace, "gauntlet panicked: {join_error}");
				Err(Error::RequestAborted("gauntlet panicked".to_string()))
			},
			Err(_elapsed) => {
				cancel.cancel();
				worker.abort();
				// Join the worker before reporting so the task cannot outlive
				// the call unobserved.
				let _ = (&mut worker).await;
				self.metrics.gauntlet_aborted.get_or_create(&labels).inc();
				Err(Error::RequestAborted("gauntlet timed out".to_string()))
			},
		};
		self
			.metrics
			.gauntlet_duration
			.get_or_create(&labels)
			.observe(start.elapsed().as_secs_f64());
		result
	}

	/// Stop accepting new work and wait for in-flight gauntlet workers.
	pub(crate) async fn close(&self) {
		self.workers.close();
		self.workers.wait().await;
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use uuid::Uuid;

	use super::*;
	use crate::identity::PrivateKey;

	fn test_csr() -> Arc<CertificateRequest> {
		let ns = Uuid::new_v4();
		let key = PrivateKey::generate();
		let der = CertificateRequest::create(ns, &key).unwrap();
		Arc::new(CertificateRequest::from_der(der).unwrap())
	}

	fn runner(gauntlet: Option<Gauntlet>) -> Runner {
		Runner::new(gauntlet, Arc::new(Metrics::unregistered()))
	}

	#[tokio::test]
	async fn test_no_gauntlet_returns_default_template() {
		let template = runner(None).run(&test_csr()).await.unwrap();
		assert_eq!(
			template.extended_key_usages,
			vec![ExtendedKeyUsagePurpose::ClientAuth]
		);
	}

	#[tokio::test]
	async fn test_gauntlet_deny() {
		let gauntlet: Gauntlet = Arc::new(|_ctx| Box::pin(async { Err(anyhow::anyhow!("boo")) }));
		let err = runner(Some(gauntlet)).run(&test_csr()).await.unwrap_err();
		assert_eq!(err.to_string(), "certificate request denied, boo");
	}

	#[tokio::test]
	async fn test_gauntlet_custom_template() {
		let gauntlet: Gauntlet = Arc::new(|_ctx| {
			Box::pin(async {
				let mut template = tls_client_cert_template();
				template.serial_number = Some(rcgen::SerialNumber::from(42u64));
				Ok(Some(template))
			})
		});
		let template = runner(Some(gauntlet)).run(&test_csr()).await.unwrap();
		assert!(template.serial_number.is_some());
	}

	#[tokio::test]
	async fn test_gauntlet_timeout_joins_worker() {
		let gauntlet: Gauntlet = Arc::new(|ctx| {
			Box::pin(async move {
				// Block until cancelled, like a hung policy waiting on its
				// context.
				ctx.cancel.cancelled().await;
				Ok(None)
			})
		});
		let runner = runner(Some(gauntlet));
		let start = Instant::now();
		let err = runner.run(&test_csr()).await.unwrap_err();
		assert_eq!(
			err.to_string(),
			"certificate request aborted: gauntlet timed out"
		);
		assert!(start.elapsed() < Duration::from_secs(2));
		// No in-flight workers remain.
		runner.close().await;
	}

	#[tokio::test]
	async fn test_gauntlet_panic_is_contained() {
		let gauntlet: Gauntlet = Arc::new(|_ctx| Box::pin(async { panic!("kaboom") }));
		let runner = runner(Some(gauntlet));
		let err = runner.run(&test_csr()).await.unwrap_err();
		assert_matches!(err, Error::RequestAborted(_));
		// The runner stays healthy for the next request.
		let err = runner.run(&test_csr()).await.unwrap_err();
		assert_matches!(err, Error::RequestAborted(_));
	}

	#[tokio::test]
	async fn test_closed_runner_aborts_requests() {
		let gauntlet: Gauntlet = Arc::new(|_ctx| Box::pin(async { Ok(None) }));
		let runner = runner(Some(gauntlet));
		runner.close().await;
		let err = runner.run(&test_csr()).await.unwrap_err();
		assert_matches!(err, Error::RequestAborted(_));
	}
}
