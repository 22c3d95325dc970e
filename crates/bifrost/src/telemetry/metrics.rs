use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Registry, Unit};
use uuid::Uuid;

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct NamespaceLabels {
	pub namespace: String,
}

impl From<Uuid> for NamespaceLabels {
	fn from(namespace: Uuid) -> Self {
		NamespaceLabels {
			namespace: namespace.to_string(),
		}
	}
}

type NamespaceCounter = Family<NamespaceLabels, Counter>;
type NamespaceHistogram = Family<NamespaceLabels, Histogram>;

fn seconds_histogram() -> Histogram {
	Histogram::new(exponential_buckets(0.001, 2.0, 14))
}

fn bytes_histogram() -> Histogram {
	Histogram::new(exponential_buckets(64.0, 2.0, 10))
}

/// Per namespace issuance metrics.
#[derive(Debug)]
pub struct Metrics {
	pub requests: NamespaceCounter,
	pub issued_certs: NamespaceCounter,
	pub issue_duration: NamespaceHistogram,
	pub issue_size: NamespaceHistogram,
	pub gauntlet_denied: NamespaceCounter,
	pub gauntlet_aborted: NamespaceCounter,
	pub gauntlet_duration: NamespaceHistogram,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests = NamespaceCounter::default();
		registry.register(
			"requests",
			"The total number of certificate requests received",
			requests.clone(),
		);

		let issued_certs = NamespaceCounter::default();
		registry.register(
			"issued_certs",
			"The total number of certificates issued",
			issued_certs.clone(),
		);

		let issue_duration =
			NamespaceHistogram::new_with_constructor(seconds_histogram as fn() -> Histogram);
		registry.register_with_unit(
			"issue_duration",
			"Time taken to issue a certificate",
			Unit::Seconds,
			issue_duration.clone(),
		);

		let issue_size =
			NamespaceHistogram::new_with_constructor(bytes_histogram as fn() -> Histogram);
		registry.register_with_unit(
			"issue_size",
			"DER size of issued certificates",
			Unit::Bytes,
			issue_size.clone(),
		);

		let gauntlet_denied = NamespaceCounter::default();
		registry.register(
			"gauntlet_denied",
			"The total number of certificate requests denied by the gauntlet",
			gauntlet_denied.clone(),
		);

		let gauntlet_aborted = NamespaceCounter::default();
		registry.register(
			"gauntlet_aborted",
			"The total number of gauntlet invocations that timed out or panicked",
			gauntlet_aborted.clone(),
		);

		let gauntlet_duration =
			NamespaceHistogram::new_with_constructor(seconds_histogram as fn() -> Histogram);
		registry.register_with_unit(
			"gauntlet_duration",
			"Time taken by gauntlet invocations",
			Unit::Seconds,
			gauntlet_duration.clone(),
		);

		Metrics {
			requests,
			issued_certs,
			issue_duration,
			issue_size,
			gauntlet_denied,
			gauntlet_aborted,
			gauntlet_duration,
		}
	}

	/// A metrics set backed by a throwaway registry, for contexts that do not
	/// export metrics (one-shot CLI commands, tests).
	pub fn unregistered() -> Self {
		Self::new(&mut Registry::default())
	}
}

#[cfg(test)]
mod tests {
	use prometheus_client::encoding::text::encode;

	use super::*;

	#[test]
	fn test_metrics_encode() {
		let mut registry = Registry::with_prefix("bifrost");
		let metrics = Metrics::new(&mut registry);
		let labels = NamespaceLabels::from(Uuid::new_v4());
		metrics.requests.get_or_create(&labels).inc();
		metrics.issue_duration.get_or_create(&labels).observe(0.01);

		let mut buf = String::new();
		encode(&mut buf, &registry).unwrap();
		assert!(buf.contains("bifrost_requests_total"));
		assert!(buf.contains("bifrost_issue_duration_seconds"));
		assert!(buf.contains(&labels.namespace));
	}
}
