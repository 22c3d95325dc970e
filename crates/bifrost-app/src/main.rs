use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use bifrost::ca::{self, Ca};
use bifrost::client::Client;
use bifrost::http::hofund::{CLIENT_CERT_HEADER, CLIENT_CERT_LEAF_HEADER, HofundLayer};
use bifrost::http::{Method, Server, StatusCode, plaintext_response};
use bifrost::identity::{self, PrivateKey, PublicKey};
use bifrost::proxy::Proxy;
use bifrost::signal::Shutdown;
use bifrost::telemetry::{self, metrics::Metrics};
use bifrost::x509::{Certificate, CertificateRequest};
use bifrost::tls;
use clap::{Args, Parser, Subcommand};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tracing::info;
use url::Url;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "bifrost", about = "mTLS identity toolkit", version)]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the certificate authority HTTP server
	Serve(ServeArgs),
	/// Issue a certificate locally from a CSR
	Issue(IssueArgs),
	/// Request a certificate from a remote CA
	Request(RequestArgs),
	/// Print the identity derived from a key or certificate
	Identity(IdentityArgs),
	/// Run the TLS terminating identity proxy
	Proxy(ProxyArgs),
	/// Create namespaces, keys, CSRs, and CA certificates
	#[command(subcommand)]
	New(NewCommand),
}

#[derive(Args, Debug)]
struct CaMaterial {
	/// CA certificate file (PEM)
	#[arg(long, value_name = "file", default_value = "cert.pem")]
	ca_cert: PathBuf,

	/// CA private key file (PEM)
	#[arg(long, value_name = "file", default_value = "key.pem")]
	ca_key: PathBuf,
}

#[derive(Args, Debug)]
struct ServeArgs {
	#[command(flatten)]
	ca: CaMaterial,

	#[arg(long, default_value = "127.0.0.1")]
	host: IpAddr,

	#[arg(long, default_value_t = 8008)]
	port: u16,
}

#[derive(Args, Debug)]
struct IssueArgs {
	#[command(flatten)]
	ca: CaMaterial,

	/// CSR file (PEM); stdin when omitted
	csr: Option<PathBuf>,

	#[arg(long, value_name = "time")]
	not_before: Option<String>,

	#[arg(long, value_name = "time")]
	not_after: Option<String>,

	/// Output file; stdout when omitted
	#[arg(long, short, value_name = "file")]
	output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RequestArgs {
	/// Base URL of the CA
	#[arg(long, value_name = "url", default_value = "http://127.0.0.1:8008")]
	ca_url: Url,

	/// Namespace to request in; fetched from the CA when omitted
	#[arg(long, value_name = "uuid")]
	namespace: Option<Uuid>,

	/// Client private key file (PEM); stdin when omitted
	key: Option<PathBuf>,

	#[arg(long, value_name = "time")]
	not_before: Option<String>,

	#[arg(long, value_name = "time")]
	not_after: Option<String>,

	/// Output file; stdout when omitted
	#[arg(long, short, value_name = "file")]
	output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct IdentityArgs {
	/// Key or certificate file (PEM); stdin when omitted
	input: Option<PathBuf>,

	/// Namespace for deriving identities from bare keys
	#[arg(long, value_name = "uuid")]
	namespace: Option<Uuid>,
}

#[derive(Args, Debug)]
struct ProxyArgs {
	/// CA certificate trusted for client authentication (PEM)
	#[arg(long, value_name = "file", default_value = "cert.pem")]
	ca_cert: PathBuf,

	/// Server TLS certificate chain (PEM)
	#[arg(long, value_name = "file")]
	server_cert: PathBuf,

	/// Server TLS private key (PEM)
	#[arg(long, value_name = "file")]
	server_key: PathBuf,

	/// Backend URL requests are forwarded to
	#[arg(long, value_name = "url")]
	backend_url: Url,

	/// Identity header to set: "leaf" or "full"
	#[arg(long, default_value = "leaf")]
	header: String,

	#[arg(long, default_value = "127.0.0.1")]
	host: IpAddr,

	#[arg(long, default_value_t = 8443)]
	port: u16,
}

#[derive(Subcommand, Debug)]
enum NewCommand {
	/// Generate a namespace UUID
	Namespace,
	/// Generate an ECDSA P-256 private key
	PrivateKey {
		/// Output file; stdout when omitted
		#[arg(long, short, value_name = "file")]
		output: Option<PathBuf>,
	},
	/// Build a CSR for a private key
	CertificateRequest {
		/// Private key file (PEM); stdin when omitted
		key: Option<PathBuf>,

		#[arg(long, value_name = "uuid")]
		namespace: Uuid,

		/// Output file; stdout when omitted
		#[arg(long, short, value_name = "file")]
		output: Option<PathBuf>,
	},
	/// Self-sign a CA certificate for a private key
	CaCertificate {
		/// CA private key file (PEM); stdin when omitted
		key: Option<PathBuf>,

		/// Namespace; generated when omitted
		#[arg(long, value_name = "uuid")]
		namespace: Option<Uuid>,

		#[arg(long, value_name = "time")]
		not_before: Option<String>,

		/// Defaults to one year
		#[arg(long, value_name = "time", default_value = "+8760h")]
		not_after: String,

		/// Output file; stdout when omitted
		#[arg(long, short, value_name = "file")]
		output: Option<PathBuf>,
	},
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let cli = Cli::parse();
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("tokio runtime builds")
		.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
	match cli.command {
		Command::Serve(args) => serve(args).await,
		Command::Issue(args) => issue(args).await,
		Command::Request(args) => request(args).await,
		Command::Identity(args) => identity_cmd(args),
		Command::Proxy(args) => proxy(args).await,
		Command::New(cmd) => new(cmd),
	}
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
	let (cert, key) = load_ca_material(&args.ca)?;
	let mut registry = Registry::with_prefix("bifrost");
	let metrics = Arc::new(Metrics::new(&mut registry));
	let ca = Arc::new(Ca::new(cert, key, None, metrics)?);

	let shutdown = Shutdown::new();
	let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
	let state = ServeState {
		ca: ca.clone(),
		registry: Mutex::new(registry),
	};
	let server = Server::bind("ca", SocketAddr::new(args.host, args.port), stop_rx, state).await?;
	info!(address = %server.address(), namespace = %ca.namespace(), "certificate authority listening");
	server.spawn(|state, req| async move {
		match (req.method(), req.uri().path()) {
			(&Method::GET, "/metrics") => Ok(metrics_response(&state.registry)),
			(&Method::GET, "/healthz") => {
				Ok(plaintext_response(StatusCode::OK, "ok\n".to_string()))
			},
			_ => ca::web::handle(state.ca.clone(), req).await,
		}
	});

	shutdown.wait().await;
	let _ = stop_tx.send(true);
	ca.close().await;
	Ok(())
}

struct ServeState {
	ca: Arc<Ca>,
	registry: Mutex<Registry>,
}

fn metrics_response(registry: &Mutex<Registry>) -> bifrost::http::Response {
	let mut buf = String::new();
	let registry = registry.lock().expect("metrics registry lock");
	if let Err(err) = encode(&mut buf, &registry) {
		return plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
	}
	plaintext_response(StatusCode::OK, buf)
}

async fn issue(args: IssueArgs) -> anyhow::Result<()> {
	let (cert, key) = load_ca_material(&args.ca)?;
	let ca = Ca::new(cert, key, None, Arc::new(Metrics::unregistered()))?;
	let csr = CertificateRequest::from_pem(&read_input(args.csr.as_deref())?)?;
	let (not_before, not_after) =
		ca::parse_validity(args.not_before.as_deref(), args.not_after.as_deref())?;
	let der = ca.issue_certificate(csr.der(), not_before, not_after).await?;
	let cert = Certificate::from_der(der)?;
	write_output(args.output.as_deref(), cert.to_pem().as_bytes())
}

async fn request(args: RequestArgs) -> anyhow::Result<()> {
	let key = PrivateKey::from_pem(&read_input(args.key.as_deref())?)?;
	let client = Client::new(args.ca_url);
	let namespace = match args.namespace {
		Some(namespace) => namespace,
		None => client.namespace().await?,
	};
	let cert = client
		.request_certificate(
			namespace,
			&key,
			args.not_before.as_deref(),
			args.not_after.as_deref(),
		)
		.await?;
	info!(id = %cert.id, namespace = %cert.namespace, "certificate issued");
	write_output(args.output.as_deref(), cert.to_pem().as_bytes())
}

fn identity_cmd(args: IdentityArgs) -> anyhow::Result<()> {
	let input = read_input(args.input.as_deref())?;
	if let Ok(cert) = Certificate::from_pem(&input) {
		println!("{}", cert.id);
		return Ok(());
	}
	let public_key = public_key_from_pem(&input)?;
	let namespace = args
		.namespace
		.context("--namespace is required to derive an identity from a bare key")?;
	println!("{}", identity::derive_id(namespace, &public_key));
	Ok(())
}

fn public_key_from_pem(input: &[u8]) -> anyhow::Result<PublicKey> {
	if let Ok(key) = PrivateKey::from_pem(input) {
		return Ok(key.public_key());
	}
	let text = std::str::from_utf8(input).context("input is not text")?;
	Ok(PublicKey::from_pem(text)?)
}

async fn proxy(args: ProxyArgs) -> anyhow::Result<()> {
	let ca_cert = Certificate::from_pem(&std::fs::read(&args.ca_cert)?)?;
	let server_chain = read_cert_chain(&args.server_cert)?;
	let server_key = PrivateKey::from_pem(&std::fs::read(&args.server_key)?)?;
	let tls = tls::mtls_server_config(&ca_cert, server_chain, &server_key)?;

	let hofund = HofundLayer::new(ca_cert.namespace).with_header(match args.header.as_str() {
		"leaf" => CLIENT_CERT_LEAF_HEADER.parse()?,
		"full" => CLIENT_CERT_HEADER.parse()?,
		other => other.to_ascii_lowercase().parse()?,
	});

	let shutdown = Shutdown::new();
	let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
	let proxy = Proxy::bind(
		SocketAddr::new(args.host, args.port),
		tls,
		hofund,
		args.backend_url,
		stop_rx,
	)
	.await?;
	let proxy = tokio::spawn(proxy.run());

	shutdown.wait().await;
	let _ = stop_tx.send(true);
	proxy.await??;
	Ok(())
}

fn new(cmd: NewCommand) -> anyhow::Result<()> {
	match cmd {
		NewCommand::Namespace => {
			println!("{}", Uuid::new_v4());
			Ok(())
		},
		NewCommand::PrivateKey { output } => {
			let key = PrivateKey::generate();
			write_output(output.as_deref(), key.to_pkcs8_pem()?.as_bytes())
		},
		NewCommand::CertificateRequest {
			key,
			namespace,
			output,
		} => {
			let key = PrivateKey::from_pem(&read_input(key.as_deref())?)?;
			let der = CertificateRequest::create(namespace, &key)?;
			let csr = CertificateRequest::from_der(der)?;
			write_output(output.as_deref(), csr.to_pem().as_bytes())
		},
		NewCommand::CaCertificate {
			key,
			namespace,
			not_before,
			not_after,
			output,
		} => {
			let key = PrivateKey::from_pem(&read_input(key.as_deref())?)?;
			let namespace = namespace.unwrap_or_else(|| {
				let namespace = Uuid::new_v4();
				info!(%namespace, "generated new namespace");
				namespace
			});
			let (not_before, not_after) =
				ca::parse_validity(not_before.as_deref(), Some(not_after.as_str()))?;
			let cert = ca::issue_ca_certificate(namespace, &key, not_before, not_after)?;
			write_output(output.as_deref(), cert.to_pem().as_bytes())
		},
	}
}

fn load_ca_material(args: &CaMaterial) -> anyhow::Result<(Certificate, PrivateKey)> {
	let cert = Certificate::from_pem(
		&std::fs::read(&args.ca_cert)
			.with_context(|| format!("reading {}", args.ca_cert.display()))?,
	)?;
	let key = PrivateKey::from_pem(
		&std::fs::read(&args.ca_key)
			.with_context(|| format!("reading {}", args.ca_key.display()))?,
	)?;
	Ok((cert, key))
}

fn read_cert_chain(path: &Path) -> anyhow::Result<Vec<rustls_pki_types::CertificateDer<'static>>> {
	let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
	let chain = rustls_pemfile::certs(&mut std::io::BufReader::new(std::io::Cursor::new(data)))
		.collect::<Result<Vec<_>, _>>()
		.with_context(|| format!("parsing certificates from {}", path.display()))?;
	if chain.is_empty() {
		anyhow::bail!("no certificates found in {}", path.display());
	}
	Ok(chain)
}

/// Read a PEM input from a file, or stdin when no file is given.
fn read_input(path: Option<&Path>) -> anyhow::Result<Vec<u8>> {
	match path {
		Some(path) => {
			std::fs::read(path).with_context(|| format!("reading {}", path.display()))
		},
		None => {
			let mut buf = Vec::new();
			std::io::stdin()
				.read_to_end(&mut buf)
				.context("reading stdin")?;
			Ok(buf)
		},
	}
}

fn write_output(path: Option<&Path>, data: &[u8]) -> anyhow::Result<()> {
	match path {
		Some(path) => {
			std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
		},
		None => {
			std::io::stdout().write_all(data).context("writing stdout")
		},
	}
}
