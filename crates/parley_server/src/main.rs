#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use parley_domain::UserId;
use parley_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use parley_server::server::auth::mint_token;
use parley_server::server::health::{HealthState, spawn_health_server};
use parley_server::server::state::ServerState;
use parley_server::server::store::{BoundedStore, BoundedStoreConfig, ChatStore, InMemoryStore, SqlStore};
use parley_server::server::ws;
use parley_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_BIND: &str = "ws://127.0.0.1:8000";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind ws://host:port] [--config path] [--mint-token user_id]\n\
\n\
Options:\n\
\t--bind         Bind endpoint (default: {DEFAULT_BIND})\n\
\t              Format: ws://host:port\n\
\t--config       Config file (default: ~/.parley/config.toml)\n\
\t--mint-token   Print an access token for the given user id and exit\n\
\t--help         Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
	mint_token: Option<UserId>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			"--mint-token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let user = v.parse::<UserId>().unwrap_or_else(|e| {
					eprintln!("--mint-token: {e}");
					usage_and_exit();
				});
				args.mint_token = Some(user);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn resolve_bind(cli: Option<&str>, cfg: &ServerConfig) -> SocketAddr {
	let raw = cli.or(cfg.server.bind.as_deref()).unwrap_or(DEFAULT_BIND);

	let endpoint = WsEndpoint::parse(raw).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	endpoint.to_socket_addr().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("parley_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn open_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn ChatStore>> {
	let inner: Arc<dyn ChatStore> = match cfg.persistence.database_url.as_deref() {
		Some(url) => {
			let store = SqlStore::connect(url, cfg.uploads.media_base_url.clone()).await?;
			info!(backend = store.backend_name(), "storage connected");
			Arc::new(store)
		}
		None => {
			warn!("no persistence.database_url configured; using in-memory store (data is lost on exit)");
			Arc::new(InMemoryStore::new(cfg.uploads.media_base_url.clone()))
		}
	};

	Ok(Arc::new(BoundedStore::new(
		inner,
		BoundedStoreConfig {
			max_inflight: cfg.persistence.max_inflight,
			call_timeout: cfg.persistence.call_timeout,
		},
	)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(user) = args.mint_token {
		let secret = server_cfg
			.auth
			.hmac_secret
			.as_ref()
			.ok_or_else(|| anyhow!("auth.hmac_secret (or PARLEY_AUTH_HMAC_SECRET) is required to mint tokens"))?;
		println!("{}", mint_token(user, server_cfg.auth.token_ttl_secs, secret.expose())?);
		return Ok(());
	}

	let bind_addr = resolve_bind(args.bind.as_deref(), &server_cfg);

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store = open_store(&server_cfg).await?;
	let state = ServerState::new(&server_cfg, store, health_state.clone())?;

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	health_state.mark_ready();
	info!(bind = %bind_addr, "parley_server: websocket endpoint ready");

	tokio::select! {
		res = ws::serve(listener, state) => res,
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown requested");
			Ok(())
		}
	}
}
