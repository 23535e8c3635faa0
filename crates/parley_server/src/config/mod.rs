#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_TRANSPORT_SIZE};
use parley_protocol::limits::DEFAULT_ALLOWED_EXTENSIONS;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from `path` (missing file means defaults) plus env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
	pub uploads: UploadSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket bind endpoint (`ws://host:port`). The CLI `--bind` flag wins over this.
	pub bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Largest inbound frame the decoder accepts. Larger frames get an `error` reply.
	pub max_frame_bytes: usize,
	/// WebSocket message cap. Anything above it closes the connection, so it sits well above `max_frame_bytes`.
	pub max_transport_bytes: usize,
	/// Outbound queue depth per connection before events are dropped.
	pub session_queue_capacity: usize,
	pub debug_bus_logs: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: None,
			metrics_bind: None,
			health_bind: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			max_transport_bytes: DEFAULT_MAX_TRANSPORT_SIZE,
			session_queue_capacity: 256,
			debug_bus_logs: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// HMAC secret for stateless access tokens.
	pub hmac_secret: Option<SecretString>,
	/// Lifetime of tokens minted by `--mint-token`.
	pub token_ttl_secs: u64,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			hmac_secret: None,
			token_ttl_secs: 24 * 60 * 60,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). Unset selects the in-memory store.
	pub database_url: Option<String>,
	pub max_inflight: usize,
	pub call_timeout: Duration,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			max_inflight: 64,
			call_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
	/// Prefix for attachment retrieval URLs.
	pub media_base_url: String,
	/// Lowercase extensions without the dot.
	pub allowed_extensions: Vec<String>,
}

impl Default for UploadSettings {
	fn default() -> Self {
		Self {
			media_base_url: "/media".to_string(),
			allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	uploads: FileUploadSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	max_transport_bytes: Option<usize>,
	session_queue_capacity: Option<usize>,
	debug_bus_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	hmac_secret: Option<String>,
	token_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	max_inflight: Option<usize>,
	call_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileUploadSettings {
	media_base_url: Option<String>,
	allowed_extensions: Option<Vec<String>>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerConfig::default();

		Self {
			server: ServerSettings {
				bind: file.server.bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.server.max_frame_bytes),
				max_transport_bytes: file
					.server
					.max_transport_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.server.max_transport_bytes),
				session_queue_capacity: file
					.server
					.session_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.server.session_queue_capacity),
				debug_bus_logs: file.server.debug_bus_logs.unwrap_or(false),
			},
			auth: AuthSettings {
				hmac_secret: file
					.auth
					.hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				token_ttl_secs: file
					.auth
					.token_ttl_secs
					.filter(|v| *v > 0)
					.unwrap_or(defaults.auth.token_ttl_secs),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				max_inflight: file
					.persistence
					.max_inflight
					.filter(|v| *v > 0)
					.unwrap_or(defaults.persistence.max_inflight),
				call_timeout: file
					.persistence
					.call_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(defaults.persistence.call_timeout),
			},
			uploads: UploadSettings {
				media_base_url: file
					.uploads
					.media_base_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.uploads.media_base_url),
				allowed_extensions: file
					.uploads
					.allowed_extensions
					.map(|v| normalize_extensions(v.iter().map(String::as_str)))
					.unwrap_or(defaults.uploads.allowed_extensions),
			},
		}
	}
}

fn normalize_extensions<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
	let mut out: Vec<String> = items
		.map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
		.filter(|s| !s.is_empty())
		.collect();
	out.sort();
	out.dedup();
	out
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_env_overrides_from(cfg, |key| std::env::var(key).ok());
}

fn apply_env_overrides_from(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("PARLEY_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_MAX_TRANSPORT_BYTES")
		&& let Ok(bytes) = v.parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_transport_bytes = bytes;
		info!(bytes, "server config: max_transport_bytes overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_SESSION_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.session_queue_capacity = capacity;
		info!(capacity, "server config: session_queue_capacity overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_DEBUG_BUS_LOGS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.debug_bus_logs = enabled;
		info!(enabled, "server config: debug_bus_logs overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_AUTH_HMAC_SECRET") {
		cfg.auth.hmac_secret = Some(SecretString::new(v));
		info!("server auth: hmac_secret overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_TOKEN_TTL_SECS")
		&& let Ok(ttl) = v.parse::<u64>()
		&& ttl > 0
	{
		cfg.auth.token_ttl_secs = ttl;
		info!(ttl, "server auth: token_ttl_secs overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_STORE_MAX_INFLIGHT")
		&& let Ok(max) = v.parse::<usize>()
		&& max > 0
	{
		cfg.persistence.max_inflight = max;
		info!(max, "persistence: max_inflight overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_STORE_CALL_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.persistence.call_timeout = Duration::from_millis(ms);
		info!(ms, "persistence: call_timeout overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_MEDIA_BASE_URL") {
		cfg.uploads.media_base_url = v;
		info!("uploads: media_base_url overridden by env");
	}

	if let Some(v) = non_empty("PARLEY_ALLOWED_EXTENSIONS") {
		cfg.uploads.allowed_extensions = normalize_extensions(v.split(','));
		info!(
			count = cfg.uploads.allowed_extensions.len(),
			"uploads: allowed_extensions overridden by env"
		);
	}

	if cfg.uploads.allowed_extensions.is_empty() {
		warn!("uploads: allowed_extensions is empty; every file upload will be rejected");
	}

	if cfg.server.max_transport_bytes < cfg.server.max_frame_bytes {
		warn!(
			max_transport_bytes = cfg.server.max_transport_bytes,
			max_frame_bytes = cfg.server.max_frame_bytes,
			"server config: max_transport_bytes raised to max_frame_bytes"
		);
		cfg.server.max_transport_bytes = cfg.server.max_frame_bytes;
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> ServerConfig {
		let file: FileConfig = toml::from_str(toml_src).expect("valid toml");
		ServerConfig::from_file(file)
	}

	#[test]
	fn empty_file_gives_defaults() {
		let cfg = parse("");
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert_eq!(cfg.server.max_transport_bytes, DEFAULT_MAX_TRANSPORT_SIZE);
		assert!(cfg.server.max_transport_bytes > cfg.server.max_frame_bytes);
		assert_eq!(cfg.server.session_queue_capacity, 256);
		assert!(cfg.auth.hmac_secret.is_none());
		assert!(cfg.persistence.database_url.is_none());
		assert_eq!(cfg.uploads.media_base_url, "/media");
		assert!(cfg.uploads.allowed_extensions.iter().any(|e| e == "pdf"));
	}

	#[test]
	fn file_values_are_loaded() {
		let cfg = parse(
			r#"
			[server]
			bind = "ws://0.0.0.0:9000"
			health_bind = "127.0.0.1:9001"
			session_queue_capacity = 8

			[auth]
			hmac_secret = "s3cret"

			[persistence]
			database_url = "sqlite://parley.db"
			call_timeout_ms = 250

			[uploads]
			allowed_extensions = [".PDF", "png", "png", " "]
			"#,
		);

		assert_eq!(cfg.server.bind.as_deref(), Some("ws://0.0.0.0:9000"));
		assert_eq!(cfg.server.session_queue_capacity, 8);
		assert_eq!(cfg.auth.hmac_secret.as_ref().map(|s| s.expose()), Some("s3cret"));
		assert_eq!(cfg.persistence.call_timeout, Duration::from_millis(250));
		assert_eq!(cfg.uploads.allowed_extensions, vec!["pdf".to_string(), "png".to_string()]);
	}

	#[test]
	fn env_overrides_win_and_junk_is_ignored() {
		let mut cfg = parse("[server]\nsession_queue_capacity = 8\n");
		let env: HashMap<&str, &str> = HashMap::from([
			("PARLEY_AUTH_HMAC_SECRET", " from-env "),
			("PARLEY_SESSION_QUEUE_CAPACITY", "not-a-number"),
			("PARLEY_DEBUG_BUS_LOGS", "yes"),
			("PARLEY_ALLOWED_EXTENSIONS", "txt, .ZIP"),
			("PARLEY_DATABASE_URL", "   "),
		]);

		apply_env_overrides_from(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.auth.hmac_secret.as_ref().map(|s| s.expose()), Some("from-env"));
		assert_eq!(cfg.server.session_queue_capacity, 8);
		assert!(cfg.server.debug_bus_logs);
		assert_eq!(cfg.uploads.allowed_extensions, vec!["txt".to_string(), "zip".to_string()]);
		assert!(cfg.persistence.database_url.is_none());
	}

	#[test]
	fn transport_cap_never_sits_below_frame_limit() {
		let mut cfg = parse("[server]\nmax_frame_bytes = 1024\nmax_transport_bytes = 512\n");
		apply_env_overrides_from(&mut cfg, |_| None);
		assert_eq!(cfg.server.max_transport_bytes, 1024);

		let env: HashMap<&str, &str> = HashMap::from([("PARLEY_MAX_TRANSPORT_BYTES", "4096")]);
		apply_env_overrides_from(&mut cfg, |k| env.get(k).map(|v| v.to_string()));
		assert_eq!(cfg.server.max_transport_bytes, 4096);
	}

	#[test]
	fn secrets_are_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert!(!format!("{s:?}").contains("hunter2"));
	}
}
