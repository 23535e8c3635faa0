#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `ws://host:port` listen endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl WsEndpoint {
		pub const SCHEME: &'static str = "ws://";

		/// Returns `host:port` (IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr`; only IP literals are accepted for binding.
		pub fn to_socket_addr(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("bind host must be an IP literal: {}", self.host))
		}

		/// Parse `ws://host:port`. A bare `host:port` is accepted too.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let rest = s.strip_prefix(Self::SCHEME).unwrap_or(s);
			if rest.contains("://") {
				return Err(format!("unsupported scheme (expected ws://host:port): {s}"));
			}

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("endpoint must not carry a path, query or fragment: {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("missing :port (expected ws://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("missing host (expected ws://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("IPv6 hosts must be bracketed like ws://[::1]:8000: {s}"));
			}

			let port = port_str
				.trim()
				.parse::<u16>()
				.ok()
				.filter(|p| *p != 0)
				.ok_or_else(|| format!("invalid port (expected 1..=65535): {s}"))?;

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	impl std::fmt::Display for WsEndpoint {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			write!(f, "{}{}", Self::SCHEME, self.hostport())
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_ipv4_with_and_without_scheme() {
			let a = WsEndpoint::parse("ws://127.0.0.1:8000").unwrap();
			let b = WsEndpoint::parse("127.0.0.1:8000").unwrap();
			assert_eq!(a, b);
			assert_eq!(a.to_string(), "ws://127.0.0.1:8000");
			assert_eq!(a.to_socket_addr().unwrap().to_string(), "127.0.0.1:8000");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = WsEndpoint::parse("ws://[::1]:9000").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.to_socket_addr().unwrap().to_string(), "[::1]:9000");
		}

		#[test]
		fn rejects_bad_endpoints() {
			assert!(WsEndpoint::parse("").is_err());
			assert!(WsEndpoint::parse("quic://127.0.0.1:8000").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:8000/ws").is_err());
			assert!(WsEndpoint::parse("ws://::1:8000").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:0").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1").is_err());
		}

		#[test]
		fn dns_names_parse_but_do_not_bind() {
			let e = WsEndpoint::parse("ws://chat.example.com:443").unwrap();
			assert!(e.to_socket_addr().is_err());
		}
	}
}

pub mod time {
	use std::time::{SystemTime, UNIX_EPOCH};

	/// Current Unix time in whole seconds.
	#[inline]
	pub fn unix_secs_now() -> u64 {
		SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
	}
}
