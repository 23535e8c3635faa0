#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	active_sessions: Arc<AtomicUsize>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	pub fn active_sessions(&self) -> usize {
		self.active_sessions.load(Ordering::Relaxed)
	}

	/// Count a joined session until the returned guard drops.
	pub fn session_guard(&self) -> SessionGuard {
		self.active_sessions.fetch_add(1, Ordering::Relaxed);
		metrics::gauge!("parley_server_active_sessions").increment(1.0);
		SessionGuard {
			active_sessions: Arc::clone(&self.active_sessions),
		}
	}
}

pub struct SessionGuard {
	active_sessions: Arc<AtomicUsize>,
}

impl Drop for SessionGuard {
	fn drop(&mut self) {
		self.active_sessions.fetch_sub(1, Ordering::Relaxed);
		metrics::gauge!("parley_server_active_sessions").decrement(1.0);
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req: Request<Incoming>| {
				let state = state.clone();
				async move { Ok::<_, hyper::Error>(respond(req.method(), req.uri().path(), &state)) }
			});
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return response(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => response(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" => {
			let ready = state.is_ready();
			let body = serde_json::json!({
				"ready": ready,
				"active_sessions": state.active_sessions(),
			});
			let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
			let mut resp = response(status, Bytes::from(body.to_string()));
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		_ => response(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

fn response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;

	use super::*;

	async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		serde_json::from_slice(&bytes).unwrap()
	}

	#[tokio::test]
	async fn readyz_reports_sessions_once_ready() {
		let state = HealthState::new();
		let resp = respond(&Method::GET, "/readyz", &state);
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

		state.mark_ready();
		let guard = state.session_guard();
		let resp = respond(&Method::GET, "/readyz", &state);
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			body_json(resp).await,
			serde_json::json!({"ready": true, "active_sessions": 1})
		);

		drop(guard);
		assert_eq!(state.active_sessions(), 0);
	}

	#[test]
	fn other_routes_and_methods() {
		let state = HealthState::new();
		assert_eq!(respond(&Method::GET, "/healthz", &state).status(), StatusCode::OK);
		assert_eq!(respond(&Method::POST, "/healthz", &state).status(), StatusCode::METHOD_NOT_ALLOWED);
		assert_eq!(respond(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
	}
}
