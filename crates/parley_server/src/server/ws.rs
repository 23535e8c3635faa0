#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use futures::{SinkExt as _, StreamExt as _};
use parley_domain::RoomId;
use parley_protocol::{ProtocolError, ServerEvent};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tracing::{debug, info, warn};

use crate::server::chat_list::ChatListSession;
use crate::server::group_bus::{BusItem, ConnectionHandle};
use crate::server::session::{ChatSession, Session};
use crate::server::state::ServerState;

/// Session kind selected by the handshake path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
	Chat(RoomId),
	ChatList,
}

/// `/ws/chat/{roomId}` and `/ws/chat`, each with an optional trailing slash.
pub fn parse_route(path: &str) -> Option<Route> {
	let rest = path.strip_prefix("/ws/chat")?;
	let rest = rest.strip_suffix('/').unwrap_or(rest);
	if rest.is_empty() {
		return Some(Route::ChatList);
	}

	let id = rest.strip_prefix('/')?;
	if id.contains('/') {
		return None;
	}
	id.parse::<RoomId>().ok().map(Route::Chat)
}

/// Value of the `token` query parameter, percent-decoded.
pub fn token_from_query(query: Option<&str>) -> Option<String> {
	url::form_urlencoded::parse(query?.as_bytes())
		.find(|(k, _)| k == "token")
		.map(|(_, v)| v.into_owned())
}

struct ConnectionGaugeGuard;

impl Drop for ConnectionGaugeGuard {
	fn drop(&mut self) {
		metrics::gauge!("parley_server_active_connections").decrement(1.0);
	}
}

/// Accept loop. Each connection runs in its own task; its errors never reach this loop.
pub async fn serve(listener: TcpListener, state: ServerState) -> anyhow::Result<()> {
	loop {
		let (stream, peer) = listener.accept().await.context("accept tcp connection")?;
		metrics::counter!("parley_server_connections_total").increment(1);

		let state = state.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(stream, peer, state).await {
				warn!(%peer, error = %format!("{e:#}"), "connection handler exited with error");
			}
		});
	}
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: ServerState) -> anyhow::Result<()> {
	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let mut target: Option<(Route, Option<String>)> = None;
	let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
		match parse_route(req.uri().path()) {
			Some(route) => {
				target = Some((route, token_from_query(req.uri().query())));
				Ok(resp)
			}
			None => {
				let mut err = ErrorResponse::new(Some("not found".to_string()));
				*err.status_mut() = StatusCode::NOT_FOUND;
				Err(err)
			}
		}
	};

	let ws_config = WebSocketConfig::default()
		.max_message_size(Some(state.limits.max_transport_bytes))
		.max_frame_size(Some(state.limits.max_transport_bytes));

	let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
		Ok(ws) => ws,
		Err(e) => {
			debug!(%peer, error = %e, "websocket handshake failed");
			metrics::counter!("parley_server_handshake_failures_total").increment(1);
			return Ok(());
		}
	};
	let Some((route, token)) = target else {
		return Ok(());
	};

	let conn_id = state.next_conn_id();
	let (handle, mut rx) = ConnectionHandle::channel(conn_id, state.limits.queue_capacity);
	let (mut sink, mut source) = ws.split();

	let opened: Result<Arc<dyn Session>, _> = match route {
		Route::Chat(room) => ChatSession::open(&state, handle.clone(), room, token.as_deref())
			.await
			.map(|s| Arc::new(s) as Arc<dyn Session>),
		Route::ChatList => ChatListSession::open(&state, handle.clone(), token.as_deref())
			.await
			.map(|s| Arc::new(s) as Arc<dyn Session>),
	};

	let session = match opened {
		Ok(s) => s,
		Err(reason) => {
			info!(%conn_id, %peer, ?route, reason = %reason, "session rejected");
			metrics::counter!("parley_server_sessions_rejected_total", "reason" => reason.kind()).increment(1);
			let close = CloseFrame {
				code: CloseCode::Policy,
				reason: reason.to_string().into(),
			};
			let _ = sink.send(Message::Close(Some(close))).await;
			return Ok(());
		}
	};
	let _session_guard = state.health.session_guard();
	debug!(%conn_id, %peer, ?route, "connection established");

	let writer = async {
		while let Some(item) = rx.recv().await {
			match item {
				BusItem::Event(event) => {
					if !session.accepts(&event) {
						continue;
					}
					let json = event.to_json().context("encode outbound event")?;
					sink.send(Message::Text(json.into())).await.context("write frame")?;
				}
				BusItem::Lagged { dropped } => {
					warn!(%conn_id, dropped, "outbound queue lagged; events dropped");
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	};

	let reader = async {
		while let Some(msg) = source.next().await {
			match msg.context("read frame")? {
				Message::Text(text) => session.handle_text(text.as_str()).await,
				Message::Binary(_) => {
					metrics::counter!("parley_server_session_errors_total", "kind" => "binary_frame").increment(1);
					handle.send_local(ServerEvent::error(ProtocolError::BinaryFrame.to_string()));
				}
				Message::Close(_) => break,
				Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
			}
		}
		Ok::<(), anyhow::Error>(())
	};

	let result = tokio::select! {
		r = writer => r,
		r = reader => r,
	};

	session.close().await;
	let _ = sink.close().await;

	if let Err(e) = &result {
		debug!(%conn_id, error = %format!("{e:#}"), "connection ended with error");
	}
	debug!(%conn_id, "connection closed");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn routes() {
		assert_eq!(parse_route("/ws/chat/42"), Some(Route::Chat(RoomId(42))));
		assert_eq!(parse_route("/ws/chat/42/"), Some(Route::Chat(RoomId(42))));
		assert_eq!(parse_route("/ws/chat/"), Some(Route::ChatList));
		assert_eq!(parse_route("/ws/chat"), Some(Route::ChatList));

		assert_eq!(parse_route("/ws/chat/abc"), None);
		assert_eq!(parse_route("/ws/chat/0"), None);
		assert_eq!(parse_route("/ws/chat/1/2"), None);
		assert_eq!(parse_route("/ws/chatroom"), None);
		assert_eq!(parse_route("/ws/other/1"), None);
	}

	#[test]
	fn token_is_percent_decoded() {
		assert_eq!(token_from_query(Some("a=1&token=v1.ab%3D.cd")).as_deref(), Some("v1.ab=.cd"));
		assert_eq!(token_from_query(Some("a=1")), None);
		assert_eq!(token_from_query(None), None);
	}
}
