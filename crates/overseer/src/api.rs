use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use overseer_core::protocol::{ClientMessage, ServerMessage, STOP_TAIL_MESSAGE, TAIL_MESSAGE};
use overseer_core::types::{outcome_value, Action, Options};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;

use crate::events::{Broadcaster, Subscriber};
use crate::supervisor::Supervisor;
use crate::tail::TailManager;

/// Dispatches actions to the supervisor and tail manager. Holds no state of
/// its own beyond the handles it delegates to.
#[derive(Clone)]
pub struct Gateway {
	pub supervisor: Arc<Supervisor>,
	pub tails: Arc<TailManager>,
	pub events: Broadcaster,
}

impl Gateway {
	pub async fn dispatch(&self, action: Action, options: Options) -> Value {
		let service = options
			.get("service")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();

		match action {
			Action::Start => outcome_value(self.supervisor.start(&service, &options).await),
			Action::Stop => outcome_value(self.supervisor.stop(&service, &options).await),
			Action::Restart => outcome_value(self.supervisor.restart(&service, &options).await),
			Action::Status if service.is_empty() => match self.supervisor.status_all(&options).await {
				Ok(entries) => Value::Array(entries.into_iter().map(outcome_value).collect()),
				Err(reply) => reply.into_value(),
			},
			Action::Status => outcome_value(self.supervisor.status(&service, &options).await),
			Action::List => json!({ "running": self.supervisor.list() }),
			Action::Services => json!({ "services": self.supervisor.services() }),
			Action::Logs => json!({ "logs": self.tails.logs() }),
			Action::Actions => json!({ "actions": Action::names() }),
		}
	}

	/// Handles one push-channel frame for `subscriber`.
	pub async fn handle_message(&self, message: ClientMessage, subscriber: &Subscriber) -> Value {
		let options = message.options();
		let field = |key: &str| options.get(key).and_then(Value::as_str).map(str::to_string);

		match message.kind.as_str() {
			TAIL_MESSAGE => {
				let path = field("path").unwrap_or_default();
				let encoding = field("encoding");
				outcome_value(self.tails.tail(&path, Some(subscriber), encoding.as_deref()))
			}
			STOP_TAIL_MESSAGE => {
				let path = field("path").unwrap_or_default();
				self.tails.stop_tail(&path, subscriber).into_value()
			}
			kind => match kind.parse::<Action>() {
				Ok(action) => self.dispatch(action, options).await,
				Err(_) => json!({ "error": format!("unknown message type {}", kind) }),
			},
		}
	}
}

pub fn router(gateway: Gateway, base_path: &str) -> Router {
	let base = base_path.trim_end_matches('/');
	let mut router = Router::new();

	for action in Action::ALL {
		router = router.route(
			&format!("{}/{}", base, action),
			get(
				move |State(gateway): State<Gateway>, Query(params): Query<HashMap<String, String>>| async move {
					Json(gateway.dispatch(action, query_options(params)).await)
				},
			),
		);
	}

	router
		.route(&format!("{}/ws", base), get(ws_connect))
		.layer(CorsLayer::permissive())
		.with_state(gateway)
}

fn query_options(params: HashMap<String, String>) -> Options {
	params.into_iter().map(|(k, v)| (k, Value::String(v))).collect()
}

async fn ws_connect(State(gateway): State<Gateway>, ws: WebSocketUpgrade) -> impl IntoResponse {
	ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(mut socket: WebSocket, gateway: Gateway) {
	let (subscriber, mut tail_events) = Subscriber::new();
	let mut broadcasts = gateway.events.subscribe();
	let (replies_tx, mut replies) = mpsc::unbounded_channel::<ServerMessage>();
	tracing::debug!("push client {} connected", subscriber.id());

	loop {
		let outgoing = tokio::select! {
			incoming = socket.recv() => match incoming {
				Some(Ok(Message::Text(text))) => {
					let message = match serde_json::from_str::<ClientMessage>(text.as_str()) {
						Ok(message) => message,
						Err(e) => {
							tracing::warn!("invalid push message: {}", e);
							continue;
						}
					};
					let gateway = gateway.clone();
					let subscriber = subscriber.clone();
					let replies_tx = replies_tx.clone();
					// Each frame runs on its own so a slow child never stalls the connection.
					tokio::spawn(async move {
						let id = message.id;
						let data = gateway.handle_message(message, &subscriber).await;
						if let Some(id) = id {
							let _ = replies_tx.send(ServerMessage::Reply { id, data });
						}
					});
					continue;
				}
				Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
				Some(Ok(_)) => continue,
			},
			Some(reply) = replies.recv() => reply,
			Some(event) = tail_events.recv() => ServerMessage::Event { topic: event.topic, data: event.data },
			event = broadcasts.recv() => match event {
				Ok(event) => ServerMessage::Event { topic: event.topic, data: event.data },
				Err(broadcast::error::RecvError::Lagged(n)) => {
					tracing::warn!("push client {} missed {} events", subscriber.id(), n);
					continue;
				}
				Err(broadcast::error::RecvError::Closed) => break,
			},
		};

		let text = match serde_json::to_string(&outgoing) {
			Ok(text) => text,
			Err(e) => {
				tracing::error!("failed to serialize push message: {}", e);
				continue;
			}
		};
		if socket.send(Message::Text(text.into())).await.is_err() {
			break;
		}
	}

	gateway.tails.disconnect(&subscriber);
	tracing::debug!("push client {} disconnected", subscriber.id());
}
