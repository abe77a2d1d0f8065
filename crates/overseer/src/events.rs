use overseer_core::types::Event;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};

/// Fans action results out to every connected push client.
#[derive(Clone)]
pub struct Broadcaster {
	sender: broadcast::Sender<Event>,
}

impl Broadcaster {
	pub fn new() -> Self {
		let (sender, _) = broadcast::channel(256);
		Self { sender }
	}

	pub fn emit(&self, topic: &str, data: Value) {
		tracing::debug!("broadcast {}", topic);
		// No receivers just means no clients are connected.
		let _ = self.sender.send(Event::new(topic, data));
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.sender.subscribe()
	}
}

impl Default for Broadcaster {
	fn default() -> Self {
		Self::new()
	}
}

static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

/// One push-channel connection, as seen by the tail manager.
#[derive(Clone, Debug)]
pub struct Subscriber {
	id: u64,
	outgoing: mpsc::UnboundedSender<Event>,
}

impl Subscriber {
	pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
		let (outgoing, rx) = mpsc::unbounded_channel();
		let id = NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed);
		(Self { id, outgoing }, rx)
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	/// Returns false once the connection is gone.
	pub fn send(&self, event: Event) -> bool {
		self.outgoing.send(event).is_ok()
	}
}

impl PartialEq for Subscriber {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for Subscriber {}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn broadcast_reaches_every_receiver() {
		let b = Broadcaster::new();
		let mut r1 = b.subscribe();
		let mut r2 = b.subscribe();
		b.emit("start", json!({"started": true}));
		assert_eq!(r1.recv().await.unwrap().topic, "start");
		assert_eq!(r2.recv().await.unwrap().data, json!({"started": true}));
	}

	#[test]
	fn emit_without_receivers_is_fine() {
		Broadcaster::new().emit("stop", json!({}));
	}

	#[test]
	fn subscribers_compare_by_identity() {
		let (a, _ra) = Subscriber::new();
		let (b, _rb) = Subscriber::new();
		assert_eq!(a, a.clone());
		assert_ne!(a, b);
	}

	#[test]
	fn send_fails_after_disconnect() {
		let (a, rx) = Subscriber::new();
		assert!(a.send(Event::new("t", json!(null))));
		drop(rx);
		assert!(!a.send(Event::new("t", json!(null))));
	}
}
