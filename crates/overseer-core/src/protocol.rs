use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sent to a launched service as one JSON line on its stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
	pub action: ControlAction,
	#[serde(default)]
	pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
	Start,
	Stop,
	Status,
}

impl ControlMessage {
	pub fn new(action: ControlAction, options: &Map<String, Value>) -> Self {
		Self {
			action,
			options: options.clone(),
		}
	}

	pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
		let mut data = serde_json::to_vec(self)?;
		data.push(b'\n');
		Ok(data)
	}
}

/// A frame received on the push channel. `kind` is an action name, `tail` or `stopTail`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientMessage {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub data: Option<Value>,
	#[serde(default)]
	pub id: Option<u64>,
}

impl ClientMessage {
	/// Message data as an options map; scalars and null become an empty map.
	pub fn options(&self) -> Map<String, Value> {
		match &self.data {
			Some(Value::Object(map)) => map.clone(),
			Some(Value::String(service)) => {
				let mut map = Map::new();
				map.insert("service".into(), Value::String(service.clone()));
				map
			}
			_ => Map::new(),
		}
	}
}

/// A frame sent on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
	Reply { id: u64, data: Value },
	Event { topic: String, data: Value },
}

pub const TAIL_MESSAGE: &str = "tail";
pub const STOP_TAIL_MESSAGE: &str = "stopTail";

pub fn config_dir() -> std::path::PathBuf {
	if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
		std::path::PathBuf::from(dir).join("overseer")
	} else if let Some(home) = home_dir() {
		home.join(".config").join("overseer")
	} else {
		std::path::PathBuf::from("/tmp/overseer/config")
	}
}

fn home_dir() -> Option<std::path::PathBuf> {
	std::env::var("HOME").ok().map(std::path::PathBuf::from)
}
