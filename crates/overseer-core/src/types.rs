use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// What a service name launches: a shell command line run through `sh -c`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchTarget(pub String);

impl LaunchTarget {
	pub fn command(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for LaunchTarget {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
	pub name: String,
	pub target: LaunchTarget,
}

/// A JSON object payload: a child's reply, an action result, or an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reply(pub Map<String, Value>);

impl Reply {
	pub fn new() -> Self {
		Self(Map::new())
	}

	pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
		self.0.insert(key.to_string(), value.into());
		self
	}

	pub fn with_service(self, service: &str) -> Self {
		self.with("service", service)
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.0.get(key)
	}

	pub fn flag(&self, key: &str) -> bool {
		self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
	}

	pub fn error(&self) -> Option<&str> {
		match self.0.get("error") {
			Some(Value::String(s)) => Some(s),
			Some(Value::Null) | None => None,
			Some(_) => Some("error"),
		}
	}

	pub fn is_error(&self) -> bool {
		self.error().is_some()
	}

	pub fn into_value(self) -> Value {
		Value::Object(self.0)
	}
}

/// Caller-supplied options forwarded to a service with each control message.
pub type Options = Map<String, Value>;

/// Result of any action: both arms travel the wire as the same payload shape.
pub type Outcome = Result<Reply, Reply>;

pub fn outcome_value(outcome: Outcome) -> Value {
	match outcome {
		Ok(reply) | Err(reply) => reply.into_value(),
	}
}

/// A push-channel broadcast: action results and tail lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
	pub topic: String,
	pub data: Value,
}

impl Event {
	pub fn new(topic: impl Into<String>, data: Value) -> Self {
		Self {
			topic: topic.into(),
			data,
		}
	}
}

/// The fixed action set shared by the HTTP and push-channel surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
	Start,
	Stop,
	Restart,
	Status,
	List,
	Services,
	Logs,
	Actions,
}

impl Action {
	pub const ALL: [Action; 8] = [
		Action::Start,
		Action::Stop,
		Action::Restart,
		Action::Status,
		Action::List,
		Action::Services,
		Action::Logs,
		Action::Actions,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			Action::Start => "start",
			Action::Stop => "stop",
			Action::Restart => "restart",
			Action::Status => "status",
			Action::List => "list",
			Action::Services => "services",
			Action::Logs => "logs",
			Action::Actions => "actions",
		}
	}

	/// Actions whose results are broadcast to every push client.
	pub fn broadcasts(&self) -> bool {
		matches!(self, Action::Start | Action::Stop | Action::Restart | Action::Status)
	}

	pub fn names() -> Vec<&'static str> {
		Self::ALL.iter().map(Action::as_str).collect()
	}
}

impl fmt::Display for Action {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Action {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Action::ALL
			.iter()
			.copied()
			.find(|a| a.as_str() == s)
			.ok_or_else(|| format!("unknown action: {}", s))
	}
}

pub fn tail_topic(path: &str) -> String {
	format!("{}-tail", path)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn action_round_trips_through_its_name() {
		for action in Action::ALL {
			assert_eq!(action.as_str().parse::<Action>(), Ok(action));
		}
		assert!("tail".parse::<Action>().is_err());
	}

	#[test]
	fn only_state_changing_actions_broadcast() {
		let broadcasting: Vec<_> = Action::ALL.iter().filter(|a| a.broadcasts()).collect();
		assert_eq!(
			broadcasting,
			vec![&Action::Start, &Action::Stop, &Action::Restart, &Action::Status]
		);
	}

	#[test]
	fn reply_error_detection() {
		let ok = Reply::new().with("started", true);
		assert!(!ok.is_error());
		assert!(ok.flag("started"));

		let err = Reply::new().with("error", "boom");
		assert_eq!(err.error(), Some("boom"));

		let null_err = Reply::new().with("stopped", true).with("error", Value::Null);
		assert!(!null_err.is_error());
	}

	#[test]
	fn topic_naming() {
		assert_eq!(tail_topic("/var/log/app.log"), "/var/log/app.log-tail");
	}
}
