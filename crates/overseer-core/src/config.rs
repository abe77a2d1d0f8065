use crate::protocol::config_dir;
use crate::types::{LaunchTarget, ServiceDescriptor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Settings {
	#[serde(default)]
	pub monitor: MonitorConfig,
	#[serde(default)]
	pub tail: TailConfig,
	#[serde(default)]
	pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MonitorConfig {
	#[serde(default = "default_host")]
	pub host: String,
	#[serde(default = "default_port")]
	pub port: u16,
	#[serde(default = "default_base_path")]
	pub base_path: String,
	/// Service name → shell command line.
	#[serde(default)]
	pub services: BTreeMap<String, String>,
	#[serde(default)]
	pub logs: Vec<String>,
	/// Zero waits forever.
	#[serde(default = "default_reply_timeout")]
	pub reply_timeout_secs: u64,
	#[serde(default = "default_restart_delay")]
	pub restart_delay_ms: u64,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			host: default_host(),
			port: default_port(),
			base_path: default_base_path(),
			services: BTreeMap::new(),
			logs: Vec::new(),
			reply_timeout_secs: default_reply_timeout(),
			restart_delay_ms: default_restart_delay(),
		}
	}
}

impl MonitorConfig {
	pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
		descriptors(&self.services)
	}

	pub fn reply_timeout(&self) -> Option<Duration> {
		match self.reply_timeout_secs {
			0 => None,
			secs => Some(Duration::from_secs(secs)),
		}
	}

	pub fn restart_delay(&self) -> Duration {
		Duration::from_millis(self.restart_delay_ms)
	}
}

fn default_host() -> String {
	"localhost".into()
}
fn default_port() -> u16 {
	8088
}
fn default_base_path() -> String {
	"/monitor".into()
}
fn default_reply_timeout() -> u64 {
	30
}
fn default_restart_delay() -> u64 {
	1000
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TailConfig {
	/// Follow program and its leading arguments; resolved files are appended.
	#[serde(default = "default_tail_command")]
	pub command: Vec<String>,
	#[serde(default = "default_respawn_delay")]
	pub respawn_delay_ms: u64,
}

impl Default for TailConfig {
	fn default() -> Self {
		Self {
			command: default_tail_command(),
			respawn_delay_ms: default_respawn_delay(),
		}
	}
}

impl TailConfig {
	pub fn respawn_delay(&self) -> Duration {
		Duration::from_millis(self.respawn_delay_ms)
	}
}

fn default_tail_command() -> Vec<String> {
	vec!["tail".into(), "-F".into()]
}
fn default_respawn_delay() -> u64 {
	500
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
	#[serde(default = "default_level")]
	pub level: String,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self { level: default_level() }
	}
}

fn default_level() -> String {
	"info".into()
}

pub fn descriptors(services: &BTreeMap<String, String>) -> Vec<ServiceDescriptor> {
	services
		.iter()
		.map(|(name, command)| ServiceDescriptor {
			name: name.clone(),
			target: LaunchTarget(command.clone()),
		})
		.collect()
}

/// A live settings change the lifecycle controller reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
	Host(String),
	Port(u16),
	BasePath(String),
	Services(BTreeMap<String, String>),
	Logs(Vec<String>),
}

impl Settings {
	/// Events needed to move from `self` to `next`, in application order.
	pub fn diff(&self, next: &Settings) -> Vec<ConfigEvent> {
		let (old, new) = (&self.monitor, &next.monitor);
		let mut events = Vec::new();
		if old.host != new.host {
			events.push(ConfigEvent::Host(new.host.clone()));
		}
		if old.port != new.port {
			events.push(ConfigEvent::Port(new.port));
		}
		if old.base_path != new.base_path {
			events.push(ConfigEvent::BasePath(new.base_path.clone()));
		}
		if old.services != new.services {
			events.push(ConfigEvent::Services(new.services.clone()));
		}
		if old.logs != new.logs {
			events.push(ConfigEvent::Logs(new.logs.clone()));
		}
		events
	}

	pub fn parse(content: &str) -> Result<Settings, String> {
		toml::from_str(content).map_err(|e| e.to_string())
	}
}

pub fn default_config_path() -> PathBuf {
	config_dir().join("config.toml")
}

/// Reads `path`, falling back to defaults when it is missing or invalid.
pub fn load_settings(path: &Path) -> Settings {
	if path.exists() {
		match std::fs::read_to_string(path) {
			Ok(content) => match Settings::parse(&content) {
				Ok(settings) => return settings,
				Err(e) => eprintln!("warning: failed to parse {}: {}", path.display(), e),
			},
			Err(e) => eprintln!("warning: failed to read {}: {}", path.display(), e),
		}
	}
	Settings::default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_when_empty() {
		let settings = Settings::parse("").unwrap();
		assert_eq!(settings.monitor.host, "localhost");
		assert_eq!(settings.monitor.port, 8088);
		assert_eq!(settings.monitor.base_path, "/monitor");
		assert_eq!(settings.monitor.reply_timeout(), Some(Duration::from_secs(30)));
		assert_eq!(settings.tail.command, vec!["tail", "-F"]);
		assert_eq!(settings.logging.level, "info");
	}

	#[test]
	fn parses_services_and_logs() {
		let settings = Settings::parse(
			r#"
[monitor]
port = 9000
logs = ["/var/log/app.log", "/var/log/*.err"]
reply_timeout_secs = 0

[monitor.services]
echo = "/usr/local/bin/echo-service"
"#,
		)
		.unwrap();
		assert_eq!(settings.monitor.port, 9000);
		assert_eq!(settings.monitor.logs.len(), 2);
		assert_eq!(settings.monitor.reply_timeout(), None);
		let descriptors = settings.monitor.descriptors();
		assert_eq!(descriptors.len(), 1);
		assert_eq!(descriptors[0].name, "echo");
		assert_eq!(descriptors[0].target.command(), "/usr/local/bin/echo-service");
	}

	#[test]
	fn diff_reports_changed_keys_only() {
		let old = Settings::default();
		assert!(old.diff(&old).is_empty());

		let mut new = old.clone();
		new.monitor.port = 9001;
		new.monitor.logs = vec!["/tmp/a.log".into()];
		assert_eq!(
			old.diff(&new),
			vec![ConfigEvent::Port(9001), ConfigEvent::Logs(vec!["/tmp/a.log".into()])]
		);
	}

	#[test]
	fn load_missing_file_uses_defaults() {
		let settings = load_settings(Path::new("/nonexistent/overseer/config.toml"));
		assert_eq!(settings, Settings::default());
	}

	#[test]
	fn invalid_toml_is_an_error() {
		assert!(Settings::parse("[monitor\nport =").is_err());
	}
}
