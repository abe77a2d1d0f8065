use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use overseer_core::config::MonitorConfig;
use overseer_core::protocol::{ControlAction, ControlMessage};
use overseer_core::types::{outcome_value, Action, LaunchTarget, Options, Outcome, Reply, ServiceDescriptor};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::child::{ChildLink, ExitEvent, Monitor};
use crate::events::Broadcaster;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
	Unstarted,
	Starting,
	Started,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
	#[error("service required")]
	MissingService,
	#[error("monitor not started")]
	NotStarted,
	#[error("service not found")]
	NotFound,
	#[error("cannot resolve launch target for {0}")]
	Unresolvable(String),
	#[error("{0}")]
	Spawn(String),
	#[error("{0}")]
	Remote(String),
	#[error("start interrupted by cleanup")]
	Interrupted,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	/// `None` waits for a reply forever.
	pub reply_timeout: Option<Duration>,
	pub restart_delay: Duration,
}

impl From<&MonitorConfig> for SupervisorConfig {
	fn from(config: &MonitorConfig) -> Self {
		Self {
			reply_timeout: config.reply_timeout(),
			restart_delay: config.restart_delay(),
		}
	}
}

pub struct Instance {
	pub id: u64,
	pub pid: Option<u32>,
	pub started_at: Instant,
	link: ChildLink,
}

pub struct Supervisor {
	config: SupervisorConfig,
	events: Broadcaster,
	registry: RwLock<BTreeMap<String, ServiceDescriptor>>,
	launched: Mutex<HashMap<String, Instance>>,
	/// Serializes start/stop/restart/auto-restart per service name.
	name_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
	state: Mutex<ServerState>,
	exits: mpsc::UnboundedSender<ExitEvent>,
	next_instance: AtomicU64,
	/// Bumped by every [`kill_all`](Supervisor::kill_all); a launch that spans one is discarded.
	cleanups: AtomicU64,
}

impl Supervisor {
	pub fn new(config: SupervisorConfig, events: Broadcaster, services: Vec<ServiceDescriptor>) -> Arc<Self> {
		let (exits, exit_rx) = mpsc::unbounded_channel();
		let supervisor = Arc::new(Self {
			config,
			events,
			registry: RwLock::new(index(services)),
			launched: Mutex::new(HashMap::new()),
			name_locks: Mutex::new(HashMap::new()),
			state: Mutex::new(ServerState::Unstarted),
			exits,
			next_instance: AtomicU64::new(1),
			cleanups: AtomicU64::new(0),
		});
		tokio::spawn(watch_exits(Arc::downgrade(&supervisor), exit_rx));
		supervisor
	}

	pub fn state(&self) -> ServerState {
		*lock(&self.state)
	}

	pub fn set_state(&self, state: ServerState) {
		*lock(&self.state) = state;
	}

	pub fn events(&self) -> &Broadcaster {
		&self.events
	}

	pub fn replace_registry(&self, services: Vec<ServiceDescriptor>) {
		*self.registry.write().unwrap_or_else(PoisonError::into_inner) = index(services);
	}

	/// Names of every launched instance, sorted.
	pub fn list(&self) -> Vec<String> {
		let mut names: Vec<String> = self.launched().keys().cloned().collect();
		names.sort();
		names
	}

	/// Names of every registered service.
	pub fn services(&self) -> Vec<String> {
		self.registry
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.keys()
			.cloned()
			.collect()
	}

	pub fn pid(&self, name: &str) -> Option<u32> {
		self.launched().get(name).and_then(|i| i.pid)
	}

	pub async fn start(self: &Arc<Self>, name: &str, options: &Options) -> Outcome {
		if name.is_empty() {
			return self.reject(Action::Start, failure("", SupervisorError::MissingService).with("started", false));
		}
		let lock = self.name_lock(name);
		let _guard = lock.lock().await;
		self.start_locked(name, options).await
	}

	pub async fn stop(self: &Arc<Self>, name: &str, options: &Options) -> Outcome {
		if name.is_empty() {
			return self.reject(Action::Stop, failure("", SupervisorError::MissingService).with("stopped", false));
		}
		let lock = self.name_lock(name);
		let _guard = lock.lock().await;
		self.stop_locked(name, options).await
	}

	/// Stop (when running) then start; the old process is reaped before the new one spawns.
	pub async fn restart(self: &Arc<Self>, name: &str, options: &Options) -> Outcome {
		if name.is_empty() {
			return self.reject(
				Action::Restart,
				failure("", SupervisorError::MissingService).with("restarted", false),
			);
		}
		{
			let lock = self.name_lock(name);
			let _guard = lock.lock().await;
			let running = self.launched().contains_key(name);
			if running {
				let _ = self.stop_locked(name, options).await;
			}
			let _ = self.start_locked(name, options).await;
		}
		let reply = Reply::new().with_service(name).with("restarted", true);
		self.announce(Action::Restart, &Ok(reply.clone()));
		Ok(reply)
	}

	pub async fn status(&self, name: &str, options: &Options) -> Outcome {
		if self.state() != ServerState::Started {
			return Err(failure(name, SupervisorError::NotStarted).with("status", Value::Null));
		}
		let link = self.launched().get(name).map(|i| i.link.clone());
		let outcome = match link {
			None => Err(failure(name, SupervisorError::NotFound).with("status", Value::Null)),
			Some(link) => {
				let message = ControlMessage::new(ControlAction::Status, options);
				match link.call(message, self.config.reply_timeout).await {
					Ok(reply) if !reply.is_error() => Ok(reply.with_service(name)),
					Ok(reply) => Err(reply.with_service(name)),
					Err(e) => Err(failure(name, SupervisorError::Remote(e)).with("status", Value::Null)),
				}
			}
		};
		if let Err(reply) = &outcome {
			tracing::error!("error gathering status of {}: {}", name, reply.error().unwrap_or_default());
		}
		self.announce(Action::Status, &outcome);
		outcome
	}

	/// Status of every launched service. Individual failures stay in the list.
	pub async fn status_all(self: &Arc<Self>, options: &Options) -> Result<Vec<Outcome>, Reply> {
		if self.state() != ServerState::Started {
			return Err(failure("", SupervisorError::NotStarted).with("status", Value::Null));
		}
		let mut set = JoinSet::new();
		for name in self.list() {
			let supervisor = Arc::clone(self);
			let options = options.clone();
			set.spawn(async move { supervisor.status(&name, &options).await });
		}
		let mut results = Vec::new();
		while let Some(joined) = set.join_next().await {
			match joined {
				Ok(outcome) => results.push(outcome),
				Err(e) => tracing::error!("status task failed: {}", e),
			}
		}
		Ok(results)
	}

	/// Kills every launched instance without broadcasting. Waits out any
	/// start/stop in flight; a start caught mid-launch is discarded.
	pub async fn kill_all(&self) {
		self.cleanups.fetch_add(1, Ordering::SeqCst);
		let mut names: Vec<String> = lock(&self.name_locks).keys().cloned().collect();
		names.sort();
		let locks: Vec<_> = names.iter().map(|name| self.name_lock(name)).collect();
		let mut guards = Vec::with_capacity(locks.len());
		for name_lock in &locks {
			guards.push(name_lock.lock().await);
		}

		let instances: Vec<(String, Instance)> = self.launched().drain().collect();
		for (name, instance) in instances {
			tracing::debug!("killing {} (pid {:?})", name, instance.pid);
			instance.link.terminate().await;
		}
	}

	async fn start_locked(self: &Arc<Self>, name: &str, options: &Options) -> Outcome {
		let outcome = self.launch(name, options).await;
		self.announce(Action::Start, &outcome);
		outcome
	}

	async fn launch(self: &Arc<Self>, name: &str, options: &Options) -> Outcome {
		if self.state() != ServerState::Started {
			return Err(failure(name, SupervisorError::NotStarted).with("started", false));
		}
		if self.launched().contains_key(name) {
			return Ok(Reply::new().with("started", true).with_service(name));
		}

		let target = match self.resolve(name) {
			Ok(target) => target,
			Err(e) => {
				tracing::error!("error starting {}: {}", name, e);
				return Err(failure(name, e).with("started", false));
			}
		};

		let generation = self.cleanups.load(Ordering::SeqCst);
		let id = self.next_instance.fetch_add(1, Ordering::Relaxed);
		let monitor = monitor_requested(options).then(|| Monitor {
			exits: self.exits.clone(),
			options: options.clone(),
		});
		let link = match ChildLink::spawn(name, id, &target, monitor) {
			Ok(link) => link,
			Err(e) => {
				tracing::error!("error starting {}: {}", name, e);
				return Err(failure(name, SupervisorError::Spawn(e)).with("started", false));
			}
		};

		let message = ControlMessage::new(ControlAction::Start, options);
		match link.call(message, self.config.reply_timeout).await {
			Ok(_) if self.cleanups.load(Ordering::SeqCst) != generation => {
				tracing::warn!("discarding {} (pid {:?}), cleanup ran during its start", name, link.pid());
				link.terminate().await;
				Err(failure(name, SupervisorError::Interrupted).with("started", false))
			}
			Ok(reply) if !reply.is_error() => {
				tracing::info!("started {} (pid {:?})", name, link.pid());
				self.launched().insert(
					name.to_string(),
					Instance {
						id,
						pid: link.pid(),
						started_at: Instant::now(),
						link,
					},
				);
				Ok(reply.with_service(name))
			}
			Ok(reply) => {
				tracing::error!("error starting {}: {}", name, reply.error().unwrap_or_default());
				link.terminate().await;
				Err(reply.with_service(name))
			}
			Err(e) => {
				tracing::error!("error starting {}: {}", name, e);
				link.terminate().await;
				Err(failure(name, SupervisorError::Remote(e)).with("started", false))
			}
		}
	}

	async fn stop_locked(&self, name: &str, options: &Options) -> Outcome {
		let outcome = self.halt(name, options).await;
		self.announce(Action::Stop, &outcome);
		outcome
	}

	async fn halt(&self, name: &str, options: &Options) -> Outcome {
		if self.state() != ServerState::Started {
			return Err(failure(name, SupervisorError::NotStarted).with("stopped", false));
		}
		let link = self.launched().get(name).map(|i| i.link.clone());
		let Some(link) = link else {
			return Ok(Reply::new().with("stopped", true).with_service(name));
		};

		let message = ControlMessage::new(ControlAction::Stop, options);
		let result = link.call(message, self.config.reply_timeout).await;
		// Termination was requested, so the process goes regardless of the reply.
		link.terminate().await;
		self.launched().remove(name);

		match result {
			Ok(reply) if !reply.is_error() => {
				tracing::info!("stopped {}", name);
				Ok(reply.with_service(name))
			}
			Ok(reply) => {
				tracing::error!("error stopping {}: {}", name, reply.error().unwrap_or_default());
				Err(reply.with_service(name))
			}
			Err(e) => {
				tracing::error!("error stopping {}: {}", name, e);
				Err(failure(name, SupervisorError::Remote(e)).with("stopped", false))
			}
		}
	}

	async fn handle_exit(self: &Arc<Self>, exit: ExitEvent) {
		let lock = self.name_lock(&exit.name);
		let _guard = lock.lock().await;

		let removed = {
			let mut launched = self.launched();
			let current = launched.get(&exit.name).map(|i| i.id);
			if current == Some(exit.instance) {
				launched.remove(&exit.name);
				true
			} else {
				false
			}
		};
		if !removed {
			tracing::warn!("{} {} before it was running, not restarting", exit.name, exit.description);
			return;
		}

		tracing::info!("process {} {}, restarting", exit.name, exit.description);
		let reply = Reply::new()
			.with("stopped", true)
			.with_service(&exit.name)
			.with("error", exit.description.clone());
		self.announce(Action::Stop, &Ok(reply));

		tokio::time::sleep(self.config.restart_delay).await;
		let _ = self.start_locked(&exit.name, &exit.options).await;
	}

	fn reject(&self, action: Action, reply: Reply) -> Outcome {
		tracing::error!("error handling {}: {}", action, reply.error().unwrap_or_default());
		let outcome = Err(reply);
		self.announce(action, &outcome);
		outcome
	}

	fn announce(&self, action: Action, outcome: &Outcome) {
		if action.broadcasts() {
			self.events.emit(action.as_str(), outcome_value(outcome.clone()));
		}
	}

	fn resolve(&self, name: &str) -> Result<LaunchTarget, SupervisorError> {
		if let Some(descriptor) = self.registry.read().unwrap_or_else(PoisonError::into_inner).get(name) {
			return Ok(descriptor.target.clone());
		}
		resolve_executable(name)
			.map(|path| LaunchTarget(shell_quote(&path.to_string_lossy())))
			.ok_or_else(|| SupervisorError::Unresolvable(name.to_string()))
	}

	fn launched(&self) -> MutexGuard<'_, HashMap<String, Instance>> {
		lock(&self.launched)
	}

	fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
		Arc::clone(lock(&self.name_locks).entry(name.to_string()).or_default())
	}
}

async fn watch_exits(supervisor: Weak<Supervisor>, mut exits: mpsc::UnboundedReceiver<ExitEvent>) {
	while let Some(exit) = exits.recv().await {
		let Some(supervisor) = supervisor.upgrade() else {
			break;
		};
		tokio::spawn(async move { supervisor.handle_exit(exit).await });
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn index(services: Vec<ServiceDescriptor>) -> BTreeMap<String, ServiceDescriptor> {
	services.into_iter().map(|d| (d.name.clone(), d)).collect()
}

fn failure(service: &str, error: impl std::fmt::Display) -> Reply {
	let reply = Reply::new().with("error", error.to_string());
	if service.is_empty() {
		reply
	} else {
		reply.with_service(service)
	}
}

/// `monitor` arrives as a bool over the push channel and as a string over HTTP.
pub fn monitor_requested(options: &Options) -> bool {
	match options.get("monitor") {
		Some(Value::Bool(b)) => *b,
		Some(Value::String(s)) => s == "true" || s == "1",
		Some(Value::Number(n)) => n.as_i64() == Some(1),
		_ => false,
	}
}

/// An unregistered name is launched as-is when it names an executable file.
fn resolve_executable(name: &str) -> Option<PathBuf> {
	if name.contains('/') {
		let path = Path::new(name);
		return path.is_file().then(|| path.to_path_buf());
	}
	let search = std::env::var_os("PATH")?;
	std::env::split_paths(&search)
		.map(|dir| dir.join(name))
		.find(|candidate| candidate.is_file())
}

fn shell_quote(s: &str) -> String {
	format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn monitor_flag_parsing() {
		let mut options = Options::new();
		assert!(!monitor_requested(&options));
		options.insert("monitor".into(), json!(true));
		assert!(monitor_requested(&options));
		options.insert("monitor".into(), json!("1"));
		assert!(monitor_requested(&options));
		options.insert("monitor".into(), json!("false"));
		assert!(!monitor_requested(&options));
	}

	#[test]
	fn executables_resolve_from_path_or_filesystem() {
		assert!(resolve_executable("sh").is_some());
		assert!(resolve_executable("/bin/sh").is_some());
		assert!(resolve_executable("definitely-not-a-real-program-xyz").is_none());
		assert!(resolve_executable("/nonexistent/service").is_none());
	}

	#[test]
	fn quoting_survives_single_quotes() {
		assert_eq!(shell_quote("/opt/it's"), r"'/opt/it'\''s'");
	}

	#[test]
	fn failure_payload_shape() {
		let reply = failure("echo", SupervisorError::NotFound);
		assert_eq!(reply.into_value(), json!({"service": "echo", "error": "service not found"}));
		let anonymous = failure("", SupervisorError::MissingService);
		assert_eq!(anonymous.into_value(), json!({"error": "service required"}));
	}
}
