use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use overseer_core::config::{descriptors, load_settings, ConfigEvent, Settings};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{reload, Registry};

use crate::api::{self, Gateway};
use crate::events::Broadcaster;
use crate::supervisor::{ServerState, Supervisor, SupervisorConfig};
use crate::tail::TailManager;

/// Open push connections hold graceful shutdown open; give them this long.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Swaps the max level of the installed subscriber.
pub type LevelHandle = reload::Handle<LevelFilter, Registry>;

/// `trace`..`error` or `off`; anything else is rejected.
pub fn level_filter(level: &str) -> Option<LevelFilter> {
	level.parse().ok()
}

struct RunningServer {
	addr: SocketAddr,
	shutdown: oneshot::Sender<()>,
	task: JoinHandle<()>,
}

/// Owns the listener and reacts to settings changes and signals.
pub struct Controller {
	settings: Settings,
	config_path: Option<PathBuf>,
	gateway: Gateway,
	server: Option<RunningServer>,
	log_level: Option<LevelHandle>,
}

impl Controller {
	pub fn new(settings: Settings, config_path: Option<PathBuf>) -> Self {
		let events = Broadcaster::new();
		let supervisor = Supervisor::new(
			SupervisorConfig::from(&settings.monitor),
			events.clone(),
			settings.monitor.descriptors(),
		);
		let tails = Arc::new(TailManager::new(settings.tail.clone(), settings.monitor.logs.clone()));
		Self {
			settings,
			config_path,
			gateway: Gateway {
				supervisor,
				tails,
				events,
			},
			server: None,
			log_level: None,
		}
	}

	/// Lets [`reload`](Self::reload) apply `[logging] level` changes.
	pub fn with_log_level(mut self, handle: LevelHandle) -> Self {
		self.log_level = Some(handle);
		self
	}

	pub fn gateway(&self) -> &Gateway {
		&self.gateway
	}

	pub fn settings(&self) -> &Settings {
		&self.settings
	}

	/// Address actually bound, once serving.
	pub fn local_addr(&self) -> Option<SocketAddr> {
		self.server.as_ref().map(|s| s.addr)
	}

	pub async fn start_server(&mut self) -> Result<SocketAddr, String> {
		if let Some(server) = &self.server {
			return Ok(server.addr);
		}
		let supervisor = &self.gateway.supervisor;
		supervisor.set_state(ServerState::Starting);

		let monitor = &self.settings.monitor;
		let bind = format!("{}:{}", monitor.host, monitor.port);
		let listener = match TcpListener::bind(&bind).await {
			Ok(listener) => listener,
			Err(e) => {
				supervisor.set_state(ServerState::Unstarted);
				tracing::error!("failed to bind {}: {}", bind, e);
				return Err(format!("failed to bind {}: {}", bind, e));
			}
		};
		let addr = listener.local_addr().map_err(|e| e.to_string())?;

		let app = api::router(self.gateway.clone(), &monitor.base_path);
		let (shutdown, shutdown_rx) = oneshot::channel::<()>();
		let task = tokio::spawn(async move {
			let server = axum::serve(listener, app).with_graceful_shutdown(async {
				let _ = shutdown_rx.await;
			});
			if let Err(e) = server.await {
				tracing::error!("server error: {}", e);
			}
		});
		tracing::info!("listening on {}{}", addr, monitor.base_path);

		self.server = Some(RunningServer { addr, shutdown, task });
		supervisor.set_state(ServerState::Started);
		self.init();
		Ok(addr)
	}

	pub async fn stop_server(&mut self) {
		let Some(server) = self.server.take() else {
			return;
		};
		let _ = server.shutdown.send(());
		let mut task = server.task;
		if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
			tracing::warn!("server on {} did not drain, aborting", server.addr);
			task.abort();
		}
		self.gateway.supervisor.set_state(ServerState::Unstarted);
		tracing::info!("stopped listening on {}", server.addr);
	}

	pub async fn restart_server(&mut self) -> Result<SocketAddr, String> {
		self.stop_server().await;
		self.start_server().await
	}

	/// Tails every configured log.
	pub fn init(&self) {
		self.gateway.tails.tail_configured();
	}

	/// Kills every launched instance and follow process. Never fails.
	pub async fn cleanup(&self) {
		let supervisor = Arc::clone(&self.gateway.supervisor);
		let tails = Arc::clone(&self.gateway.tails);
		let result = tokio::spawn(async move {
			supervisor.kill_all().await;
			tails.kill_all().await;
		})
		.await;
		if let Err(e) = result {
			tracing::error!("cleanup failed: {}", e);
		}
	}

	pub async fn handle(&mut self, event: ConfigEvent) -> Result<(), String> {
		tracing::info!("applying {:?}", event);
		match event {
			ConfigEvent::Host(host) => {
				self.settings.monitor.host = host;
				self.restart_if_serving().await?;
			}
			ConfigEvent::Port(port) => {
				self.settings.monitor.port = port;
				self.restart_if_serving().await?;
			}
			ConfigEvent::BasePath(base_path) => {
				self.settings.monitor.base_path = base_path;
				self.restart_if_serving().await?;
			}
			ConfigEvent::Services(services) => {
				self.cleanup().await;
				self.gateway.supervisor.replace_registry(descriptors(&services));
				self.settings.monitor.services = services;
				self.init();
			}
			ConfigEvent::Logs(logs) => {
				self.cleanup().await;
				self.gateway.tails.set_logs(logs.clone());
				self.settings.monitor.logs = logs;
				self.init();
			}
		}
		Ok(())
	}

	/// Re-reads the settings file and applies whatever changed.
	pub async fn reload(&mut self) {
		let Some(path) = self.config_path.clone() else {
			tracing::warn!("no settings file to reload");
			return;
		};
		let next = load_settings(&path);
		let events = self.settings.diff(&next);
		if events.is_empty() {
			tracing::info!("settings unchanged");
		}
		for event in events {
			if let Err(e) = self.handle(event).await {
				tracing::error!("failed to apply settings: {}", e);
			}
		}
		if next.logging != self.settings.logging {
			self.apply_log_level(&next.logging.level);
		}
		self.settings.tail = next.tail;
		self.settings.logging = next.logging;
	}

	fn apply_log_level(&self, level: &str) {
		let Some(handle) = &self.log_level else {
			return;
		};
		let Some(filter) = level_filter(level) else {
			tracing::warn!("unknown log level {:?}, keeping the current one", level);
			return;
		};
		match handle.reload(filter) {
			Ok(()) => tracing::info!("log level set to {}", filter),
			Err(e) => tracing::error!("failed to change log level: {}", e),
		}
	}

	/// Serves until a termination signal, then cleans up.
	pub async fn run(mut self, mut updates: mpsc::UnboundedReceiver<ConfigEvent>) -> Result<(), String> {
		let mut terminate = signal(SignalKind::terminate()).map_err(|e| e.to_string())?;
		let mut interrupt = signal(SignalKind::interrupt()).map_err(|e| e.to_string())?;
		let mut hangup = signal(SignalKind::hangup()).map_err(|e| e.to_string())?;
		let mut reload = signal(SignalKind::user_defined1()).map_err(|e| e.to_string())?;

		self.start_server().await?;
		tracing::info!("overseer started (pid {})", std::process::id());

		let mut updates_open = true;
		loop {
			tokio::select! {
				_ = terminate.recv() => break,
				_ = interrupt.recv() => break,
				_ = hangup.recv() => break,
				_ = reload.recv() => {
					tracing::info!("reloading settings");
					self.reload().await;
				}
				update = updates.recv(), if updates_open => match update {
					Some(event) => {
						if let Err(e) = self.handle(event).await {
							tracing::error!("failed to apply settings: {}", e);
						}
					}
					None => updates_open = false,
				},
			}
		}

		tracing::info!("shutting down");
		self.cleanup().await;
		self.stop_server().await;
		Ok(())
	}

	async fn restart_if_serving(&mut self) -> Result<(), String> {
		if self.server.is_some() {
			self.restart_server().await?;
		}
		Ok(())
	}
}
