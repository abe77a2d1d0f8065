use std::path::PathBuf;

use overseer::lifecycle::{level_filter, Controller};
use overseer_core::config::{default_config_path, load_settings};
use tokio::sync::mpsc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload};

#[tokio::main]
async fn main() {
	let args: Vec<String> = std::env::args().skip(1).collect();
	let config_path = args
		.iter()
		.position(|a| a == "--config" || a == "-c")
		.and_then(|i| args.get(i + 1))
		.map(PathBuf::from)
		.unwrap_or_else(default_config_path);

	let settings = load_settings(&config_path);
	let level = level_filter(&settings.logging.level).unwrap_or(LevelFilter::INFO);
	let (filter, log_level) = reload::Layer::new(level);
	tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
	tracing::debug!("settings from {}", config_path.display());

	// Settings changes arrive via SIGUSR1; the channel stays open for embedders.
	let (_updates_tx, updates) = mpsc::unbounded_channel();
	let controller = Controller::new(settings, Some(config_path)).with_log_level(log_level);
	if let Err(e) = controller.run(updates).await {
		tracing::error!("{}", e);
		std::process::exit(1);
	}
}
