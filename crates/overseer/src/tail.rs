//! Shared `tail -F` processes, one per log path, fanned out to subscribers.
//!
//! A follow process that exits (rotation, truncation, a removed file) is
//! respawned over a freshly resolved file set under the same topic.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use globset::{GlobBuilder, GlobMatcher};
use overseer_core::config::TailConfig;
use overseer_core::types::{tail_topic, Event, Outcome, Reply};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::child::kill_process_group;
use crate::events::Subscriber;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_GLOB_DEPTH: usize = 16;

type Subscribers = Arc<Mutex<Vec<Subscriber>>>;

struct LogTail {
	topic: String,
	subscribers: Subscribers,
	spawns: Arc<AtomicUsize>,
	cancel: watch::Sender<bool>,
	task: JoinHandle<()>,
}

pub struct TailManager {
	config: TailConfig,
	tails: Mutex<HashMap<String, LogTail>>,
	logs: RwLock<Vec<String>>,
	tailing_configured: AtomicBool,
}

impl TailManager {
	pub fn new(config: TailConfig, logs: Vec<String>) -> Self {
		Self {
			config,
			tails: Mutex::new(HashMap::new()),
			logs: RwLock::new(logs),
			tailing_configured: AtomicBool::new(false),
		}
	}

	/// Configured log paths.
	pub fn logs(&self) -> Vec<String> {
		self.logs.read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	pub fn set_logs(&self, logs: Vec<String>) {
		*self.logs.write().unwrap_or_else(PoisonError::into_inner) = logs;
	}

	/// Starts (or joins) the tail for `path` and returns its topic.
	pub fn tail(&self, path: &str, subscriber: Option<&Subscriber>, encoding: Option<&str>) -> Outcome {
		if path.is_empty() {
			return Err(Reply::new().with("error", "path is required"));
		}
		let topic = tail_topic(path);
		let mut tails = self.tails();

		if let Some(existing) = tails.get(path) {
			if let Some(subscriber) = subscriber {
				attach(&existing.subscribers, subscriber);
			}
			return Ok(topic_reply(path, &existing.topic));
		}

		let pattern = match FilePattern::new(path) {
			Ok(pattern) => pattern,
			Err(e) => {
				tracing::error!("cannot tail {}: {}", path, e);
				return Err(topic_reply(path, &topic).with("error", e));
			}
		};
		let encoding = match Encoding::parse(encoding) {
			Ok(encoding) => encoding,
			Err(e) => return Err(topic_reply(path, &topic).with("error", e)),
		};

		let subscribers: Subscribers = Arc::new(Mutex::new(subscriber.cloned().into_iter().collect()));
		let spawns = Arc::new(AtomicUsize::new(0));
		let (cancel, cancel_rx) = watch::channel(false);
		let follower = Follower {
			path: path.to_string(),
			topic: topic.clone(),
			pattern,
			encoding,
			command: self.config.command.clone(),
			respawn_delay: self.config.respawn_delay(),
			subscribers: Arc::clone(&subscribers),
			spawns: Arc::clone(&spawns),
			cancel: cancel_rx,
		};
		let task = tokio::spawn(follower.run());
		tracing::info!("tailing {} on {}", path, topic);

		tails.insert(
			path.to_string(),
			LogTail {
				topic: topic.clone(),
				subscribers,
				spawns,
				cancel,
				task,
			},
		);
		Ok(topic_reply(path, &topic))
	}

	/// Detaches `subscriber`; the follow process keeps running for the others.
	pub fn stop_tail(&self, path: &str, subscriber: &Subscriber) -> Reply {
		let tails = self.tails();
		let topic = match tails.get(path) {
			Some(tail) => {
				lock(&tail.subscribers).retain(|s| s != subscriber);
				tail.topic.clone()
			}
			None => tail_topic(path),
		};
		topic_reply(path, &topic)
	}

	/// Detaches a closing connection from every known path.
	pub fn disconnect(&self, subscriber: &Subscriber) {
		let mut paths: BTreeSet<String> = self.logs().into_iter().collect();
		paths.extend(self.tails().keys().cloned());
		for path in paths {
			self.stop_tail(&path, subscriber);
		}
	}

	/// Tails every configured log once; repeated calls are no-ops until [`kill_all`](Self::kill_all).
	pub fn tail_configured(&self) {
		if self.tailing_configured.swap(true, Ordering::SeqCst) {
			return;
		}
		for path in self.logs() {
			if let Err(reply) = self.tail(&path, None, None) {
				tracing::error!("failed to tail {}: {}", path, reply.error().unwrap_or_default());
			}
		}
	}

	/// Kills every follow process and forgets every tail.
	pub async fn kill_all(&self) {
		let tails: Vec<(String, LogTail)> = self.tails().drain().collect();
		for (path, tail) in tails {
			tracing::debug!("stopping tail of {}", path);
			let _ = tail.cancel.send(true);
			if let Err(e) = tail.task.await {
				tracing::error!("tail of {} failed: {}", path, e);
			}
		}
		self.tailing_configured.store(false, Ordering::SeqCst);
	}

	pub fn subscriber_count(&self, path: &str) -> Option<usize> {
		self.tails().get(path).map(|t| lock(&t.subscribers).len())
	}

	/// How many follow processes have been spawned for `path` so far.
	pub fn spawns(&self, path: &str) -> Option<usize> {
		self.tails().get(path).map(|t| t.spawns.load(Ordering::SeqCst))
	}

	fn tails(&self) -> MutexGuard<'_, HashMap<String, LogTail>> {
		lock(&self.tails)
	}
}

struct Follower {
	path: String,
	topic: String,
	pattern: FilePattern,
	encoding: Encoding,
	command: Vec<String>,
	respawn_delay: Duration,
	subscribers: Subscribers,
	spawns: Arc<AtomicUsize>,
	cancel: watch::Receiver<bool>,
}

impl Follower {
	async fn run(mut self) {
		loop {
			if *self.cancel.borrow() {
				return;
			}
			let files = self.pattern.resolve();
			match spawn_follower(&self.command, &files) {
				Ok(child) => {
					self.spawns.fetch_add(1, Ordering::SeqCst);
					if self.watch(child).await {
						return;
					}
				}
				Err(e) => tracing::error!("failed to tail {}: {}", self.path, e),
			}
			tokio::select! {
				_ = tokio::time::sleep(self.respawn_delay) => {}
				_ = self.cancel.changed() => return,
			}
		}
	}

	/// Runs one follow process to completion. Returns true when cancelled.
	async fn watch(&mut self, mut child: Child) -> bool {
		let pid = child.id();
		if let Some(stderr) = child.stderr.take() {
			let path = self.path.clone();
			tokio::spawn(async move {
				let mut lines = BufReader::new(stderr).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					tracing::error!("tail {}: {}", path, line);
				}
			});
		}
		let mut reader = match child.stdout.take() {
			Some(stdout) => tokio::spawn(pipe_lines(
				stdout,
				self.topic.clone(),
				self.encoding,
				Arc::clone(&self.subscribers),
			)),
			None => tokio::spawn(async {}),
		};

		let cancelled = tokio::select! {
			status = child.wait() => {
				match status {
					Ok(status) => tracing::info!("tail of {} exited with {}, re-resolving", self.path, status),
					Err(e) => tracing::error!("tail of {} could not be waited on: {}", self.path, e),
				}
				false
			}
			_ = self.cancel.changed() => {
				if let Some(pid) = pid {
					kill_process_group(pid);
				}
				let _ = child.kill().await;
				true
			}
		};

		if cancelled {
			reader.abort();
		} else if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
			reader.abort();
		}
		cancelled
	}
}

fn spawn_follower(command: &[String], files: &[PathBuf]) -> Result<Child, String> {
	let (program, args) = command.split_first().ok_or("empty tail command")?;
	let mut cmd = Command::new(program);
	cmd.args(args)
		.args(files)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.process_group(0)
		.kill_on_drop(true);

	cmd.spawn().map_err(|e| format!("spawn failed: {}", e))
}

async fn pipe_lines<R: AsyncRead + Unpin>(mut reader: R, topic: String, encoding: Encoding, subscribers: Subscribers) {
	let mut buf = [0u8; 4096];
	let mut carry: Vec<u8> = Vec::new();
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => {
				carry.extend_from_slice(&buf[..n]);
				let complete = encoding.complete_prefix(&carry);
				let text = encoding.decode(&carry[..complete]);
				carry.drain(..complete);
				publish(&topic, &text, &subscribers);
			}
			Err(_) => break,
		}
	}
	if !carry.is_empty() {
		publish(&topic, &encoding.decode(&carry), &subscribers);
	}
}

fn publish(topic: &str, text: &str, subscribers: &Subscribers) {
	if text.is_empty() {
		return;
	}
	let event = Event::new(topic, json!({ "lines": split_log_lines(text) }));
	lock(subscribers).retain(|s| s.send(event.clone()));
}

/// Splits a chunk into log entries. An entry starts at a line opening with
/// `[` (a bracketed timestamp); other lines stay with the entry above them.
pub fn split_log_lines(chunk: &str) -> Vec<String> {
	let chunk = chunk.strip_suffix('\n').unwrap_or(chunk);
	chunk
		.split("\n[")
		.enumerate()
		.map(|(i, line)| if i > 0 { format!("[{}", line) } else { line.to_string() })
		.collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
	Utf8,
	Latin1,
	Ascii,
}

impl Encoding {
	pub fn parse(name: Option<&str>) -> Result<Self, String> {
		match name.map(|n| n.to_ascii_lowercase()).as_deref() {
			None | Some("utf8") | Some("utf-8") => Ok(Encoding::Utf8),
			Some("latin1") | Some("binary") => Ok(Encoding::Latin1),
			Some("ascii") => Ok(Encoding::Ascii),
			Some(other) => Err(format!("unsupported encoding: {}", other)),
		}
	}

	/// Length of the prefix that can be decoded without splitting a character.
	fn complete_prefix(self, bytes: &[u8]) -> usize {
		match self {
			Encoding::Utf8 => match std::str::from_utf8(bytes) {
				Err(e) if e.error_len().is_none() => e.valid_up_to(),
				_ => bytes.len(),
			},
			_ => bytes.len(),
		}
	}

	fn decode(self, bytes: &[u8]) -> String {
		match self {
			Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
			Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
			Encoding::Ascii => bytes.iter().map(|&b| (b & 0x7f) as char).collect(),
		}
	}
}

/// A log path, possibly containing glob characters, resolved to files on each spawn.
pub struct FilePattern {
	raw: String,
	glob: Option<(PathBuf, usize, GlobMatcher)>,
}

impl FilePattern {
	pub fn new(path: &str) -> Result<Self, String> {
		if !has_glob(path) {
			return Ok(Self {
				raw: path.to_string(),
				glob: None,
			});
		}
		let matcher = GlobBuilder::new(path)
			.literal_separator(true)
			.build()
			.map_err(|e| format!("invalid pattern {}: {}", path, e))?
			.compile_matcher();
		let base = base_dir(path);
		let rest = match &base {
			Some(base) => &path[base.as_os_str().len()..],
			None => path,
		};
		let depth = if rest.contains("**") {
			MAX_GLOB_DEPTH
		} else {
			rest.trim_start_matches('/').split('/').count()
		};
		Ok(Self {
			raw: path.to_string(),
			glob: Some((base.unwrap_or_else(|| PathBuf::from(".")), depth, matcher)),
		})
	}

	/// Concrete files to follow. A pattern that matches nothing is passed
	/// through unchanged so `tail -F` can wait for it to appear.
	pub fn resolve(&self) -> Vec<PathBuf> {
		let Some((base, depth, matcher)) = &self.glob else {
			return vec![PathBuf::from(&self.raw)];
		};
		let mut files = Vec::new();
		walk(base, *depth, matcher, &mut files);
		if files.is_empty() {
			return vec![PathBuf::from(&self.raw)];
		}
		files.sort();
		files
	}
}

fn has_glob(path: &str) -> bool {
	path.contains(['*', '?', '[', '{'])
}

/// The directory portion of a pattern before its first glob character.
fn base_dir(pattern: &str) -> Option<PathBuf> {
	let first = pattern.find(['*', '?', '[', '{'])?;
	let sep = pattern[..first].rfind('/')?;
	if sep == 0 {
		Some(PathBuf::from("/"))
	} else {
		Some(PathBuf::from(&pattern[..sep]))
	}
}

fn walk(dir: &Path, depth: usize, matcher: &GlobMatcher, out: &mut Vec<PathBuf>) {
	let Ok(entries) = std::fs::read_dir(dir) else {
		return;
	};
	for entry in entries.flatten() {
		let path = entry.path();
		if path.is_dir() {
			if depth > 1 {
				walk(&path, depth - 1, matcher, out);
			}
			continue;
		}
		let candidate = path.strip_prefix("./").unwrap_or(path.as_path());
		if matcher.is_match(candidate) {
			out.push(candidate.to_path_buf());
		}
	}
}

fn attach(subscribers: &Subscribers, subscriber: &Subscriber) {
	let mut subscribers = lock(subscribers);
	if !subscribers.contains(subscriber) {
		subscribers.push(subscriber.clone());
	}
}

fn topic_reply(path: &str, topic: &str) -> Reply {
	Reply::new().with("path", path).with("topic", topic)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn continuation_lines_stay_attached() {
		let chunk = "[2024-01-01 10:00] boom\n  at foo()\n  at bar()\n[2024-01-01 10:01] ok\n";
		assert_eq!(
			split_log_lines(chunk),
			vec![
				"[2024-01-01 10:00] boom\n  at foo()\n  at bar()".to_string(),
				"[2024-01-01 10:01] ok".to_string(),
			]
		);
	}

	#[test]
	fn plain_lines_without_timestamps_form_one_entry() {
		assert_eq!(split_log_lines("a\nb\n"), vec!["a\nb".to_string()]);
	}

	#[test]
	fn encodings() {
		assert_eq!(Encoding::parse(None), Ok(Encoding::Utf8));
		assert_eq!(Encoding::parse(Some("UTF-8")), Ok(Encoding::Utf8));
		assert_eq!(Encoding::parse(Some("latin1")), Ok(Encoding::Latin1));
		assert!(Encoding::parse(Some("ebcdic")).is_err());
		assert_eq!(Encoding::Latin1.decode(&[0x63, 0xe9]), "cé");
	}

	#[test]
	fn utf8_split_characters_are_carried() {
		let bytes = "é".as_bytes();
		assert_eq!(Encoding::Utf8.complete_prefix(&bytes[..1]), 0);
		assert_eq!(Encoding::Utf8.complete_prefix(bytes), 2);
	}

	#[test]
	fn base_dir_of_patterns() {
		assert_eq!(base_dir("/var/log/*.log"), Some(PathBuf::from("/var/log")));
		assert_eq!(base_dir("/*.log"), Some(PathBuf::from("/")));
		assert_eq!(base_dir("*.log"), None);
		assert_eq!(base_dir("/var/log/app.log"), None);
	}

	#[test]
	fn literal_paths_resolve_to_themselves() {
		let pattern = FilePattern::new("/var/log/app.log").unwrap();
		assert_eq!(pattern.resolve(), vec![PathBuf::from("/var/log/app.log")]);
	}

	#[test]
	fn glob_patterns_resolve_matching_files() {
		let dir = std::env::temp_dir().join(format!("overseer-glob-{}", std::process::id()));
		let _ = std::fs::create_dir_all(&dir);
		std::fs::write(dir.join("a.log"), "").unwrap();
		std::fs::write(dir.join("b.log"), "").unwrap();
		std::fs::write(dir.join("c.txt"), "").unwrap();

		let pattern = FilePattern::new(&format!("{}/*.log", dir.display())).unwrap();
		assert_eq!(pattern.resolve(), vec![dir.join("a.log"), dir.join("b.log")]);

		let none = FilePattern::new(&format!("{}/*.err", dir.display())).unwrap();
		assert_eq!(none.resolve(), vec![PathBuf::from(format!("{}/*.err", dir.display()))]);

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn invalid_patterns_are_rejected() {
		assert!(FilePattern::new("/var/log/[.log").is_err());
	}
}
