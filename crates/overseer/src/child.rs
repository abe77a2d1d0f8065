use overseer_core::protocol::ControlMessage;
use overseer_core::types::{LaunchTarget, Options, Reply};
use serde_json::Value;
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Emitted when a monitored child exits without being asked to.
#[derive(Debug, Clone)]
pub struct ExitEvent {
	pub name: String,
	pub instance: u64,
	pub options: Options,
	pub description: String,
}

/// Installed at spawn time to route the child's exit to the auto-restart handler.
pub struct Monitor {
	pub exits: mpsc::UnboundedSender<ExitEvent>,
	pub options: Options,
}

type ReplySender = oneshot::Sender<Result<Reply, String>>;

struct Call {
	message: ControlMessage,
	reply: ReplySender,
}

/// Handle to one launched service process. The process itself is owned by a
/// task; every interaction goes through channels.
#[derive(Clone)]
pub struct ChildLink {
	pid: Option<u32>,
	calls: mpsc::UnboundedSender<Call>,
	kill: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl ChildLink {
	pub fn spawn(
		name: &str,
		instance: u64,
		target: &LaunchTarget,
		monitor: Option<Monitor>,
	) -> Result<Self, String> {
		let mut child = spawn_target(target)?;
		let pid = child.id();
		let stdin = child.stdin.take().ok_or("child stdin unavailable")?;
		let stdout = child.stdout.take().ok_or("child stdout unavailable")?;

		let (calls_tx, calls_rx) = mpsc::unbounded_channel();
		let (kill_tx, kill_rx) = mpsc::unbounded_channel();

		let owner = ChildTask {
			name: name.to_string(),
			instance,
			pid,
			lines: BufReader::new(stdout).lines(),
			pending: VecDeque::new(),
		};
		tokio::spawn(owner.run(child, stdin, calls_rx, kill_rx, monitor));

		Ok(Self {
			pid,
			calls: calls_tx,
			kill: kill_tx,
		})
	}

	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	/// Sends one control message and waits for the first reply that follows it.
	pub async fn call(&self, message: ControlMessage, timeout: Option<Duration>) -> Result<Reply, String> {
		let (tx, rx) = oneshot::channel();
		self.calls
			.send(Call { message, reply: tx })
			.map_err(|_| "process is not running".to_string())?;

		let wait = async move {
			match rx.await {
				Ok(result) => result,
				Err(_) => Err("process exited before replying".to_string()),
			}
		};
		match timeout {
			Some(limit) => tokio::time::timeout(limit, wait)
				.await
				.map_err(|_| "timed out waiting for reply".to_string())?,
			None => wait.await,
		}
	}

	/// Kills the process group and returns once the child has been reaped.
	/// A terminated child never produces an [`ExitEvent`].
	pub async fn terminate(&self) {
		let (tx, rx) = oneshot::channel();
		if self.kill.send(tx).is_ok() {
			let _ = rx.await;
		}
	}
}

struct ChildTask {
	name: String,
	instance: u64,
	pid: Option<u32>,
	lines: Lines<BufReader<ChildStdout>>,
	pending: VecDeque<ReplySender>,
}

impl ChildTask {
	async fn run(
		mut self,
		mut child: Child,
		mut stdin: ChildStdin,
		mut calls: mpsc::UnboundedReceiver<Call>,
		mut kill: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
		monitor: Option<Monitor>,
	) {
		let mut stdout_open = true;

		let exit = loop {
			tokio::select! {
				biased;
				Some(ack) = kill.recv() => break Err(ack),
				Some(call) = calls.recv() => {
					let written = match call.message.to_line() {
						Ok(data) => stdin.write_all(&data).await.map_err(|e| e.to_string()),
						Err(e) => Err(e.to_string()),
					};
					match written {
						Ok(()) => self.pending.push_back(call.reply),
						Err(e) => {
							let _ = call.reply.send(Err(format!("failed to message {}: {}", self.name, e)));
						}
					}
				}
				line = self.lines.next_line(), if stdout_open => match line {
					Ok(Some(line)) => self.handle_line(&line),
					Ok(None) | Err(_) => stdout_open = false,
				},
				status = child.wait() => break Ok(status),
			}
		};

		match exit {
			Err(ack) => {
				if let Some(pid) = self.pid {
					kill_process_group(pid);
				}
				let _ = child.kill().await;
				tracing::debug!("{} (pid {:?}) terminated", self.name, self.pid);
				self.pending.clear();
				let _ = ack.send(());
			}
			Ok(status) => {
				// A reply written just before exiting may still be buffered.
				if stdout_open {
					let _ = tokio::time::timeout(DRAIN_TIMEOUT, self.drain()).await;
				}
				let description = match status {
					Ok(status) => format!("exited with {}", status),
					Err(e) => format!("could not be waited on: {}", e),
				};
				tracing::info!("process {} (pid {:?}) {}", self.name, self.pid, description);
				self.pending.clear();
				if let Some(monitor) = monitor {
					let _ = monitor.exits.send(ExitEvent {
						name: self.name.clone(),
						instance: self.instance,
						options: monitor.options,
						description,
					});
				}
			}
		}
	}

	async fn drain(&mut self) {
		while let Ok(Some(line)) = self.lines.next_line().await {
			self.handle_line(&line);
		}
	}

	/// JSON objects answer the oldest outstanding call; anything else is output.
	fn handle_line(&mut self, line: &str) {
		let line = line.trim();
		if line.is_empty() {
			return;
		}
		match serde_json::from_str::<Value>(line) {
			Ok(Value::Object(map)) => {
				while let Some(reply) = self.pending.pop_front() {
					// The caller timed out; this reply belongs to nobody still waiting.
					if reply.is_closed() {
						continue;
					}
					let _ = reply.send(Ok(Reply(map)));
					return;
				}
				tracing::debug!("{}: unsolicited message {}", self.name, line);
			}
			_ => tracing::info!("[{}] {}", self.name, line),
		}
	}
}

fn spawn_target(target: &LaunchTarget) -> Result<Child, String> {
	let mut cmd = Command::new("sh");
	cmd.args(["-c", target.command()])
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::inherit())
		// Own process group so the whole tree can be killed at once
		.process_group(0)
		.kill_on_drop(true);

	cmd.spawn().map_err(|e| format!("spawn failed: {}", e))
}

pub(crate) fn kill_process_group(pid: u32) {
	use nix::sys::signal::{killpg, Signal};
	use nix::unistd::Pid;
	let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(test)]
mod tests {
	use super::*;
	use overseer_core::protocol::ControlAction;
	use serde_json::json;

	const RESPONDER: &str = r#"while read line; do echo '{"ok":true}'; done"#;

	#[tokio::test]
	async fn call_resolves_with_first_reply() {
		let link = ChildLink::spawn("responder", 1, &LaunchTarget(RESPONDER.into()), None).unwrap();
		let reply = link
			.call(ControlMessage::new(ControlAction::Status, &Options::new()), None)
			.await
			.unwrap();
		assert_eq!(reply.get("ok"), Some(&json!(true)));
		link.terminate().await;
	}

	#[tokio::test]
	async fn non_json_output_is_not_a_reply() {
		let script = r#"read line; echo "booting"; echo '{"started":true}'; sleep 5"#;
		let link = ChildLink::spawn("chatty", 1, &LaunchTarget(script.into()), None).unwrap();
		let reply = link
			.call(ControlMessage::new(ControlAction::Start, &Options::new()), None)
			.await
			.unwrap();
		assert!(reply.flag("started"));
		link.terminate().await;
	}

	#[tokio::test]
	async fn exit_before_reply_fails_the_call() {
		let link = ChildLink::spawn("quitter", 1, &LaunchTarget("read line; exit 3".into()), None).unwrap();
		let err = link
			.call(ControlMessage::new(ControlAction::Start, &Options::new()), None)
			.await
			.unwrap_err();
		assert!(err.contains("exited"), "{}", err);
	}

	#[tokio::test]
	async fn silent_child_times_out() {
		let link = ChildLink::spawn("mute", 1, &LaunchTarget("sleep 30".into()), None).unwrap();
		let err = link
			.call(
				ControlMessage::new(ControlAction::Start, &Options::new()),
				Some(Duration::from_millis(200)),
			)
			.await
			.unwrap_err();
		assert_eq!(err, "timed out waiting for reply");
		link.terminate().await;
	}

	#[tokio::test]
	async fn late_call_is_not_answered_for_a_timed_out_one() {
		let script = r#"read a; read b; echo '{"n":2}'; sleep 30"#;
		let link = ChildLink::spawn("slow", 1, &LaunchTarget(script.into()), None).unwrap();
		let first = link
			.call(
				ControlMessage::new(ControlAction::Status, &Options::new()),
				Some(Duration::from_millis(200)),
			)
			.await;
		assert_eq!(first.unwrap_err(), "timed out waiting for reply");

		let second = link
			.call(
				ControlMessage::new(ControlAction::Status, &Options::new()),
				Some(Duration::from_secs(5)),
			)
			.await
			.unwrap();
		assert_eq!(second.get("n"), Some(&json!(2)));
		link.terminate().await;
	}

	#[tokio::test]
	async fn monitored_exit_emits_event_but_terminate_does_not() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let monitor = Monitor { exits: tx.clone(), options: Options::new() };
		let link = ChildLink::spawn("crasher", 7, &LaunchTarget("exit 2".into()), Some(monitor)).unwrap();
		let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
		assert_eq!(event.name, "crasher");
		assert_eq!(event.instance, 7);
		assert!(event.description.contains("exited"));
		drop(link);

		let monitor = Monitor { exits: tx, options: Options::new() };
		let link = ChildLink::spawn("killed", 8, &LaunchTarget("sleep 30".into()), Some(monitor)).unwrap();
		link.terminate().await;
		let none = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
		assert!(none.is_err());
	}
}
