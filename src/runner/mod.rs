//! Agent subprocess supervision over a PTY.
//!
//! [`Runner::start`] launches a task directory's run script under a pseudo
//! terminal, speaking line-framed stream-json in both directions. A single
//! blocking worker parses the output into typed [`OutputItem`]s and
//! synthesizes exactly one terminal [`TaskResult`]; a watchdog enforces the
//! execution timeout and cancellation by signalling the whole process group.

pub mod protocol;

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::ValueEnum;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::permission::{PermissionChannel, PermissionRequest, PermissionResponse};
use crate::permission::channel::PERMISSION_TOOL_NAME;
use crate::permission::rules;
use crate::tasks::TaskRegistry;
use crate::{AppError, Result};

use protocol::{ImageAttachment, StreamMessage};

const OUTPUT_CAPACITY: usize = 100;
const PTY_ROWS: u16 = 40;
const PTY_COLS: u16 = 120;

/// Permission mode forwarded to the agent subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PermissionMode {
    #[value(name = "default")]
    Default,
    #[value(name = "acceptEdits")]
    AcceptEdits,
    #[value(name = "bypassPermissions")]
    BypassPermissions,
}

impl PermissionMode {
    /// CLI flag value, or `None` for the default mode (no flag passed).
    #[must_use]
    pub fn as_flag(self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::AcceptEdits => Some("acceptEdits"),
            Self::BypassPermissions => Some("bypassPermissions"),
        }
    }
}

/// Completion statistics from the agent's terminal `result` message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub is_error: bool,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub cost_usd: f64,
}

/// Typed output emitted by the parse worker. Never carries raw protocol
/// framing.
#[derive(Debug, Clone)]
pub enum OutputItem {
    /// Prose from the agent (complete blocks or streaming deltas).
    TextChunk(String),
    /// A finished tool invocation with its textual result body.
    ToolResult {
        tool_name: String,
        tool_input: Map<String, Value>,
        body: String,
        is_error: bool,
    },
    /// Completion statistics.
    Stats(TaskStats),
}

/// Terminal result of one agent run.
#[derive(Debug)]
pub struct TaskResult {
    /// Session id captured from the agent, if it emitted one.
    pub session_id: Option<String>,
    /// All text the agent produced, accumulated in arrival order.
    pub output: String,
    /// `None` on clean exit; `Timeout`, `Cancelled`, or `Subprocess`
    /// otherwise.
    pub error: Option<AppError>,
}

/// Single-consumer streams for one run, handed to the dispatcher's pump.
#[derive(Debug)]
pub struct TaskStreams {
    pub output: mpsc::Receiver<OutputItem>,
    pub permissions: mpsc::Receiver<PermissionRequest>,
    pub done: oneshot::Receiver<TaskResult>,
}

/// Shared handle to a live agent run.
pub struct RunningTask {
    task_path: PathBuf,
    pty_writer: Mutex<Box<dyn Write + Send>>,
    permission: PermissionChannel,
    session_id: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RunningTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningTask")
            .field("task_path", &self.task_path)
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

impl RunningTask {
    /// Task directory this run executes in.
    #[must_use]
    pub fn task_path(&self) -> &Path {
        &self.task_path
    }

    /// Session id captured from the agent, once it has emitted one.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().expect("session id lock").clone()
    }

    fn capture_session_id(&self, session_id: &str) {
        let mut guard = self.session_id.lock().expect("session id lock");
        if guard.is_none() {
            debug!(session_id, "captured session ID");
            *guard = Some(session_id.to_owned());
        }
    }

    /// Send follow-up text to the agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` for empty input, `AppError::Pty` on
    /// write failure.
    pub fn send_input(&self, text: &str) -> Result<()> {
        self.send_input_with_images(text, &[])
    }

    /// Send follow-up text plus inline images to the agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` for empty input, `AppError::Pty` on
    /// write failure.
    pub fn send_input_with_images(&self, text: &str, images: &[ImageAttachment]) -> Result<()> {
        let mut line = protocol::build_input_message(text, images)?;
        line.push('\n');

        debug!(
            num_images = images.len(),
            json_len = line.len(),
            "sending input to agent"
        );

        let mut writer = self.pty_writer.lock().expect("pty writer lock");
        writer
            .write_all(line.as_bytes())
            .map_err(|err| AppError::Pty(format!("write input: {err}")))?;
        writer
            .flush()
            .map_err(|err| AppError::Pty(format!("flush input: {err}")))?;
        Ok(())
    }

    /// Queue a permission decision for the out-of-process tool.
    pub fn send_permission_response(&self, response: PermissionResponse) {
        self.permission.send_response(response);
    }

    /// Cancel the run; the whole process group receives SIGKILL.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Factory for agent runs with fixed timeout and mode configuration.
#[derive(Debug, Clone)]
pub struct Runner {
    timeout: Duration,
    permission_mode: PermissionMode,
    agents_prompt_path: Option<PathBuf>,
}

impl Runner {
    /// Create a runner.
    #[must_use]
    pub fn new(
        timeout: Duration,
        permission_mode: PermissionMode,
        agents_prompt_path: Option<PathBuf>,
    ) -> Self {
        Self {
            timeout,
            permission_mode,
            agents_prompt_path,
        }
    }

    /// Configured execution timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start the agent in `task_path` with the given prompt.
    ///
    /// A non-empty `session_id` resumes that agent conversation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Pipe` / `AppError::Io` if the permission channel
    /// cannot be materialized, `AppError::Pty` if the PTY or the subprocess
    /// cannot be started. The permission channel is torn down on launch
    /// failure.
    pub fn start(
        &self,
        task_path: &Path,
        prompt: &str,
        session_id: Option<&str>,
    ) -> Result<(Arc<RunningTask>, TaskStreams)> {
        let mut permission =
            PermissionChannel::create(task_path, self.agents_prompt_path.as_deref())?;
        let permissions_rx = permission.start();

        let args = self.build_args(task_path, &permission, prompt, session_id);
        debug!(
            task_path = %task_path.display(),
            session_id = session_id.unwrap_or(""),
            ?args,
            "starting agent with pty"
        );

        let pty_system = native_pty_system();
        let pair = match pty_system.openpty(PtySize {
            rows: PTY_ROWS,
            cols: PTY_COLS,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(pair) => pair,
            Err(err) => {
                permission.close();
                return Err(AppError::Pty(format!("openpty: {err}")));
            }
        };

        let mut cmd = CommandBuilder::new(TaskRegistry::run_script(task_path));
        for arg in &args {
            cmd.arg(arg);
        }
        cmd.cwd(task_path);
        // Give the operator minutes, not seconds, to answer a prompt before
        // the agent's tool call times out.
        cmd.env("MCP_TOOL_TIMEOUT", "300000");
        cmd.env("CLOD_RUNTIME_SUFFIX", permission.runtime_suffix());
        cmd.env("CLOD_CONCURRENT", "true");
        cmd.env("CLOD_NONINTERACTIVE", "true");

        let child = match pair.slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(err) => {
                permission.close();
                return Err(AppError::Pty(format!("spawn agent: {err}")));
            }
        };
        drop(pair.slave);

        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(err) => {
                permission.close();
                return Err(AppError::Pty(format!("clone pty reader: {err}")));
            }
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(err) => {
                permission.close();
                return Err(AppError::Pty(format!("take pty writer: {err}")));
            }
        };

        let cancel = CancellationToken::new();
        let task = Arc::new(RunningTask {
            task_path: task_path.to_path_buf(),
            pty_writer: Mutex::new(writer),
            permission,
            // Set by the agent's first emit, not by the resume parameter:
            // a resumed conversation gets a fresh id from the agent.
            session_id: Mutex::new(None),
            cancel: cancel.clone(),
        });

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let timed_out = Arc::new(AtomicBool::new(false));

        if let Some(pid) = child.process_id() {
            tokio::spawn(watchdog(
                pid,
                self.timeout,
                Arc::clone(&timed_out),
                cancel.clone(),
            ));
        }

        let worker_task = Arc::clone(&task);
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            parse_worker(
                reader,
                pair.master,
                child,
                worker_task,
                output_tx,
                done_tx,
                timed_out,
                timeout,
            );
        });

        Ok((
            task,
            TaskStreams {
                output: output_rx,
                permissions: permissions_rx,
                done: done_rx,
            },
        ))
    }

    fn build_args(
        &self,
        task_path: &Path,
        permission: &PermissionChannel,
        prompt: &str,
        session_id: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec![
            "-p".to_owned(),
            "--output-format".to_owned(),
            "stream-json".to_owned(),
            "--input-format".to_owned(),
            "stream-json".to_owned(),
            "--include-partial-messages".to_owned(),
            "--verbose".to_owned(),
            "--mcp-config".to_owned(),
            permission.mcp_config_path().display().to_string(),
            "--permission-prompt-tool".to_owned(),
            PERMISSION_TOOL_NAME.to_owned(),
        ];

        if permission.agent_prompt_path().is_some() {
            args.push("--append-system-prompt".to_owned());
            args.push(format!(
                "You are an agent as described in {}/AGENT.md; Read that document as soon as \
                 possible and treat it as part of your system prompt.",
                permission.runtime_dir_name()
            ));
        }

        let allowed_tools = rules::read_allowed_tools(task_path);
        if !allowed_tools.is_empty() {
            debug!(?allowed_tools, "passing saved allowed tools to agent");
        }
        for rule in allowed_tools {
            args.push("--allowedTools".to_owned());
            args.push(rule);
        }

        if let Some(mode) = self.permission_mode.as_flag() {
            args.push("--permission-mode".to_owned());
            args.push(mode.to_owned());
        }
        if let Some(session_id) = session_id {
            args.push("--resume".to_owned());
            args.push(session_id.to_owned());
        }

        args.push(prompt.to_owned());
        args
    }
}

/// Kill the process group on timeout or cancellation.
async fn watchdog(
    pid: u32,
    timeout: Duration,
    timed_out: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    tokio::select! {
        () = cancel.cancelled() => {}
        () = tokio::time::sleep(timeout) => {
            timed_out.store(true, Ordering::SeqCst);
            cancel.cancel();
        }
    }
    // The run script is a session leader on the PTY, so the group id is the
    // child pid. ESRCH just means it already exited.
    if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(pid, %err, "process group signal skipped");
    }
}

/// The PTY parse worker: the only emitter on the output stream and result
/// sink.
#[allow(clippy::too_many_arguments)]
fn parse_worker(
    reader: Box<dyn Read + Send>,
    master: Box<dyn portable_pty::MasterPty + Send>,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    task: Arc<RunningTask>,
    output_tx: mpsc::Sender<OutputItem>,
    done_tx: oneshot::Sender<TaskResult>,
    timed_out: Arc<AtomicBool>,
    timeout: Duration,
) {
    let mut accumulated = String::new();
    // tool_use id → (name, input); owned by this worker alone.
    let mut tool_uses: HashMap<String, (String, Map<String, Value>)> = HashMap::new();

    let mut reader = BufReader::with_capacity(64 * 1024, reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%err, "pty read ended");
                break;
            }
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }

        let msg: StreamMessage = match serde_json::from_str(trimmed) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(line = trimmed, %err, "failed to parse stream-json line");
                continue;
            }
        };

        if !msg.session_id.is_empty() {
            task.capture_session_id(&msg.session_id);
        }

        match msg.kind.as_str() {
            "system" => {
                // init carries the session id; already captured above.
            }
            "assistant" => {
                let Some(body) = msg.message else { continue };
                for block in body.content {
                    match block.kind.as_str() {
                        "text" => {
                            if !block.text.is_empty() {
                                accumulated.push_str(&block.text);
                                emit(&output_tx, OutputItem::TextChunk(block.text));
                            }
                        }
                        "tool_use" => {
                            debug!(
                                tool_id = %block.id,
                                tool_name = %block.name,
                                "tool use requested"
                            );
                            tool_uses.insert(block.id, (block.name, block.input));
                        }
                        _ => {}
                    }
                }
            }
            "user" => {
                let Some(body) = msg.message else { continue };
                for block in body.content {
                    if block.kind != "tool_result" {
                        continue;
                    }
                    let content_text = block.content_text();
                    if content_text.is_empty() {
                        continue;
                    }
                    let (tool_name, tool_input) = tool_uses
                        .get(&block.tool_use_id)
                        .cloned()
                        .unwrap_or_default();
                    debug!(
                        tool_use_id = %block.tool_use_id,
                        tool_name = %tool_name,
                        is_error = block.is_error,
                        content_len = content_text.len(),
                        "received tool result"
                    );
                    accumulated.push_str(&content_text);
                    emit(
                        &output_tx,
                        OutputItem::ToolResult {
                            tool_name,
                            tool_input,
                            body: content_text.trim_end().to_owned(),
                            is_error: block.is_error,
                        },
                    );
                }
            }
            "content_block_delta" => {
                let text = msg
                    .content_block_delta
                    .and_then(|delta| delta.delta)
                    .map(|delta| delta.text)
                    .unwrap_or_default();
                if !text.is_empty() {
                    accumulated.push_str(&text);
                    emit(&output_tx, OutputItem::TextChunk(text));
                }
            }
            "result" => {
                info!(
                    subtype = %msg.subtype,
                    cost_usd = msg.total_cost_usd,
                    duration_ms = msg.duration_ms,
                    num_turns = msg.num_turns,
                    is_error = msg.is_error,
                    "task result"
                );
                // The final result text is already covered by prior chunks
                // in chat; keep it only in the accumulated buffer.
                if !msg.result.is_empty() {
                    accumulated.push_str(&msg.result);
                }
                emit(
                    &output_tx,
                    OutputItem::Stats(TaskStats {
                        is_error: msg.is_error,
                        duration_ms: msg.duration_ms,
                        num_turns: msg.num_turns,
                        cost_usd: msg.total_cost_usd,
                    }),
                );
            }
            _ => {}
        }
    }

    let status = child.wait();

    let error = if timed_out.load(Ordering::SeqCst) {
        Some(AppError::Timeout(timeout))
    } else if task.cancel.is_cancelled() {
        Some(AppError::Cancelled)
    } else {
        match status {
            Ok(status) if status.success() => None,
            Ok(status) => Some(AppError::Subprocess(format!(
                "process exited with code {}",
                status.exit_code()
            ))),
            Err(err) => Some(AppError::Subprocess(format!("wait failed: {err}"))),
        }
    };

    let result = TaskResult {
        session_id: task.session_id(),
        output: accumulated,
        error,
    };

    // Teardown order: output stream, result sink, PTY, permission channel.
    drop(output_tx);
    if done_tx.send(result).is_err() {
        warn!("result sink closed before terminal result could be delivered");
    }
    drop(master);
    task.permission.close();
    task.cancel.cancel();
}

fn emit(output_tx: &mpsc::Sender<OutputItem>, item: OutputItem) {
    if let Err(mpsc::error::TrySendError::Full(_)) = output_tx.try_send(item) {
        warn!("output channel full, dropping item");
    }
}
