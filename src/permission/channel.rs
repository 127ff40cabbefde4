//! Named-pipe channel to the out-of-process permission tool.
//!
//! Every task run gets a fresh runtime workspace under the task directory's
//! `.clod` marker, named `runtime-<hex>` so concurrent runs in the same
//! directory never collide. The workspace holds the two FIFOs, the embedded
//! MCP server script, its config document, and (optionally) a copy of the
//! configured agent prompt.
//!
//! The permission tool writes one JSON line per request on the request FIFO
//! and blocks reading the response FIFO until the bridge writes the decision.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::tasks::MARKER_DIR;
use crate::{AppError, Result};

/// Request FIFO name (permission tool writes, bridge reads).
pub const FIFO_REQUEST_NAME: &str = "permission_request.fifo";
/// Response FIFO name (bridge writes, permission tool reads).
pub const FIFO_RESPONSE_NAME: &str = "permission_response.fifo";
/// Embedded MCP server script name.
pub const MCP_SCRIPT_NAME: &str = "permission_mcp.py";
/// MCP config document name.
pub const MCP_CONFIG_NAME: &str = "mcp_config.json";
/// Qualified tool identifier passed to the agent subprocess.
pub const PERMISSION_TOOL_NAME: &str = "mcp__permission__request_permission";

/// Agent prompt copy name inside the runtime workspace.
pub const AGENT_PROMPT_NAME: &str = "AGENT.md";

const MCP_SCRIPT: &str = include_str!("permission_mcp.py");

const CHANNEL_CAPACITY: usize = 10;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Permission request forwarded by the out-of-process tool.
///
/// Only `tool_name` is required on the wire; older tool builds omit the
/// rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    #[serde(default)]
    pub session_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub tool_use_id: String,
    #[serde(default)]
    pub permission_mode: String,
    #[serde(default)]
    pub cwd: String,
}

/// Operator decision for a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

impl PermissionBehavior {
    /// Wire representation (`allow` / `deny`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// Decision written back to the permission tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub behavior: PermissionBehavior,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionResponse {
    /// An allow decision.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            message: None,
        }
    }

    /// A deny decision with an operator-facing reason.
    #[must_use]
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Deny,
            message: Some(message.into()),
        }
    }
}

/// FIFO pair plus runtime workspace for one task run.
#[derive(Debug)]
pub struct PermissionChannel {
    runtime_dir: PathBuf,
    runtime_suffix: String,
    request_path: PathBuf,
    response_path: PathBuf,
    agent_prompt: Option<PathBuf>,
    responses_tx: Option<mpsc::Sender<PermissionResponse>>,
    cancel: CancellationToken,
}

impl PermissionChannel {
    /// Materialize a fresh runtime workspace under `task_path`.
    ///
    /// Creates the FIFOs (mode 0600), writes the MCP server script (0755)
    /// and its config document, and copies the agent prompt file into the
    /// workspace when one is configured and readable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Pipe` if a FIFO cannot be created, `AppError::Io`
    /// for any other filesystem failure.
    pub fn create(task_path: &Path, agents_prompt_path: Option<&Path>) -> Result<Self> {
        let mut bytes = [0u8; 3];
        rand::thread_rng().fill_bytes(&mut bytes);
        let runtime_suffix = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();

        let runtime_dir = task_path
            .join(MARKER_DIR)
            .join(format!("runtime-{runtime_suffix}"));
        fs::create_dir_all(&runtime_dir)
            .map_err(|err| AppError::Io(format!("create runtime dir: {err}")))?;

        let agent_prompt = copy_agent_prompt(task_path, &runtime_dir, agents_prompt_path)?;

        let script_path = runtime_dir.join(MCP_SCRIPT_NAME);
        fs::write(&script_path, MCP_SCRIPT)
            .map_err(|err| AppError::Io(format!("write mcp script: {err}")))?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))
            .map_err(|err| AppError::Io(format!("chmod mcp script: {err}")))?;

        let request_path = runtime_dir.join(FIFO_REQUEST_NAME);
        let response_path = runtime_dir.join(FIFO_RESPONSE_NAME);

        // Stale FIFOs can survive a crash of a previous run with the same
        // suffix.
        let _ = fs::remove_file(&request_path);
        let _ = fs::remove_file(&response_path);

        mkfifo(&request_path, Mode::from_bits_truncate(0o600))
            .map_err(|err| AppError::Pipe(format!("mkfifo request: {err}")))?;
        if let Err(err) = mkfifo(&response_path, Mode::from_bits_truncate(0o600)) {
            let _ = fs::remove_file(&request_path);
            return Err(AppError::Pipe(format!("mkfifo response: {err}")));
        }

        let channel = Self {
            runtime_dir,
            runtime_suffix,
            request_path,
            response_path,
            agent_prompt,
            responses_tx: None,
            cancel: CancellationToken::new(),
        };
        channel.write_mcp_config()?;

        Ok(channel)
    }

    /// Spawn the FIFO reader and writer workers.
    ///
    /// Returns the request stream; requests are dropped with a warning when
    /// the stream is full. The workers stop when [`Self::close`] cancels the
    /// token.
    pub fn start(&mut self) -> mpsc::Receiver<PermissionRequest> {
        let (requests_tx, requests_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (responses_tx, responses_rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.responses_tx = Some(responses_tx);

        tokio::spawn(read_requests(
            self.request_path.clone(),
            requests_tx,
            self.cancel.clone(),
        ));
        tokio::spawn(write_responses(
            self.response_path.clone(),
            responses_rx,
            self.cancel.clone(),
        ));

        requests_rx
    }

    /// Queue a response for the permission tool without blocking.
    ///
    /// A full response stream drops the decision with a warning rather than
    /// stalling the dispatcher.
    pub fn send_response(&self, response: PermissionResponse) {
        let Some(ref tx) = self.responses_tx else {
            warn!("permission channel not started, dropping response");
            return;
        };
        match tx.try_send(response) {
            Ok(()) => debug!("queued permission response"),
            Err(err) => warn!(%err, "response channel full, dropping"),
        }
    }

    /// Stop the workers and remove the FIFOs.
    pub fn close(&self) {
        self.cancel.cancel();
        let _ = fs::remove_file(&self.request_path);
        let _ = fs::remove_file(&self.response_path);
        debug!(runtime_dir = %self.runtime_dir.display(), "permission channel closed");
    }

    /// Runtime workspace suffix for this run.
    #[must_use]
    pub fn runtime_suffix(&self) -> &str {
        &self.runtime_suffix
    }

    /// Runtime workspace directory.
    #[must_use]
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Runtime workspace path relative to the task directory.
    #[must_use]
    pub fn runtime_dir_name(&self) -> String {
        format!("{MARKER_DIR}/runtime-{}", self.runtime_suffix)
    }

    /// Path to the MCP config document.
    #[must_use]
    pub fn mcp_config_path(&self) -> PathBuf {
        self.runtime_dir.join(MCP_CONFIG_NAME)
    }

    /// Path to the copied agent prompt, when one was materialized.
    #[must_use]
    pub fn agent_prompt_path(&self) -> Option<&Path> {
        self.agent_prompt.as_deref()
    }

    fn write_mcp_config(&self) -> Result<()> {
        let script_path = self.runtime_dir.join(MCP_SCRIPT_NAME);
        let config = serde_json::json!({
            "mcpServers": {
                "permission": {
                    "command": "python3",
                    "args": [script_path],
                }
            }
        });
        let data = serde_json::to_vec_pretty(&config)
            .map_err(|err| AppError::Io(format!("serialize mcp config: {err}")))?;
        fs::write(self.mcp_config_path(), data)
            .map_err(|err| AppError::Io(format!("write mcp config: {err}")))?;

        debug!(
            config_path = %self.mcp_config_path().display(),
            tool_name = PERMISSION_TOOL_NAME,
            "created MCP config for permission server"
        );
        Ok(())
    }
}

/// Copy the configured agent prompt into the runtime workspace.
///
/// A relative path is resolved against the task directory. A missing source
/// file is skipped with a warning; empty content is skipped silently.
fn copy_agent_prompt(
    task_path: &Path,
    runtime_dir: &Path,
    agents_prompt_path: Option<&Path>,
) -> Result<Option<PathBuf>> {
    let Some(src) = agents_prompt_path else {
        return Ok(None);
    };
    let src_path = if src.is_absolute() {
        src.to_path_buf()
    } else {
        task_path.join(src)
    };

    let content = match fs::read(&src_path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %src_path.display(), "agent prompt file not found, skipping");
            return Ok(None);
        }
        Err(err) => return Err(AppError::Io(format!("read agent prompt: {err}"))),
    };
    if content.is_empty() {
        return Ok(None);
    }

    let dst = runtime_dir.join(AGENT_PROMPT_NAME);
    fs::write(&dst, content).map_err(|err| AppError::Io(format!("copy agent prompt: {err}")))?;
    debug!(src = %src_path.display(), dst = %dst.display(), "copied agent prompt file");
    Ok(Some(dst))
}

/// Reader worker: decode line-framed requests from the request FIFO.
///
/// The FIFO is opened read-write so the open succeeds before the peer
/// connects and the stream survives the peer closing between requests.
async fn read_requests(
    path: PathBuf,
    requests_tx: mpsc::Sender<PermissionRequest>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let receiver = match pipe::OpenOptions::new().read_write(true).open_receiver(&path) {
            Ok(receiver) => receiver,
            Err(err) => {
                if cancel.is_cancelled() {
                    return;
                }
                error!(%err, path = %path.display(), "failed to open request FIFO");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(OPEN_RETRY_DELAY) => continue,
                }
            }
        };

        let mut lines = BufReader::new(receiver).lines();
        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => return,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    let request: PermissionRequest = match serde_json::from_str(&line) {
                        Ok(request) => request,
                        Err(err) => {
                            error!(%err, %line, "failed to parse permission request");
                            continue;
                        }
                    };
                    info!(
                        tool_name = %request.tool_name,
                        tool_use_id = %request.tool_use_id,
                        "received permission request"
                    );
                    if requests_tx.send(request).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(%err, "failed to read request FIFO");
                    break;
                }
            }
        }
    }
}

/// Writer worker: deliver each queued response over the response FIFO.
///
/// The FIFO is opened per response and closed after the newline so the
/// blocked tool sees EOF-terminated, single-line frames.
async fn write_responses(
    path: PathBuf,
    mut responses_rx: mpsc::Receiver<PermissionResponse>,
    cancel: CancellationToken,
) {
    loop {
        let response = tokio::select! {
            () = cancel.cancelled() => return,
            response = responses_rx.recv() => response,
        };
        let Some(response) = response else { return };

        // The tool only opens its read end once it is waiting for the
        // decision, so retry the open until the peer shows up.
        let mut sender = loop {
            match pipe::OpenOptions::new().open_sender(&path) {
                Ok(sender) => break sender,
                Err(err) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    debug!(%err, "response FIFO has no reader yet, retrying");
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(OPEN_RETRY_DELAY) => {}
                    }
                }
            }
        };

        let mut data = match serde_json::to_vec(&response) {
            Ok(data) => data,
            Err(err) => {
                error!(%err, "failed to marshal permission response");
                continue;
            }
        };
        data.push(b'\n');

        if let Err(err) = sender.write_all(&data).await {
            error!(%err, "failed to write permission response");
            continue;
        }
        drop(sender);

        debug!(behavior = response.behavior.as_str(), "sent permission response");
    }
}
