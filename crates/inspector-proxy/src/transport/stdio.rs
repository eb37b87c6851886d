//! Subprocess transport.
//!
//! The server speaks newline-delimited JSON on stdin/stdout. Anything it
//! writes to stderr is surfaced as a `stderr` notification in the event
//! stream, so the pump delivers it to the browser leg out of band.

use super::{EventReceiver, EventSink, EventSubscription, Transport};
use crate::error::{ProxyError, ProxyResult};
use crate::message::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How long a server gets to exit after stdin is closed before it is killed.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Launch parameters for a subprocess server.
#[derive(Debug, Clone, Default)]
pub struct StdioConfig {
    /// Executable name or path.
    pub command: String,
    /// Command line arguments.
    pub args: Vec<String>,
    /// Environment overrides applied on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

/// Transport to a protocol server running as a child process.
pub struct StdioTransport {
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    sink: EventSink,
    events: EventSubscription,
}

impl StdioTransport {
    /// Spawn the server and start reading its output.
    pub fn spawn(config: StdioConfig) -> ProxyResult<Self> {
        let path = match config.env.get("PATH") {
            Some(path) => Some(OsString::from(path)),
            None => std::env::var_os("PATH"),
        };
        let program = resolve_executable(&config.command, path.as_deref());

        let mut cmd = Command::new(&program);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        debug!(command = %config.command, program = ?program, args = ?config.args, "Spawning server");

        let mut child = cmd.spawn().map_err(|e| ProxyError::SpawnFailed {
            command: config.command.clone(),
            message: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe(&config.command, "stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| missing_pipe(&config.command, "stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| missing_pipe(&config.command, "stderr"))?;

        let (sink, events) = EventSink::channel();
        let readers = sink.clone();
        tokio::spawn(async move {
            tokio::join!(
                read_stdout(stdout, readers.clone()),
                read_stderr(stderr, readers.clone())
            );
            debug!("Server output closed");
            readers.close();
        });

        Ok(Self {
            pid: child.id(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            sink,
            events,
        })
    }

    /// OS process id of the server, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

fn missing_pipe(command: &str, pipe: &str) -> ProxyError {
    ProxyError::SpawnFailed {
        command: command.to_string(),
        message: format!("failed to capture {pipe}"),
    }
}

async fn read_stdout(stdout: ChildStdout, sink: EventSink) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match Message::parse(line) {
                    Ok(message) => {
                        if !sink.message(message) {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(line = %line, "Ignoring non-JSON line from server");
                        sink.error(format!("Invalid JSON from server: {e}"));
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                sink.error(format!("Failed to read server stdout: {e}"));
                break;
            }
        }
    }
}

async fn read_stderr(mut stderr: ChildStderr, sink: EventSink) {
    let mut buf = vec![0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                if !sink.message(Message::stderr(chunk)) {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Failed to read server stderr");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn name(&self) -> &'static str {
        "stdio"
    }

    async fn send(&self, message: Message) -> ProxyResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProxyError::Closed)?;

        let mut line = message.to_json();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProxyError::transport(format!("Failed to write to server stdin: {e}")))?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) -> ProxyResult<()> {
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(pid = ?self.pid, %status, "Server exited"),
                _ => {
                    if let Err(e) = child.kill().await {
                        warn!(pid = ?self.pid, error = %e, "Failed to kill server process");
                    }
                }
            }
        }

        self.sink.close();
        Ok(())
    }

    fn events(&self) -> Option<EventReceiver> {
        self.events.take()
    }

    fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }
}

/// Merge environment layers; later layers win.
pub fn merge_environment<'a, I>(layers: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = &'a HashMap<String, String>>,
{
    let mut merged = HashMap::new();
    for layer in layers {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// Resolve a bare command name against `PATH`.
///
/// Commands that already contain a path separator are returned unchanged, as
/// are names that cannot be found (spawning will then report the failure).
pub fn resolve_executable(command: &str, path: Option<&OsStr>) -> PathBuf {
    let candidate = Path::new(command);
    if candidate.is_absolute() || candidate.components().count() > 1 {
        return candidate.to_path_buf();
    }

    let Some(path) = path else {
        return candidate.to_path_buf();
    };

    for dir in std::env::split_paths(path) {
        for name in executable_names(command) {
            let full = dir.join(name);
            if is_executable(&full) {
                return full;
            }
        }
    }

    candidate.to_path_buf()
}

#[cfg(windows)]
fn executable_names(command: &str) -> Vec<String> {
    let pathext = std::env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    let mut names = vec![command.to_string()];
    names.extend(
        pathext
            .split(';')
            .filter(|ext| !ext.is_empty())
            .map(|ext| format!("{command}{ext}")),
    );
    names
}

#[cfg(not(windows))]
fn executable_names(command: &str) -> Vec<String> {
    vec![command.to_string()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
