//! Process-backed tool invoker.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::invocation::ToolInvocation;
use crate::error::ToolError;

/// Maximum number of stderr bytes kept in a failure report.
const STDERR_TAIL_BYTES: usize = 4000;

/// Read size when draining tool stderr.
const READ_CHUNK_BYTES: usize = 8192;

/// Result of a completed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationOutcome {
    /// Executable that ran.
    pub program: String,
    /// Wall-clock time spent in the tool.
    pub duration: Duration,
}

impl InvocationOutcome {
    pub fn new(program: impl Into<String>, duration: Duration) -> Self {
        Self {
            program: program.into(),
            duration,
        }
    }
}

/// Runs external tools.
///
/// Implementations must report every non-zero exit as an error. No retry
/// happens at this layer.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Runs one invocation to completion.
    async fn run(&self, invocation: &ToolInvocation) -> Result<InvocationOutcome, ToolError>;
}

/// Invoker that spawns real child processes.
///
/// The child inherits the current process environment with the
/// invocation's declared variables layered on top, so the toolkit sees
/// its configuration without the orchestrator mutating its own
/// environment.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker {
    stream_output: bool,
}

impl ProcessInvoker {
    /// Creates an invoker that discards tool stdout.
    pub fn new() -> Self {
        Self {
            stream_output: false,
        }
    }

    /// Lets tool stdout pass through to the terminal instead of being
    /// discarded. Only the tail of stderr is kept, for failure reports.
    pub fn with_streamed_output(mut self, stream: bool) -> Self {
        self.stream_output = stream;
        self
    }
}

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn run(&self, invocation: &ToolInvocation) -> Result<InvocationOutcome, ToolError> {
        let start = Instant::now();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.envs(&invocation.env);
        cmd.stdin(Stdio::null());
        cmd.stderr(Stdio::piped());
        if self.stream_output {
            cmd.stdout(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null());
        }

        info!(tool = %invocation.program, "Running {}", invocation.display_command());

        let spawn_error = |e: std::io::Error| ToolError::Spawn {
            program: invocation.program.clone(),
            source: e,
        };

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let stderr_tail = match child.stderr.take() {
            Some(stderr) => read_tail(stderr, STDERR_TAIL_BYTES).await.map_err(spawn_error)?,
            None => Vec::new(),
        };
        let status = child.wait().await.map_err(spawn_error)?;

        let duration = start.elapsed();
        let stderr = tail_lossy(&stderr_tail, STDERR_TAIL_BYTES);

        if status.success() {
            debug!(tool = %invocation.program, ?duration, "Tool completed");
            return Ok(InvocationOutcome::new(&invocation.program, duration));
        }

        match status.code() {
            Some(code) => {
                warn!(tool = %invocation.program, code, "Tool exited with non-zero status");
                Err(ToolError::NonZeroExit {
                    program: invocation.program.clone(),
                    code,
                    stderr,
                })
            }
            None => {
                warn!(tool = %invocation.program, "Tool terminated by signal");
                Err(ToolError::Terminated {
                    program: invocation.program.clone(),
                    stderr,
                })
            }
        }
    }
}

/// Drains `reader` to EOF, holding on to at most the last `2 * max_len`
/// bytes at any time.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, max_len: usize) -> std::io::Result<Vec<u8>> {
    let mut tail = Vec::with_capacity(max_len * 2);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        tail.extend_from_slice(&chunk[..n]);
        if tail.len() > max_len * 2 {
            tail.drain(..tail.len() - max_len);
        }
    }
    Ok(tail)
}

/// Keeps the last `max_len` bytes of tool output, trimmed to a char boundary.
fn tail_lossy(bytes: &[u8], max_len: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    if text.len() <= max_len {
        return text.to_string();
    }

    let mut start = text.len() - max_len;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated]... {}", &text[start..])
}
