//! Runs an external agent process: a prompt in over stdin, free text (and
//! optionally a line-oriented JSON event protocol) out over stdout.
//!
//! The executor does not interpret `agentConfig.command` beyond spawning it;
//! everything it knows about an agent's behavior is encoded as the sentinels
//! in [`parsers`] and the prompts in [`crate::prompts`] that ask for them.

pub mod parsers;
pub mod stream;

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use ralph_common::RalphError;

use crate::config::AgentConfig;
use stream::{AgentEvent, ContentBlock};

/// A cooperative cancellation signal, checked at iteration boundaries and at
/// the start of each agent spawn; the executor propagates it as child
/// termination rather than polling for it internally.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A tool invocation observed in the streamed output, surfaced to callers
/// wanting to narrate agent activity without having to decode JSON lines
/// themselves.
#[derive(Debug, Clone)]
pub struct ToolUse {
    pub name: String,
    pub input: serde_json::Value,
}

pub struct RunOptions<'a> {
    /// Decode stdout line-by-line as the JSON event protocol rather than
    /// collecting it as plain text.
    pub stream: bool,
    pub cancel: CancellationToken,
    pub on_output: Option<&'a mut dyn FnMut(&str)>,
    pub on_tool: Option<&'a mut dyn FnMut(&ToolUse)>,
}

impl Default for RunOptions<'_> {
    fn default() -> Self {
        Self {
            stream: false,
            cancel: CancellationToken::new(),
            on_output: None,
            on_tool: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub output: String,
    pub exit_code: i32,
    pub aborted: bool,
}

/// Spawn `agent`, write `prompt` to its stdin (closing it afterward), and
/// collect its output per `opts`.
pub async fn run(prompt: &str, agent: &AgentConfig, mut opts: RunOptions<'_>) -> Result<AgentRunResult, RalphError> {
    let command = agent.resolved_command();
    let mut cmd = Command::new(&command);
    cmd.args(&agent.args);
    if agent.resolved_skip_permissions() {
        cmd.arg("--dangerously-skip-permissions");
    }
    let mut child = match cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(source) => {
            tracing::error!(command = %command, error = %source, "failed to spawn agent");
            return Ok(AgentRunResult {
                output: format!("failed to spawn agent '{command}': {source}"),
                exit_code: 1,
                aborted: false,
            });
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(RalphError::AgentSpawnError)?;
        drop(stdin);
    }

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut output = String::new();
    let mut aborted = false;

    loop {
        tokio::select! {
            biased;
            line = stdout_lines.next_line() => {
                match line.map_err(RalphError::AgentSpawnError)? {
                    Some(line) => process_line(&line, opts.stream, &mut output, opts.on_output.as_deref_mut(), opts.on_tool.as_deref_mut()),
                    None => break,
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {
                if opts.cancel.is_cancelled() {
                    let _ = child.start_kill();
                    aborted = true;
                    break;
                }
            }
        }
    }

    if !opts.stream {
        while let Some(line) = stderr_lines.next_line().await.map_err(RalphError::AgentSpawnError)? {
            output.push('\n');
            output.push_str(&line);
        }
    }

    let exit_code = if aborted {
        -1
    } else {
        match child.wait().await {
            Ok(status) => status.code().unwrap_or(1),
            Err(_) => 1,
        }
    };

    Ok(AgentRunResult { output, exit_code, aborted })
}

fn process_line(
    line: &str,
    stream: bool,
    output: &mut String,
    mut on_output: Option<&mut dyn FnMut(&str)>,
    mut on_tool: Option<&mut dyn FnMut(&ToolUse)>,
) {
    if !stream {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(line);
        if let Some(cb) = on_output.as_deref_mut() {
            cb(line);
        }
        return;
    }

    match stream::decode_line(line) {
        Some(AgentEvent::Assistant { message }) => {
            for block in message.content {
                match block {
                    ContentBlock::Text { text } => {
                        if let Some(cb) = on_output.as_deref_mut() {
                            cb(&text);
                        }
                        output.push_str(&text);
                    }
                    ContentBlock::ToolUse { name, input } => {
                        if let Some(cb) = on_tool.as_deref_mut() {
                            cb(&ToolUse { name, input });
                        }
                    }
                    ContentBlock::Other => {}
                }
            }
        }
        Some(AgentEvent::Result { result: Some(text) }) if output.is_empty() => {
            output.push_str(&text);
        }
        Some(_) => {}
        None => {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(line);
            if let Some(cb) = on_output.as_deref_mut() {
                cb(line);
            }
        }
    }
}
