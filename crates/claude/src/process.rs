//! Claude Code process management.
//!
//! Each proposal is one `claude --print --output-format json` invocation: the
//! rendered transcript goes in on stdin, the tagged reply comes back in the
//! result record.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use agent_mesh_core::{Error, MessageRole, Proposal, ReasoningContext, ReasoningEngine};

use crate::output::{parse_output, ClaudeResult};
use crate::parse::parse_response;

/// A tool the model may call, as described in the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Reasoning engine that shells out to the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeEngine {
    binary: String,
    working_dir: Option<PathBuf>,
    model: Option<String>,
    tools: Vec<ToolSpec>,
    timeout: Option<Duration>,
}

impl Default for ClaudeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeEngine {
    pub fn new() -> Self {
        Self {
            binary: "claude".into(),
            working_dir: None,
            model: None,
            tools: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run one prompt through Claude Code and return its result record.
    pub async fn invoke(&self, prompt: &str) -> Result<ClaudeResult, Error> {
        info!(prompt_len = prompt.len(), "Invoking Claude Code");

        let mut command = Command::new(&self.binary);
        command
            .arg("--print")
            .args(["--output-format", "json"])
            .args(["--max-turns", "1"]);
        if let Some(model) = &self.model {
            command.args(["--model", model.as_str()]);
        }
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Engine("Failed to capture stdin".into()))?;
        stdin.write_all(prompt.as_bytes()).await?;
        drop(stdin);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    Error::Engine(format!("Claude Code timed out after {}s", limit.as_secs()))
                })??,
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(status = %output.status, stderr = %stderr.trim(), "Claude Code exited with failure");
            return Err(Error::Engine(format!(
                "claude exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let result = parse_output(&String::from_utf8_lossy(&output.stdout))?;
        info!(
            is_error = result.is_error,
            cost_usd = ?result.total_cost_usd,
            total_tokens = result.tokens(),
            "Claude completed"
        );
        if result.is_error {
            return Err(Error::Engine(format!(
                "Claude Code reported {}: {}",
                result.subtype,
                result.result.as_deref().unwrap_or("no detail")
            )));
        }

        Ok(result)
    }
}

#[async_trait]
impl ReasoningEngine for ClaudeEngine {
    async fn propose(&self, context: &ReasoningContext) -> Result<Proposal, Error> {
        let prompt = build_prompt(context, &self.tools);
        let result = self.invoke(&prompt).await?;
        let reply = result.result.unwrap_or_default();
        let preview: String = reply.chars().take(100).collect();
        debug!(preview = %preview, "Claude reply");
        parse_response(&reply)
    }
}

const FORMAT_INSTRUCTIONS: &str = "\
Answer in this format:
<thought>your reasoning</thought>
then exactly one of
<action>{\"tool\": \"<tool name>\", \"args\": {...}}</action>
<final_answer>your answer</final_answer>

To message another session, put {\"target\": \"<session id>\", \"message\": \"<text>\"} \
in your thought or final answer.";

fn build_prompt(context: &ReasoningContext, tools: &[ToolSpec]) -> String {
    let mut prompt = format!(
        "You are agent session `{}` (iteration {}).\n\n{FORMAT_INSTRUCTIONS}",
        context.session_id, context.iteration
    );

    prompt.push_str("\n\nAvailable tools:");
    if tools.is_empty() {
        prompt.push_str(" none");
    }
    for tool in tools {
        prompt.push_str(&format!("\n- {}: {}", tool.name, tool.description));
    }

    prompt.push_str("\n\nOther sessions online: ");
    if context.peers.is_empty() {
        prompt.push_str("none");
    } else {
        prompt.push_str(&context.peers.join(", "));
    }

    prompt.push_str("\n\nConversation so far:");
    for msg in &context.messages {
        let label = match msg.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        prompt.push_str(&format!("\n\n[{label}] {}", msg.content));
    }

    prompt
}
