//! Claude Code output parsing.
//!
//! Understands the `--output-format json` result object, the `--verbose`
//! array form, and newline-delimited stream-json.

use serde::Deserialize;

use agent_mesh_core::Error;

/// One message in Claude Code's output.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeOutput {
    /// System information at start.
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Result/completion message.
    Result(ClaudeResult),

    /// Assistant, user and any other message we do not inspect.
    #[serde(other)]
    Other,
}

/// The completion record carrying the model's reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeResult {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl ClaudeResult {
    pub fn tokens(&self) -> u64 {
        self.usage.as_ref().map(Usage::total_tokens).unwrap_or(0)
    }
}

/// Find the result record in whatever Claude Code printed.
pub fn parse_output(stdout: &str) -> Result<ClaudeResult, Error> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(Error::Engine("Claude Code produced no output".into()));
    }

    let outputs: Vec<ClaudeOutput> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else if let Ok(output) = serde_json::from_str::<ClaudeOutput>(trimmed) {
        vec![output]
    } else {
        trimmed
            .lines()
            .filter_map(|line| serde_json::from_str(line.trim()).ok())
            .collect()
    };

    outputs
        .into_iter()
        .rev()
        .find_map(|output| match output {
            ClaudeOutput::Result(result) => Some(result),
            _ => None,
        })
        .ok_or_else(|| Error::Engine("no result record in Claude Code output".into()))
}
