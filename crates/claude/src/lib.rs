//! Claude Code reasoning engine for agent sessions.

pub mod output;
pub mod parse;
pub mod process;

pub use output::{parse_output, ClaudeOutput, ClaudeResult, Usage};
pub use parse::parse_response;
pub use process::{ClaudeEngine, ToolSpec};
