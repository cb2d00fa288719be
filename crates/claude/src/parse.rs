//! Tagged response parsing.
//!
//! The model is asked to answer with `<thought>`, then either `<action>` or
//! `<final_answer>`. A final answer wins over an action when both appear.
//! Text with no tags at all is treated as a thought.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use agent_mesh_core::{Error, Proposal};

static THOUGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<thought>(.*?)</thought>").expect("thought regex is valid"));
static ACTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<action>(.*?)</action>").expect("action regex is valid"));
static FINAL_ANSWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<final_answer>(.*?)</final_answer>").expect("final answer regex is valid")
});
static CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^(\w+)\s*\((.*)\)$").expect("call regex is valid"));
static CALL_ARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)\s*=\s*([^,]+)").expect("call argument regex is valid"));

fn capture(regex: &Regex, text: &str) -> Option<String> {
    regex
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Turn a model reply into a proposal.
pub fn parse_response(text: &str) -> Result<Proposal, Error> {
    let text = text.trim();
    let thought = capture(&THOUGHT, text).filter(|t| !t.is_empty());

    let proposal = if let Some(answer) = capture(&FINAL_ANSWER, text) {
        Proposal::final_answer(answer)
    } else if let Some(body) = capture(&ACTION, text) {
        let (name, args) = parse_action(&body)?;
        Proposal::tool(name, args)
    } else if text.is_empty() {
        return Err(Error::InvalidProposal("empty response".into()));
    } else {
        return Ok(Proposal::thinking(thought.unwrap_or_else(|| text.to_string())));
    };

    Ok(match thought {
        Some(thought) => proposal.with_thought(thought),
        None => proposal,
    })
}

/// Parse an `<action>` body: `{"tool": ..., "args": {...}}`, `name(k=v, ...)`
/// or a bare tool name.
fn parse_action(body: &str) -> Result<(String, Value), Error> {
    if body.starts_with('{') {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| Error::InvalidProposal(format!("action is not valid JSON: {e}")))?;
        let name = value
            .get("tool")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidProposal("action is missing \"tool\"".into()))?;
        let args = value
            .get("args")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        return Ok((name.to_string(), args));
    }

    if let Some(call) = CALL.captures(body) {
        let mut args = Map::new();
        for arg in CALL_ARG.captures_iter(&call[2]) {
            let value = arg[2].trim().trim_matches(|c: char| c == '"' || c == '\'');
            args.insert(arg[1].to_string(), Value::String(value.to_string()));
        }
        return Ok((call[1].to_string(), Value::Object(args)));
    }

    if !body.is_empty() && body.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Ok((body.to_string(), Value::Object(Map::new())));
    }

    Err(Error::InvalidProposal(format!("unrecognised action: {body}")))
}
