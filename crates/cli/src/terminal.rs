//! Terminal front-end: approval prompts and event rendering.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::debug;

use agent_mesh_core::{
    ApprovalRequest, ApprovalResponse, InputSource, PendingApproval, RunStatus, RuntimeEvent,
    RuntimeEventKind, Step, ToolOutcome,
};

/// Map an operator's reply. `None` when the reply is not understood.
///
/// `y`/`yes` approves, `n`/`no` rejects, `c`/`cancel` cancels the run and
/// `m <new content>` replaces the proposal.
pub fn parse_decision(line: &str, allow_modification: bool) -> Option<ApprovalResponse> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    match word.to_lowercase().as_str() {
        "y" | "yes" if rest.is_empty() => Some(ApprovalResponse::Approve),
        "n" | "no" if rest.is_empty() => Some(ApprovalResponse::Reject),
        "c" | "cancel" if rest.is_empty() => Some(ApprovalResponse::Cancel),
        "m" | "modify" if allow_modification && !rest.is_empty() => Some(ApprovalResponse::Modify {
            new_content: rest.to_string(),
        }),
        _ => None,
    }
}

pub fn render_request(request: &ApprovalRequest) -> String {
    let prompt = request.prompt();
    let mut text = format!(
        "\n[approval needed: {}] {}\n",
        prompt.kind, prompt.reason
    );
    if !prompt.proposed_content.is_empty() {
        text.push_str(&format!("  proposal: {}\n", prompt.proposed_content));
    }
    let choices = if prompt.allow_modification {
        "y = approve, n = reject, m <text> = modify, c = cancel run"
    } else {
        "y = continue, n = reconsider, c = cancel run"
    };
    text.push_str(&format!(
        "  ({choices}; auto-cancels in {}s)",
        prompt.timeout_seconds
    ));
    text
}

/// One line per interesting event; `None` for the rest.
pub fn render_event(event: &RuntimeEvent) -> Option<String> {
    let session = &event.session_id;
    match &event.kind {
        RuntimeEventKind::RunStarted { source, .. } => match source {
            InputSource::User => None,
            InputSource::Trigger { name } => Some(format!("[{session}] trigger `{name}` fired")),
            InputSource::Message { from } => Some(format!("[{session}] message from {from}")),
        },
        RuntimeEventKind::StepRecorded { step } => match step {
            Step::Thought { text } => Some(format!("[{session}] thinking: {text}")),
            Step::ToolInvocation { name, args } => Some(format!("[{session}] calling {name} {args}")),
            Step::Observation { tool, outcome } => Some(match outcome {
                ToolOutcome::Success { output } => format!("[{session}] {tool} -> {output}"),
                ToolOutcome::Failure { error } => format!("[{session}] {tool} failed: {error}"),
            }),
            Step::FinalAnswer { .. } => None,
        },
        RuntimeEventKind::FinalAnswer { text } => Some(format!("[{session}] {text}")),
        RuntimeEventKind::MessageSent { to } => Some(format!("[{session}] sent a message to {to}")),
        RuntimeEventKind::RunFinished { status, .. } if *status != RunStatus::Done => {
            Some(format!("[{session}] run ended: {status}"))
        }
        _ => None,
    }
}

/// Line-oriented stdin shared by the chat loop and approval prompts.
pub struct Console {
    lines: Lines<BufReader<Stdin>>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    pub fn prompt(&self, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    /// Next line, or `None` at end of input.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    /// Ask until the operator gives a usable answer. End of input cancels.
    pub async fn resolve(&mut self, pending: PendingApproval) -> std::io::Result<()> {
        println!("{}", render_request(&pending.request));
        let response = loop {
            self.prompt("decision> ");
            match self.read_line().await? {
                Some(line) => match parse_decision(&line, pending.request.allow_modification) {
                    Some(response) => break response,
                    None => println!("  not understood: {line:?}"),
                },
                None => break ApprovalResponse::Cancel,
            }
        };
        if pending.reply.send(response).is_err() {
            // The request timed out or the run was cancelled meanwhile.
            debug!(request = %pending.request.id, "Approval answered too late");
            println!("  (request already closed)");
        }
        Ok(())
    }
}
