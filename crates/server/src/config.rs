//! Runtime configuration stored as TOML.
//!
//! Everything is checked when the file is loaded, before any session starts.
//! A bad trigger or strategy setting is a [`ConfigError`], never a runtime
//! failure.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use agent_mesh_core::{
    ApprovalEngine, KernelConfig, KeywordStrategy, RiskStrategy,
    approval::{DEFAULT_HIGH_RISK_TOOLS, DEFAULT_SENSITIVE_KEYWORDS},
};

use crate::trigger::{CustomTriggers, DeadlineAt, TriggerKind, TriggerSpec};

const DEFAULT_CUSTOM_POLL_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub kernel: KernelConfig,
    pub approval: ApprovalConfig,
    pub presence: PresenceConfig,
    pub triggers: Vec<TriggerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Namespace for every channel and key this process touches.
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            prefix: "agent_mesh".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub enabled: bool,
    /// Defaults to the built-in high-risk tool list.
    pub high_risk_tools: Option<Vec<String>>,
    pub require_final_approval: bool,
    /// Overrides `kernel.checkpoint_interval` when set.
    pub checkpoint_interval: Option<u32>,
    /// Defaults to the built-in sensitive keyword list.
    pub sensitive_keywords: Option<Vec<String>>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_risk_tools: None,
            require_final_approval: false,
            checkpoint_interval: None,
            sensitive_keywords: None,
        }
    }
}

impl ApprovalConfig {
    /// Risk strategy first, then keywords. Checkpoints follow
    /// `kernel.checkpoint_interval`.
    pub fn build_engine(&self, kernel: &KernelConfig) -> ApprovalEngine {
        let tools: Vec<String> = match &self.high_risk_tools {
            Some(tools) => tools.clone(),
            None => DEFAULT_HIGH_RISK_TOOLS.iter().map(|t| t.to_string()).collect(),
        };
        let keywords: Vec<String> = match &self.sensitive_keywords {
            Some(keywords) => keywords.clone(),
            None => DEFAULT_SENSITIVE_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        };
        let engine = ApprovalEngine::new(vec![
            Box::new(RiskStrategy::new(
                tools,
                self.require_final_approval,
                kernel.checkpoint_interval,
            )),
            Box::new(KeywordStrategy::new(keywords)),
        ]);
        if !self.enabled {
            engine.disable();
        }
        engine
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub ttl_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 }
    }
}

fn default_enabled() -> bool {
    true
}

/// One `[[triggers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl TriggerConfig {
    fn message(&self) -> Result<String, ConfigError> {
        match self.params.get("message") {
            Some(Value::String(message)) if !message.trim().is_empty() => Ok(message.clone()),
            Some(_) => Err(invalid(format!(
                "trigger `{}`: `message` must be a non-empty string",
                self.name
            ))),
            None => Err(invalid(format!("trigger `{}`: missing `message`", self.name))),
        }
    }

    fn positive_secs(&self, keys: &[&str]) -> Result<Option<u64>, ConfigError> {
        let Some((key, value)) = keys
            .iter()
            .find_map(|key| self.params.get(*key).map(|v| (*key, v)))
        else {
            return Ok(None);
        };
        match value.as_u64() {
            Some(0) => Err(invalid(format!("trigger `{}`: `{key}` must be > 0", self.name))),
            Some(secs) => Ok(Some(secs)),
            None => Err(invalid(format!(
                "trigger `{}`: `{key}` must be a whole number of seconds",
                self.name
            ))),
        }
    }

    /// Resolve this entry into a startable trigger.
    pub fn to_spec(&self, custom: &CustomTriggers) -> Result<TriggerSpec, ConfigError> {
        let kind = match self.kind.as_str() {
            "interval" => {
                let every = self
                    .positive_secs(&["interval_secs", "interval_seconds"])?
                    .ok_or_else(|| invalid(format!("trigger `{}`: missing `interval_secs`", self.name)))?;
                TriggerKind::Interval {
                    every: Duration::from_secs(every),
                    message: self.message()?,
                }
            }
            "deadline" => {
                let at = match (self.params.get("at"), self.positive_secs(&["after_secs"])?) {
                    (Some(Value::String(at)), None) => {
                        let at = DateTime::parse_from_rfc3339(at).map_err(|e| {
                            invalid(format!("trigger `{}`: bad `at` timestamp: {e}", self.name))
                        })?;
                        DeadlineAt::Absolute(at.with_timezone(&Utc))
                    }
                    (None, Some(secs)) => DeadlineAt::After(Duration::from_secs(secs)),
                    (Some(_), Some(_)) => {
                        return Err(invalid(format!(
                            "trigger `{}`: set either `at` or `after_secs`, not both",
                            self.name
                        )));
                    }
                    (Some(_), None) => {
                        return Err(invalid(format!(
                            "trigger `{}`: `at` must be an RFC 3339 string",
                            self.name
                        )));
                    }
                    (None, None) => {
                        return Err(invalid(format!(
                            "trigger `{}`: missing `at` or `after_secs`",
                            self.name
                        )));
                    }
                };
                TriggerKind::Deadline {
                    at,
                    message: self.message()?,
                }
            }
            "inbox" | "session_inbox" => TriggerKind::InboxListener,
            "custom" => {
                let handler = match self.params.get("handler") {
                    Some(Value::String(handler)) => handler.clone(),
                    _ => {
                        return Err(invalid(format!(
                            "trigger `{}`: missing `handler`",
                            self.name
                        )));
                    }
                };
                if !custom.contains(&handler) {
                    return Err(invalid(format!(
                        "trigger `{}`: unknown custom handler `{handler}` (known: {})",
                        self.name,
                        custom.names().join(", ")
                    )));
                }
                let poll = self
                    .positive_secs(&["poll_secs"])?
                    .unwrap_or(DEFAULT_CUSTOM_POLL_SECS);
                let params = Value::Object(self.params.clone());
                // Let the handler reject its params now rather than at start.
                custom
                    .build(&handler, &params)
                    .map_err(|e| invalid(format!("trigger `{}`: {e}", self.name)))?;
                TriggerKind::Custom {
                    handler,
                    poll: Duration::from_secs(poll),
                    params,
                }
            }
            other => {
                return Err(invalid(format!(
                    "trigger `{}`: unknown type `{other}`",
                    self.name
                )));
            }
        };
        Ok(TriggerSpec::new(self.name.clone(), kind))
    }
}

impl Config {
    pub fn load(path: &Path, custom: &CustomTriggers) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, custom)
    }

    pub fn parse(contents: &str, custom: &CustomTriggers) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        config.kernel = config.kernel_config();
        config.validate(custom)?;
        Ok(config)
    }

    pub fn validate(&self, custom: &CustomTriggers) -> Result<(), ConfigError> {
        if self.redis.url.trim().is_empty() {
            return Err(invalid("redis.url must not be empty"));
        }
        if self.redis.prefix.trim().is_empty() {
            return Err(invalid("redis.prefix must not be empty"));
        }
        if self.kernel.max_iterations == 0 {
            return Err(invalid("kernel.max_iterations must be > 0"));
        }
        if self.kernel.approval_timeout_secs == 0 {
            return Err(invalid("kernel.approval_timeout_secs must be > 0"));
        }
        if self.kernel.tool_timeout_secs == Some(0) {
            return Err(invalid("kernel.tool_timeout_secs must be > 0 when set"));
        }
        if self.presence.ttl_secs == 0 {
            return Err(invalid("presence.ttl_secs must be > 0"));
        }
        if let Some(keywords) = &self.approval.sensitive_keywords {
            if keywords.is_empty() || keywords.iter().any(|k| k.trim().is_empty()) {
                return Err(invalid("approval.sensitive_keywords must be non-empty strings"));
            }
        }
        if let Some(tools) = &self.approval.high_risk_tools {
            if tools.iter().any(|t| t.trim().is_empty()) {
                return Err(invalid("approval.high_risk_tools must not contain empty names"));
            }
        }

        let mut names = HashSet::new();
        for trigger in &self.triggers {
            if trigger.name.trim().is_empty() {
                return Err(invalid("trigger names must not be empty"));
            }
            if !names.insert(trigger.name.as_str()) {
                return Err(invalid(format!("duplicate trigger name `{}`", trigger.name)));
            }
            trigger.to_spec(custom)?;
        }
        Ok(())
    }

    /// Kernel settings with the checkpoint interval resolved against the
    /// `[approval]` section, so the kernel and the risk strategy agree.
    pub fn kernel_config(&self) -> KernelConfig {
        let mut kernel = self.kernel.clone();
        if let Some(interval) = self.approval.checkpoint_interval {
            kernel.checkpoint_interval = interval;
        }
        kernel
    }

    pub fn approval_engine(&self) -> ApprovalEngine {
        self.approval.build_engine(&self.kernel_config())
    }

    /// Enabled triggers, in file order.
    pub fn trigger_specs(&self, custom: &CustomTriggers) -> Result<Vec<TriggerSpec>, ConfigError> {
        self.triggers
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.to_spec(custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_mesh_core::{ApprovalContext, ApprovalKind, Decision, Proposal, RejectionPolicy};

    fn parse(contents: &str) -> Result<Config, ConfigError> {
        Config::parse(contents, &CustomTriggers::with_builtins())
    }

    fn assert_invalid(contents: &str, needle: &str) {
        match parse(contents) {
            Err(ConfigError::Invalid(message)) => {
                assert!(message.contains(needle), "{message:?} does not mention {needle:?}")
            }
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
        assert_eq!(config.redis.prefix, "agent_mesh");
        assert_eq!(config.kernel.max_iterations, 20);
        assert_eq!(config.presence.ttl_secs, 30);
        assert!(config.approval.enabled);
        assert!(config.triggers.is_empty());
    }

    #[test]
    fn test_full_file() {
        let config = parse(
            r#"
            [redis]
            url = "redis://cache:6379/1"
            prefix = "desk"

            [kernel]
            max_iterations = 8
            rejection_policy = "forbid_repeat"
            tool_timeout_secs = 15

            [approval]
            high_risk_tools = ["transfer_funds"]
            checkpoint_interval = 3
            sensitive_keywords = ["delete"]

            [presence]
            ttl_secs = 10

            [[triggers]]
            name = "tick"
            type = "interval"
            params = { interval_secs = 5, message = "check the queue" }

            [[triggers]]
            name = "inbox"
            type = "session_inbox"

            [[triggers]]
            name = "standup"
            type = "deadline"
            enabled = false
            params = { at = "2030-01-01T09:00:00Z", message = "standup" }

            [[triggers]]
            name = "drop"
            type = "custom"
            params = { handler = "file_exists", path = "/tmp/drop", poll_secs = 2 }
            "#,
        )
        .unwrap();

        assert_eq!(config.redis.prefix, "desk");
        assert_eq!(config.kernel.rejection_policy, RejectionPolicy::ForbidRepeat);
        assert_eq!(config.kernel.checkpoint_interval, 3);

        let specs = config.trigger_specs(&CustomTriggers::with_builtins()).unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["tick", "inbox", "drop"]);
        assert_eq!(
            specs[0].kind,
            TriggerKind::Interval {
                every: Duration::from_secs(5),
                message: "check the queue".into()
            }
        );
        assert_eq!(specs[1].kind, TriggerKind::InboxListener);
        assert!(matches!(
            &specs[2].kind,
            TriggerKind::Custom { handler, poll, .. }
                if handler == "file_exists" && *poll == Duration::from_secs(2)
        ));
    }

    #[test]
    fn test_approval_engine_from_config() {
        let config = parse(
            r#"
            [approval]
            high_risk_tools = ["transfer_funds"]
            sensitive_keywords = ["delete"]
            "#,
        )
        .unwrap();
        let engine = config.approval_engine();

        let transfer = ApprovalContext::for_proposal(
            "s1",
            1,
            Proposal::tool("transfer_funds", serde_json::json!({"amount": 100})),
        );
        assert!(matches!(
            engine.evaluate(&transfer),
            Decision::Needed { kind: ApprovalKind::HighRiskAction, .. }
        ));

        let answer = ApprovalContext::for_proposal("s1", 1, Proposal::final_answer("I will delete the file"));
        assert!(engine.evaluate(&answer).is_needed());

        // Defaults no longer apply once lists are given.
        let email = ApprovalContext::for_proposal("s1", 1, Proposal::tool("send_email", serde_json::json!({})));
        assert!(!engine.evaluate(&email).is_needed());
    }

    #[test]
    fn test_checkpoint_interval_has_one_value() {
        let config = parse(
            r#"
            [kernel]
            checkpoint_interval = 4

            [approval]
            checkpoint_interval = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.kernel_config().checkpoint_interval, 3);
        assert_eq!(config.kernel.checkpoint_interval, 3);

        let engine = config.approval_engine();
        assert!(matches!(
            engine.evaluate(&ApprovalContext::checkpoint("s1", 3)),
            Decision::Needed { kind: ApprovalKind::IterationCheckpoint, .. }
        ));
        assert!(!engine.evaluate(&ApprovalContext::checkpoint("s1", 4)).is_needed());

        // Built in code, without going through `parse`.
        let mut config = Config::default();
        config.kernel.checkpoint_interval = 5;
        config.approval.checkpoint_interval = Some(2);
        assert_eq!(config.kernel_config().checkpoint_interval, 2);
        assert!(config.approval_engine().evaluate(&ApprovalContext::checkpoint("s1", 2)).is_needed());

        let config = parse("[kernel]\ncheckpoint_interval = 4").unwrap();
        assert_eq!(config.kernel_config().checkpoint_interval, 4);
        assert!(config.approval_engine().evaluate(&ApprovalContext::checkpoint("s1", 4)).is_needed());
    }

    #[test]
    fn test_disabled_approvals() {
        let config = parse("[approval]\nenabled = false").unwrap();
        let engine = config.approval_engine();
        assert!(!engine.is_enabled());
        let context = ApprovalContext::for_proposal("s1", 1, Proposal::tool("send_email", serde_json::json!({})));
        assert!(!engine.evaluate(&context).is_needed());
    }

    #[test]
    fn test_rejects_bad_triggers() {
        assert_invalid(
            "[[triggers]]\nname = \"x\"\ntype = \"cron\"",
            "unknown type `cron`",
        );
        assert_invalid(
            r#"
            [[triggers]]
            name = "x"
            type = "inbox"
            [[triggers]]
            name = "x"
            type = "inbox"
            "#,
            "duplicate trigger name",
        );
        assert_invalid(
            "[[triggers]]\nname = \"x\"\ntype = \"interval\"\nparams = { interval_secs = 0, message = \"m\" }",
            "must be > 0",
        );
        assert_invalid(
            "[[triggers]]\nname = \"x\"\ntype = \"interval\"\nparams = { interval_secs = 5 }",
            "missing `message`",
        );
        assert_invalid(
            "[[triggers]]\nname = \"x\"\ntype = \"deadline\"\nparams = { at = \"tomorrow\", message = \"m\" }",
            "bad `at` timestamp",
        );
        assert_invalid(
            "[[triggers]]\nname = \"x\"\ntype = \"custom\"\nparams = { handler = \"weather\" }",
            "unknown custom handler `weather`",
        );
        assert_invalid(
            "[[triggers]]\nname = \"x\"\ntype = \"custom\"\nparams = { handler = \"file_exists\" }",
            "missing `path`",
        );
    }

    #[test]
    fn test_rejects_bad_settings() {
        assert_invalid("[presence]\nttl_secs = 0", "ttl_secs");
        assert_invalid("[kernel]\nmax_iterations = 0", "max_iterations");
        assert_invalid("[approval]\nsensitive_keywords = []", "sensitive_keywords");
        assert_invalid("[approval]\nsensitive_keywords = [\"ok\", \" \"]", "sensitive_keywords");
    }

    #[test]
    fn test_parse_and_read_errors() {
        assert!(matches!(parse("[kernel\n"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            Config::load(Path::new("/nonexistent/agent-mesh.toml"), &CustomTriggers::new()),
            Err(ConfigError::Read { .. })
        ));
    }
}
