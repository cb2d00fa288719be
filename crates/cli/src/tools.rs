//! Tools available to sessions started from the command line.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use agent_mesh_claude::ToolSpec;
use agent_mesh_core::{Error, ToolExecutor};

#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTools;

impl BuiltinTools {
    pub fn specs() -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("clock", "current UTC time; no args"),
            ToolSpec::new("echo", "returns args.text unchanged"),
        ]
    }
}

#[async_trait]
impl ToolExecutor for BuiltinTools {
    async fn execute(&self, name: &str, args: &Value) -> Result<String, Error> {
        match name {
            "clock" => Ok(Utc::now().to_rfc3339()),
            "echo" => match args {
                Value::String(text) => Ok(text.clone()),
                _ => args
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| Error::Tool("echo needs `text`".into())),
            },
            other => Err(Error::Tool(format!("unknown tool: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_builtins() {
        let tools = BuiltinTools;
        assert_eq!(tools.execute("echo", &json!({"text": "hi"})).await.unwrap(), "hi");
        assert_eq!(tools.execute("echo", &json!("raw")).await.unwrap(), "raw");
        assert!(tools.execute("echo", &json!({})).await.is_err());
        assert!(chrono::DateTime::parse_from_rfc3339(&tools.execute("clock", &json!({})).await.unwrap()).is_ok());
        assert!(matches!(tools.execute("rm", &json!({})).await, Err(Error::Tool(_))));
    }
}
