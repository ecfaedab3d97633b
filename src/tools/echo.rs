//! Echo 工具（测试与本地联调用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::CallContext;
use crate::tools::{parameters_schema_for, Tool};

#[derive(Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back to the caller."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<EchoArgs>()
    }

    async fn execute(&self, _context: &CallContext, args: Value) -> Result<Value, String> {
        let args: EchoArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        Ok(Value::String(args.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_returns_text() {
        let out = EchoTool
            .execute(&CallContext::new("p1"), serde_json::json!({ "text": "hi" }))
            .await
            .unwrap();
        assert_eq!(out, Value::String("hi".to_string()));
    }

    #[tokio::test]
    async fn test_echo_rejects_missing_text() {
        let err = EchoTool
            .execute(&CallContext::new("p1"), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.contains("text"));
    }
}
