//! 工具执行器
//!
//! 对远端请求的每个工具调用：按名查找、解析参数、在超时内执行、序列化结果；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::{CallContext, RunError};
use crate::llm::RequestedToolCall;
use crate::tools::ToolRegistry;

/// 工具执行器：对每次调用施加超时，并将失败映射为 RunError
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行一次工具调用并返回序列化后的输出
    ///
    /// 注册表中没有该工具 → Configuration；参数不是合法 JSON 或工具返回 Err → ToolExecutionFailed；
    /// 超时 → ToolTimeout
    pub async fn execute(
        &self,
        registry: &ToolRegistry,
        context: &CallContext,
        call: &RequestedToolCall,
    ) -> Result<String, RunError> {
        let def = registry.get(&call.name).ok_or_else(|| {
            RunError::Configuration(format!(
                "remote run requested tool '{}' which is not registered (available: {:?})",
                call.name,
                registry.tool_names()
            ))
        })?;

        let args = parse_arguments(&call.arguments).map_err(|e| RunError::ToolExecutionFailed {
            tool: call.name.clone(),
            message: format!("invalid arguments: {e}"),
        })?;

        let start = Instant::now();
        let preview = args_preview(&args);
        let result = timeout(self.timeout, def.execute(context, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "tool_call_id": call.id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(value)) => Ok(serialize_result(&value)),
            Ok(Err(e)) => Err(RunError::ToolExecutionFailed {
                tool: call.name.clone(),
                message: e,
            }),
            Err(_) => Err(RunError::ToolTimeout(call.name.clone())),
        }
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new(30)
    }
}

/// 空参数视为空对象
fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
}

/// 字符串结果原样回传，其它值序列化为 JSON
pub fn serialize_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
