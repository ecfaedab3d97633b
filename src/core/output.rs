//! 最终回复提取与解析
//!
//! 取最新一条回复，按顺序拼接文本片段（非文本片段忽略），去掉模型可能包裹的 ```json 围栏，
//! 再解析为 JSON；失败时带原始文本返回 MalformedResponse。

use serde_json::Value;

use crate::core::RunError;
use crate::llm::{ContentPart, ThreadMessage};

/// 按顺序拼接消息中的文本片段，每段以换行结尾；图片等非文本片段跳过
pub fn collect_text(message: &ThreadMessage) -> String {
    let mut content = String::new();
    for part in &message.content {
        match part {
            ContentPart::Text(text) => {
                content.push_str(text);
                content.push('\n');
            }
            ContentPart::Image { file_id } => {
                tracing::warn!(message_id = %message.id, file_id = %file_id, "Ignoring image content in final answer");
            }
            ContentPart::Other { kind } => {
                tracing::warn!(message_id = %message.id, kind = %kind, "Ignoring non-text content in final answer");
            }
        }
    }
    content
}

/// 去掉首尾的 Markdown 代码围栏（```json / ``` 均可）
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // 围栏首行可能带语言标记
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// 解析文本为结构化数据
pub fn parse_answer(text: &str) -> Result<Value, RunError> {
    let payload = strip_code_fence(text);
    serde_json::from_str(payload).map_err(|e| RunError::MalformedResponse {
        raw: text.to_string(),
        reason: e.to_string(),
    })
}

/// 从新到旧排列的消息中取最新一条并解析
pub fn extract_answer(messages: &[ThreadMessage]) -> Result<Value, RunError> {
    let latest = messages.first().ok_or_else(|| RunError::MalformedResponse {
        raw: String::new(),
        reason: "run completed without a reply message".to_string(),
    })?;
    parse_answer(&collect_text(latest))
}
