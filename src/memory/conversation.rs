//! 对话消息：角色与历史消息
//!
//! 编排器把持久化的工具调用记录还原为 Tool 角色的消息，交给 LogicUnit 决定本轮暴露哪些工具。

use serde::{Deserialize, Serialize};

/// 消息角色（与远端 API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// 单条消息；Tool 消息额外带 tool_call_id 与工具名
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            name: None,
        }
    }

    /// 工具结果消息：content 为序列化后的工具输出
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: result.into(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }
}

/// 用户输入的一段 prompt：系统提示、用户文本或图片附件
#[derive(Clone, Debug, PartialEq)]
pub enum PromptMessage {
    System(String),
    User(String),
    Image { file_name: String, bytes: Vec<u8> },
}

impl PromptMessage {
    pub fn system(text: impl Into<String>) -> Self {
        PromptMessage::System(text.into())
    }

    pub fn user(text: impl Into<String>) -> Self {
        PromptMessage::User(text.into())
    }

    pub fn image(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        PromptMessage::Image {
            file_name: file_name.into(),
            bytes,
        }
    }
}
