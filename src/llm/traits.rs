//! 远端 Run 服务抽象
//!
//! RunService 是与远端推理服务（Assistants 风格：assistant / thread / run）的 RPC 边界。
//! 这里定义的结构化类型与具体线上 JSON 形状解耦：编排逻辑只依赖本文件中的类型，
//! OpenAI 适配器（openai.rs）负责与线上格式互转，Mock（mock.rs）用于测试。

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::RunError;
use crate::memory::Role;

/// Run 状态（由远端驱动，编排器只观察）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Cancelled,
    Failed,
    Expired,
    Incomplete,
}

impl RunStatus {
    /// 稳定状态：轮询到这些状态即停止等待
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::RequiresAction
                | RunStatus::Cancelled
                | RunStatus::Failed
                | RunStatus::Expired
                | RunStatus::Incomplete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Expired => "expired",
            RunStatus::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 远端请求执行的一次工具调用；arguments 为序列化后的 JSON 字符串
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// run 失败时远端给出的错误码与信息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub code: String,
    pub message: String,
}

/// 一次 retrieve / create / submit 后观察到的 run 快照
#[derive(Clone, Debug, PartialEq)]
pub struct RunSnapshot {
    pub id: String,
    pub thread_id: String,
    pub status: RunStatus,
    /// 仅在 RequiresAction 时非空
    pub tool_calls: Vec<RequestedToolCall>,
    pub last_error: Option<RunFailure>,
}

/// 回传给 run 的单个工具输出
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// 上传文件的用途
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilePurpose {
    /// assistant 级附件（code_interpreter 等工具资源）
    Assistants,
    /// 消息中的图片内容
    Vision,
}

impl FilePurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            FilePurpose::Assistants => "assistants",
            FilePurpose::Vision => "vision",
        }
    }
}

/// 远端内置能力（检索、代码执行）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinTool {
    Retrieval,
    CodeInterpreter,
}

/// 创建 run / assistant 时附带的工具清单条目
#[derive(Clone, Debug, PartialEq)]
pub enum ToolManifestEntry {
    Function {
        name: String,
        description: String,
        parameters: Value,
    },
    Builtin(BuiltinTool),
}

/// 创建远端 assistant 的参数
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AssistantSpec {
    pub model: String,
    pub temperature: Option<f32>,
    pub instructions: Option<String>,
    pub file_ids: Vec<String>,
    pub builtin_tools: Vec<BuiltinTool>,
}

/// 远端 assistant 的引用（只保存编排需要的字段）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssistantRef {
    pub id: String,
    pub model: String,
}

/// 发往远端 thread 的新消息
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub file_ids: Vec<String>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            file_ids: Vec::new(),
        }
    }

    pub fn with_file_ids(mut self, file_ids: Vec<String>) -> Self {
        self.file_ids = file_ids;
        self
    }
}

/// 创建 run 的请求
#[derive(Clone, Debug, PartialEq)]
pub struct CreateRun {
    pub assistant_id: String,
    pub thread_id: String,
    /// 为空时沿用 assistant 自身的工具配置
    pub tools: Vec<ToolManifestEntry>,
}

/// 消息内容片段：文本或非文本（图片等）
#[derive(Clone, Debug, PartialEq)]
pub enum ContentPart {
    Text(String),
    Image { file_id: String },
    Other { kind: String },
}

/// 远端 thread 中的一条消息，content 保持远端顺序
#[derive(Clone, Debug, PartialEq)]
pub struct ThreadMessage {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentPart>,
}

/// 远端 Run 服务：assistant / thread / message / run 的最小操作集
///
/// 每个操作都可能以 Transport / RateLimited / Service 失败；实现方不做重试。
#[async_trait]
pub trait RunService: Send + Sync {
    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<AssistantRef, RunError>;

    /// 创建空 thread，返回远端 thread id
    async fn create_thread(&self) -> Result<String, RunError>;

    /// 上传附件，返回 file id；purpose 决定文件能挂在哪里（assistant 资源或消息图片）
    async fn upload_file(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        purpose: FilePurpose,
    ) -> Result<String, RunError>;

    /// 追加一条消息，返回远端 message id
    async fn post_message(&self, thread_id: &str, message: &NewMessage) -> Result<String, RunError>;

    async fn create_run(&self, request: &CreateRun) -> Result<RunSnapshot, RunError>;

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, RunError>;

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunSnapshot, RunError>;

    /// 列出比 before 更新的消息，按新到旧排序；before 为 None 时列出全部
    async fn list_messages(
        &self,
        thread_id: &str,
        before: Option<&str>,
    ) -> Result<Vec<ThreadMessage>, RunError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settled_states() {
        assert!(!RunStatus::Queued.is_settled());
        assert!(!RunStatus::InProgress.is_settled());
        assert!(!RunStatus::Cancelling.is_settled());
        assert!(RunStatus::RequiresAction.is_settled());
        assert!(RunStatus::Completed.is_settled());
        assert!(RunStatus::Cancelled.is_settled());
        assert!(RunStatus::Failed.is_settled());
        assert!(RunStatus::Expired.is_settled());
    }

    #[test]
    fn test_status_wire_names() {
        let status: RunStatus = serde_json::from_str("\"requires_action\"").unwrap();
        assert_eq!(status, RunStatus::RequiresAction);
        assert_eq!(RunStatus::InProgress.to_string(), "in_progress");
    }
}
