//! OpenAI Assistants 兼容 API 客户端
//!
//! 通过 reqwest 调用 Assistants v2 REST 端点（assistants / threads / messages / runs / files），
//! 端点地址与鉴权头来自 async_openai 的 OpenAIConfig（可配置 base_url，兼容自建代理）。
//! 线上 JSON 只在本文件内出现，对外统一转换为 llm::traits 中的结构化类型。

use std::time::Duration;

use async_openai::config::{Config, OpenAIConfig};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::LlmSection;
use crate::core::RunError;
use crate::llm::{
    AssistantRef, AssistantSpec, BuiltinTool, ContentPart, CreateRun, FilePurpose, NewMessage,
    RequestedToolCall, RunFailure, RunService, RunSnapshot, RunStatus, ThreadMessage,
    ToolManifestEntry, ToolOutput,
};
use crate::memory::Role;

/// 每页最多拉取的消息数（只需要最新几条）
const MESSAGE_PAGE_LIMIT: u32 = 20;

/// OpenAI Assistants 客户端：持有 OpenAIConfig 与带超时的 HTTP Client
pub struct OpenAiRunService {
    config: OpenAIConfig,
    http: reqwest::Client,
}

impl OpenAiRunService {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>, request_timeout_secs: u64) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout, using defaults: {}", e);
                reqwest::Client::new()
            });

        Self { config, http }
    }

    /// 按 [llm] 段构建；API Key 从 api_key_env 指定的环境变量读取
    pub fn from_config(llm: &LlmSection) -> Self {
        let api_key = std::env::var(&llm.api_key_env).ok();
        Self::new(
            llm.base_url.as_deref(),
            api_key.as_deref(),
            llm.request_timeout_secs,
        )
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = self.config.headers();
        headers.insert("OpenAI-Beta", HeaderValue::from_static("assistants=v2"));
        headers
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, RunError> {
        let response = request
            .headers(self.headers())
            .send()
            .await
            .map_err(|e| RunError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body);
            if status.as_u16() == 429 {
                return Err(RunError::RateLimited { message });
            }
            return Err(RunError::Service {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RunError::Transport(e.to_string()))?;
        decode_body(status.as_u16(), &bytes)
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, RunError> {
        self.send(self.http.post(self.config.url(path)).json(body)).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, RunError> {
        self.send(self.http.get(self.config.url(path)).query(query)).await
    }
}

/// 2xx 响应体无法解析属于确定性失败（如未知的 run 状态），按服务端错误上报
fn decode_body<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<T, RunError> {
    serde_json::from_slice(body).map_err(|e| RunError::Service {
        status,
        message: format!("invalid response body: {e}"),
    })
}

/// 服务端错误体形如 {"error": {"message": "..."}}；解析失败时返回原文
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

fn builtin_json(tool: BuiltinTool) -> Value {
    match tool {
        BuiltinTool::Retrieval => json!({ "type": "file_search" }),
        BuiltinTool::CodeInterpreter => json!({ "type": "code_interpreter" }),
    }
}

fn manifest_json(entry: &ToolManifestEntry) -> Value {
    match entry {
        ToolManifestEntry::Function {
            name,
            description,
            parameters,
        } => json!({
            "type": "function",
            "function": {
                "name": name,
                "description": description,
                "parameters": parameters,
            }
        }),
        ToolManifestEntry::Builtin(tool) => builtin_json(*tool),
    }
}

/// assistant 级附件只能作为 code_interpreter 资源；未启用该工具时拒绝，避免附件被悄悄丢弃
fn assistant_body(spec: &AssistantSpec) -> Result<Value, RunError> {
    let mut body = json!({ "model": spec.model });
    if let Some(instructions) = &spec.instructions {
        body["instructions"] = json!(instructions);
    }
    if let Some(temperature) = spec.temperature {
        body["temperature"] = json!(temperature);
    }
    if !spec.builtin_tools.is_empty() {
        body["tools"] = Value::Array(spec.builtin_tools.iter().map(|t| builtin_json(*t)).collect());
    }
    if !spec.file_ids.is_empty() {
        if !spec.builtin_tools.contains(&BuiltinTool::CodeInterpreter) {
            return Err(RunError::Configuration(format!(
                "{} assistant file(s) given but the code interpreter tool is disabled",
                spec.file_ids.len()
            )));
        }
        body["tool_resources"] = json!({ "code_interpreter": { "file_ids": spec.file_ids } });
    }
    Ok(body)
}

fn message_body(message: &NewMessage) -> Value {
    let content = if message.file_ids.is_empty() {
        json!(message.content)
    } else {
        let mut parts = vec![json!({ "type": "text", "text": message.content })];
        parts.extend(message.file_ids.iter().map(|file_id| {
            json!({ "type": "image_file", "image_file": { "file_id": file_id } })
        }));
        Value::Array(parts)
    };
    json!({ "role": message.role.as_str(), "content": content })
}

#[derive(Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Deserialize)]
struct AssistantObject {
    id: String,
    model: String,
}

#[derive(Deserialize)]
struct ListObject<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct MessageObject {
    id: String,
    role: String,
    #[serde(default)]
    content: Vec<Value>,
}

impl MessageObject {
    fn into_message(self) -> ThreadMessage {
        let content = self.content.iter().map(content_part).collect();
        ThreadMessage {
            id: self.id,
            role: Role::parse(&self.role).unwrap_or(Role::Assistant),
            content,
        }
    }
}

fn content_part(value: &Value) -> ContentPart {
    match value["type"].as_str() {
        Some("text") => ContentPart::Text(
            value["text"]["value"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        ),
        Some("image_file") => ContentPart::Image {
            file_id: value["image_file"]["file_id"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        },
        Some(kind) => ContentPart::Other {
            kind: kind.to_string(),
        },
        None => ContentPart::Other {
            kind: "unknown".to_string(),
        },
    }
}

#[derive(Debug, Deserialize)]
struct FunctionObject {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ToolCallObject {
    id: String,
    function: FunctionObject,
}

#[derive(Debug, Deserialize)]
struct SubmitToolOutputsObject {
    tool_calls: Vec<ToolCallObject>,
}

#[derive(Debug, Deserialize)]
struct RequiredActionObject {
    submit_tool_outputs: SubmitToolOutputsObject,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    thread_id: String,
    status: RunStatus,
    #[serde(default)]
    required_action: Option<RequiredActionObject>,
    #[serde(default)]
    last_error: Option<RunFailure>,
}

impl RunObject {
    fn into_snapshot(self) -> RunSnapshot {
        let tool_calls = self
            .required_action
            .map(|action| {
                action
                    .submit_tool_outputs
                    .tool_calls
                    .into_iter()
                    .map(|call| RequestedToolCall {
                        id: call.id,
                        name: call.function.name,
                        arguments: call.function.arguments,
                    })
                    .collect()
            })
            .unwrap_or_default();
        RunSnapshot {
            id: self.id,
            thread_id: self.thread_id,
            status: self.status,
            tool_calls,
            last_error: self.last_error,
        }
    }
}

#[async_trait]
impl RunService for OpenAiRunService {
    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<AssistantRef, RunError> {
        let assistant: AssistantObject = self.post_json("/assistants", &assistant_body(spec)?).await?;
        Ok(AssistantRef {
            id: assistant.id,
            model: assistant.model,
        })
    }

    async fn create_thread(&self) -> Result<String, RunError> {
        let thread: IdObject = self.post_json("/threads", &json!({})).await?;
        Ok(thread.id)
    }

    async fn upload_file(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        purpose: FilePurpose,
    ) -> Result<String, RunError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("purpose", purpose.as_str())
            .part("file", part);
        let file: IdObject = self
            .send(self.http.post(self.config.url("/files")).multipart(form))
            .await?;
        Ok(file.id)
    }

    async fn post_message(&self, thread_id: &str, message: &NewMessage) -> Result<String, RunError> {
        let created: IdObject = self
            .post_json(&format!("/threads/{}/messages", thread_id), &message_body(message))
            .await?;
        Ok(created.id)
    }

    async fn create_run(&self, request: &CreateRun) -> Result<RunSnapshot, RunError> {
        let mut body = json!({ "assistant_id": request.assistant_id });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(manifest_json).collect());
        }
        let run: RunObject = self
            .post_json(&format!("/threads/{}/runs", request.thread_id), &body)
            .await?;
        Ok(run.into_snapshot())
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, RunError> {
        let run: RunObject = self
            .get_json(&format!("/threads/{}/runs/{}", thread_id, run_id), &[])
            .await?;
        Ok(run.into_snapshot())
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunSnapshot, RunError> {
        let run: RunObject = self
            .post_json(
                &format!("/threads/{}/runs/{}/submit_tool_outputs", thread_id, run_id),
                &json!({ "tool_outputs": outputs }),
            )
            .await?;
        Ok(run.into_snapshot())
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        before: Option<&str>,
    ) -> Result<Vec<ThreadMessage>, RunError> {
        let limit = MESSAGE_PAGE_LIMIT.to_string();
        let mut query = vec![("order", "desc"), ("limit", limit.as_str())];
        if let Some(cursor) = before {
            query.push(("before", cursor));
        }
        let page: ListObject<MessageObject> = self
            .get_json(&format!("/threads/{}/messages", thread_id), &query)
            .await?;
        Ok(page.data.into_iter().map(MessageObject::into_message).collect())
    }
}
