//! Mock Run 服务（用于测试，无需 API）
//!
//! 按脚本依次返回 run 状态：脚本只剩最后一步时停留在该步（可模拟「永远 in_progress」或
//! 「永远 requires_action」）；run 第一次被观察到 completed 时，把预设回复追加到 thread。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::RunError;
use crate::llm::{
    AssistantRef, AssistantSpec, ContentPart, CreateRun, FilePurpose, NewMessage, RequestedToolCall,
    RunFailure, RunService, RunSnapshot, RunStatus, ThreadMessage, ToolOutput,
};
use crate::memory::Role;

/// 脚本中的一步：状态 + （requires_action 时的）工具调用 + （failed 时的）错误
#[derive(Clone, Debug)]
pub struct MockRunStep {
    pub status: RunStatus,
    pub tool_calls: Vec<RequestedToolCall>,
    pub last_error: Option<RunFailure>,
}

impl MockRunStep {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status,
            tool_calls: Vec::new(),
            last_error: None,
        }
    }

    pub fn requires_action(calls: Vec<RequestedToolCall>) -> Self {
        Self {
            status: RunStatus::RequiresAction,
            tool_calls: calls,
            last_error: None,
        }
    }

    /// 单个工具调用的 requires_action
    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        Self::requires_action(vec![RequestedToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }])
    }

    pub fn failed(code: &str, message: &str) -> Self {
        Self {
            status: RunStatus::Failed,
            tool_calls: Vec::new(),
            last_error: Some(RunFailure {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    assistants: Vec<AssistantSpec>,
    threads: HashMap<String, Vec<ThreadMessage>>,
    uploads: Vec<(String, FilePurpose)>,
    runs: Vec<CreateRun>,
    script: VecDeque<MockRunStep>,
    retrieve_calls: usize,
    submissions: Vec<Vec<ToolOutput>>,
    reply: Option<String>,
    replied_runs: Vec<String>,
}

impl MockState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }

    fn current_step(&mut self) -> MockRunStep {
        let step = if self.script.len() > 1 {
            self.script.pop_front()
        } else {
            self.script.front().cloned()
        };
        step.unwrap_or_else(|| MockRunStep::status(RunStatus::Completed))
    }
}

/// Mock 服务：脚本化的 run 状态 + 计数器，便于断言编排行为
#[derive(Default)]
pub struct MockRunService {
    state: Mutex<MockState>,
}

impl MockRunService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置 run 状态脚本（retrieve_run 依次消费）
    pub fn with_script(self, steps: Vec<MockRunStep>) -> Self {
        self.lock().script = steps.into();
        self
    }

    /// 设置 run 完成后 assistant 的回复文本
    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.lock().reply = Some(text.into());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn assistants_created(&self) -> Vec<AssistantSpec> {
        self.lock().assistants.clone()
    }

    pub fn threads_created(&self) -> usize {
        self.lock().threads.len()
    }

    pub fn runs_created(&self) -> Vec<CreateRun> {
        self.lock().runs.clone()
    }

    pub fn retrieve_count(&self) -> usize {
        self.lock().retrieve_calls
    }

    pub fn submissions(&self) -> Vec<Vec<ToolOutput>> {
        self.lock().submissions.clone()
    }

    /// 已上传的文件名（按上传顺序）
    pub fn uploads(&self) -> Vec<String> {
        self.lock().uploads.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn upload_purposes(&self) -> Vec<FilePurpose> {
        self.lock().uploads.iter().map(|(_, purpose)| *purpose).collect()
    }

    /// thread 中的消息（按发送顺序）
    pub fn thread_messages(&self, thread_id: &str) -> Vec<ThreadMessage> {
        self.lock().threads.get(thread_id).cloned().unwrap_or_default()
    }
}

fn snapshot(run_id: &str, thread_id: &str, step: MockRunStep) -> RunSnapshot {
    RunSnapshot {
        id: run_id.to_string(),
        thread_id: thread_id.to_string(),
        status: step.status,
        tool_calls: step.tool_calls,
        last_error: step.last_error,
    }
}

fn unknown_thread(thread_id: &str) -> RunError {
    RunError::Service {
        status: 404,
        message: format!("No thread found with id '{}'", thread_id),
    }
}

#[async_trait]
impl RunService for MockRunService {
    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<AssistantRef, RunError> {
        let mut state = self.lock();
        let id = state.next("asst");
        state.assistants.push(spec.clone());
        Ok(AssistantRef {
            id,
            model: spec.model.clone(),
        })
    }

    async fn create_thread(&self) -> Result<String, RunError> {
        let mut state = self.lock();
        let id = state.next("thread");
        state.threads.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn upload_file(
        &self,
        file_name: &str,
        _bytes: Vec<u8>,
        purpose: FilePurpose,
    ) -> Result<String, RunError> {
        let mut state = self.lock();
        let id = state.next("file");
        state.uploads.push((file_name.to_string(), purpose));
        Ok(id)
    }

    async fn post_message(&self, thread_id: &str, message: &NewMessage) -> Result<String, RunError> {
        let mut state = self.lock();
        let id = state.next("msg");
        let mut content = vec![ContentPart::Text(message.content.clone())];
        content.extend(message.file_ids.iter().map(|f| ContentPart::Image {
            file_id: f.clone(),
        }));
        state
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| unknown_thread(thread_id))?
            .push(ThreadMessage {
                id: id.clone(),
                role: message.role,
                content,
            });
        Ok(id)
    }

    async fn create_run(&self, request: &CreateRun) -> Result<RunSnapshot, RunError> {
        let mut state = self.lock();
        if !state.threads.contains_key(&request.thread_id) {
            return Err(unknown_thread(&request.thread_id));
        }
        let id = state.next("run");
        state.runs.push(request.clone());
        Ok(snapshot(
            &id,
            &request.thread_id,
            MockRunStep::status(RunStatus::Queued),
        ))
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, RunError> {
        let mut state = self.lock();
        state.retrieve_calls += 1;
        let step = state.current_step();

        if step.status == RunStatus::Completed
            && !state.replied_runs.iter().any(|r| r == run_id)
        {
            if let Some(reply) = state.reply.clone() {
                let id = state.next("msg");
                state
                    .threads
                    .get_mut(thread_id)
                    .ok_or_else(|| unknown_thread(thread_id))?
                    .push(ThreadMessage {
                        id,
                        role: Role::Assistant,
                        content: vec![ContentPart::Text(reply)],
                    });
            }
            state.replied_runs.push(run_id.to_string());
        }

        Ok(snapshot(run_id, thread_id, step))
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunSnapshot, RunError> {
        let mut state = self.lock();
        state.submissions.push(outputs.to_vec());
        Ok(snapshot(
            run_id,
            thread_id,
            MockRunStep::status(RunStatus::Queued),
        ))
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        before: Option<&str>,
    ) -> Result<Vec<ThreadMessage>, RunError> {
        let state = self.lock();
        let messages = state
            .threads
            .get(thread_id)
            .ok_or_else(|| unknown_thread(thread_id))?;
        let start = match before {
            Some(cursor) => messages
                .iter()
                .position(|m| m.id == cursor)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        Ok(messages[start..].iter().rev().cloned().collect())
    }
}
