//! Run 编排器：会话幂等创建、消息投递、轮询 / 工具调度循环
//!
//! 一次 schedule 的流程：
//! 1. ensure_conversation：按 (process_id, thread_id) 查找会话记录，没有则创建远端 assistant + thread 并落库
//! 2. post_messages：按顺序投递用户消息，最后一条携带附件
//! 3. dispatch：构建工具注册表 → 创建 run → 轮询到稳定状态 →
//!    requires_action 时执行工具、记录结果、批量回传；completed 时解析最新回复
//!
//! 所有状态都以轮询观察为准；每次等待都受 max_wait_time 约束，工具轮数受 max_tool_iterations 约束。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::RunSettings;
use crate::core::output::extract_answer;
use crate::core::poll::Clock;
use crate::core::thread::ConversationThread;
use crate::core::{CallContext, RunError};
use crate::llm::{
    AssistantSpec, BuiltinTool, CreateRun, FilePurpose, NewMessage, RequestedToolCall, RunService,
    RunSnapshot, RunStatus, ToolManifestEntry, ToolOutput,
};
use crate::memory::{ConversationRecord, ConversationStore, Message, PromptMessage, ToolCallRecord};
use crate::tools::{LogicUnit, ToolExecutor, ToolRegistry};

/// 会话首次创建时使用的按键互斥锁
type CreationLocks = Mutex<HashMap<CallContext, Arc<Mutex<()>>>>;

/// Run 编排器：持有远端服务、会话存储、工具提供者与运行参数
pub struct RunOrchestrator {
    service: Arc<dyn RunService>,
    store: Arc<dyn ConversationStore>,
    units: Vec<Arc<dyn LogicUnit>>,
    settings: RunSettings,
    clock: Arc<dyn Clock>,
    executor: ToolExecutor,
    cancel_token: CancellationToken,
    creation_locks: CreationLocks,
}

impl RunOrchestrator {
    pub(crate) fn from_parts(
        service: Arc<dyn RunService>,
        store: Arc<dyn ConversationStore>,
        units: Vec<Arc<dyn LogicUnit>>,
        settings: RunSettings,
        clock: Arc<dyn Clock>,
        executor: ToolExecutor,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            service,
            store,
            units,
            settings,
            clock,
            executor,
            cancel_token,
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// 取消令牌：触发后正在进行的轮询以 Aborted 结束
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 已注册的工具提供者（按注册顺序）
    pub fn logic_units(&self) -> &[Arc<dyn LogicUnit>] {
        &self.units
    }

    /// 按名称查找工具提供者
    pub fn locate_unit(&self, name: &str) -> Result<Arc<dyn LogicUnit>, RunError> {
        self.units
            .iter()
            .find(|unit| unit.name() == name)
            .cloned()
            .ok_or_else(|| RunError::Configuration(format!("could not locate logic unit '{}'", name)))
    }

    fn builtin_tools(&self) -> Vec<BuiltinTool> {
        let mut tools = Vec::new();
        if self.settings.enable_retrieval {
            tools.push(BuiltinTool::Retrieval);
        }
        if self.settings.enable_code_interpreter {
            tools.push(BuiltinTool::CodeInterpreter);
        }
        tools
    }

    async fn creation_lock(&self, context: &CallContext) -> Arc<Mutex<()>> {
        self.creation_locks
            .lock()
            .await
            .entry(context.clone())
            .or_default()
            .clone()
    }

    /// 没有其它等待者时移除该键的锁（map 一份 + 调用方一份）
    async fn release_creation_lock(&self, context: &CallContext, lock: &Arc<Mutex<()>>) {
        let mut locks = self.creation_locks.lock().await;
        if Arc::strong_count(lock) == 2 {
            locks.remove(context);
        }
    }

    #[cfg(test)]
    async fn creation_lock_count(&self) -> usize {
        self.creation_locks.lock().await.len()
    }

    /// 确保上下文绑定了远端 assistant 与 thread
    ///
    /// 已有记录时原样返回（不访问远端）；否则创建 assistant（模型、指令、附件、内置能力）与 thread 并落库。
    /// 同进程内的并发首次访问按键串行；跨进程的竞争由存储的 insert-if-absent 兜底，输家沿用赢家的记录。
    pub async fn ensure_conversation(
        &self,
        context: &CallContext,
        instructions: Option<&str>,
        file_ids: &[String],
    ) -> Result<ConversationRecord, RunError> {
        if let Some(record) = self
            .store
            .find_conversation(&context.process_id, context.thread_id())
            .await?
        {
            return Ok(record);
        }

        let lock = self.creation_lock(context).await;
        let result = {
            let _guard = lock.lock().await;
            self.create_conversation_once(context, instructions, file_ids)
                .await
        };
        self.release_creation_lock(context, &lock).await;
        result
    }

    /// 持有按键锁时执行：再查一次，仍不存在才创建远端资源
    async fn create_conversation_once(
        &self,
        context: &CallContext,
        instructions: Option<&str>,
        file_ids: &[String],
    ) -> Result<ConversationRecord, RunError> {
        if let Some(record) = self
            .store
            .find_conversation(&context.process_id, context.thread_id())
            .await?
        {
            return Ok(record);
        }

        if !file_ids.is_empty() && !self.settings.enable_code_interpreter {
            return Err(RunError::Configuration(format!(
                "{} assistant file(s) given but the code interpreter is disabled",
                file_ids.len()
            )));
        }

        let spec = AssistantSpec {
            model: self.settings.model.clone(),
            temperature: self.settings.temperature,
            instructions: instructions.filter(|s| !s.is_empty()).map(String::from),
            file_ids: file_ids.to_vec(),
            builtin_tools: self.builtin_tools(),
        };
        let assistant = self.service.create_assistant(&spec).await?;
        let remote_thread_id = self.service.create_thread().await?;

        let record = self
            .store
            .create_conversation(ConversationRecord::new(context, &assistant.id, &remote_thread_id))
            .await?;
        if record.assistant_id != assistant.id {
            tracing::warn!(
                context = %context,
                discarded_assistant = %assistant.id,
                "Conversation created concurrently elsewhere, using stored record"
            );
        } else {
            tracing::info!(
                context = %context,
                assistant_id = %record.assistant_id,
                model = %assistant.model,
                remote_thread_id = %record.remote_thread_id,
                "Created conversation"
            );
        }
        Ok(record)
    }

    /// 按顺序投递用户消息，最后一条携带附件；返回最后一条消息的 id
    pub async fn post_messages(
        &self,
        remote_thread_id: &str,
        messages: &[String],
        file_ids: Vec<String>,
    ) -> Result<String, RunError> {
        let Some((last, rest)) = messages.split_last() else {
            return Err(RunError::Configuration("no messages to post".to_string()));
        };
        for content in rest {
            self.service
                .post_message(remote_thread_id, &NewMessage::user(content.as_str()))
                .await?;
        }
        self.service
            .post_message(
                remote_thread_id,
                &NewMessage::user(last.as_str()).with_file_ids(file_ids),
            )
            .await
    }

    /// 以该上下文已记录的工具调用重建历史消息
    async fn tool_history(&self, context: &CallContext) -> Result<Vec<Message>, RunError> {
        Ok(self
            .store
            .list_tool_calls(&context.process_id, context.thread_id())
            .await?
            .iter()
            .map(ToolCallRecord::to_message)
            .collect())
    }

    /// 启动 run 并驱动到最终回复
    ///
    /// requires_action 的每一轮：逐个执行工具 → 每个结果落库 → 一次性回传所有输出。
    /// 最多回传 max_tool_iterations 轮，之后仍未结束则 IterationBudgetExceeded。
    pub async fn dispatch(
        &self,
        context: &CallContext,
        record: &ConversationRecord,
        last_message_id: &str,
    ) -> Result<Value, RunError> {
        let history = self.tool_history(context).await?;
        let registry = ToolRegistry::build(&self.units, &history).await?;

        let mut tools = registry.manifest();
        tools.extend(self.builtin_tools().into_iter().map(ToolManifestEntry::Builtin));

        let started = self.clock.now();
        let run = self
            .service
            .create_run(&CreateRun {
                assistant_id: record.assistant_id.clone(),
                thread_id: record.remote_thread_id.clone(),
                tools,
            })
            .await?;
        tracing::info!(
            context = %context,
            run_id = %run.id,
            tools = registry.len(),
            "Run created"
        );

        let max = self.settings.max_tool_iterations;
        let mut iterations = 0;
        while iterations < max {
            let snapshot = self.wait_for_settled(&record.remote_thread_id, &run.id).await?;
            match snapshot.status {
                RunStatus::RequiresAction => {
                    let outputs = self
                        .run_tool_calls(context, record, &registry, &snapshot.tool_calls)
                        .await?;
                    self.service
                        .submit_tool_outputs(&record.remote_thread_id, &run.id, &outputs)
                        .await?;
                    iterations += 1;
                    tracing::info!(
                        run_id = %run.id,
                        outputs = outputs.len(),
                        iteration = iterations,
                        "Submitted tool outputs"
                    );
                }
                RunStatus::Completed => {
                    let messages = self
                        .service
                        .list_messages(&record.remote_thread_id, Some(last_message_id))
                        .await?;
                    let answer = extract_answer(&messages)?;
                    tracing::info!(run_id = %run.id, iterations, "Run completed");
                    return Ok(answer);
                }
                RunStatus::Cancelled => {
                    return Err(RunError::RunCancelled { run_id: run.id });
                }
                RunStatus::Expired => {
                    return Err(RunError::Timeout {
                        run_id: run.id,
                        last_status: RunStatus::Expired,
                        waited: elapsed(self.clock.now(), started),
                    });
                }
                RunStatus::Failed | RunStatus::Incomplete => {
                    return Err(run_failure(snapshot));
                }
                RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling => {
                    return Err(RunError::Timeout {
                        run_id: run.id,
                        last_status: snapshot.status,
                        waited: elapsed(self.clock.now(), started),
                    });
                }
            }
        }

        tracing::warn!(run_id = %run.id, max, "Tool iteration budget exhausted");
        Err(RunError::IterationBudgetExceeded { max })
    }

    /// 按 poll_interval 查询 run 状态，直到进入稳定状态
    ///
    /// 查询次数不超过 floor(max_wait_time / poll_interval) + 1；超出墙钟上限返回 Timeout，
    /// 取消令牌触发时返回 Aborted。
    pub async fn wait_for_settled(
        &self,
        remote_thread_id: &str,
        run_id: &str,
    ) -> Result<RunSnapshot, RunError> {
        let policy = self.settings.poll;
        let attempts = policy.max_attempts();
        let started = self.clock.now();
        let mut last_status = RunStatus::Queued;

        for attempt in 0..attempts {
            if self.cancel_token.is_cancelled() {
                return Err(RunError::Aborted);
            }
            let snapshot = self.service.retrieve_run(remote_thread_id, run_id).await?;
            tracing::debug!(run_id = %run_id, status = %snapshot.status, attempt, "poll");
            if snapshot.status.is_settled() {
                return Ok(snapshot);
            }
            last_status = snapshot.status;

            if attempt + 1 >= attempts || elapsed(self.clock.now(), started) >= policy.max_wait_time {
                break;
            }
            tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(RunError::Aborted),
                _ = self.clock.sleep(policy.poll_interval) => {}
            }
        }

        Err(RunError::Timeout {
            run_id: run_id.to_string(),
            last_status,
            waited: elapsed(self.clock.now(), started),
        })
    }

    async fn run_tool_calls(
        &self,
        context: &CallContext,
        record: &ConversationRecord,
        registry: &ToolRegistry,
        calls: &[RequestedToolCall],
    ) -> Result<Vec<ToolOutput>, RunError> {
        let mut outputs = Vec::with_capacity(calls.len());
        for call in calls {
            let output = self.executor.execute(registry, context, call).await?;
            self.store
                .append_tool_call(ToolCallRecord {
                    process_id: context.process_id.clone(),
                    thread_id: context.thread_id.clone(),
                    assistant_id: record.assistant_id.clone(),
                    remote_thread_id: record.remote_thread_id.clone(),
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    result: output.clone(),
                })
                .await?;
            outputs.push(ToolOutput {
                tool_call_id: call.id.clone(),
                output,
            });
        }
        Ok(outputs)
    }

    /// 设置启动消息：系统提示合并为 assistant 指令（附加 JSON 输出要求），图片作为 assistant 附件
    /// （code_interpreter 资源，未启用时返回 Configuration），用户消息按顺序投递；不启动 run
    pub async fn set_boot_messages(
        &self,
        context: &CallContext,
        prompts: &[PromptMessage],
        output_schema: Option<&Value>,
    ) -> Result<ConversationRecord, RunError> {
        let has_images = prompts.iter().any(|p| matches!(p, PromptMessage::Image { .. }));
        if has_images && !self.settings.enable_code_interpreter {
            return Err(RunError::Configuration(
                "boot images are assistant files and need the code interpreter enabled".to_string(),
            ));
        }

        let mut system = Vec::new();
        let mut users = Vec::new();
        let mut file_ids = Vec::new();
        for prompt in prompts {
            match prompt {
                PromptMessage::System(text) => system.push(text.as_str()),
                PromptMessage::User(text) => users.push(text.as_str()),
                PromptMessage::Image { file_name, bytes } => {
                    let id = self
                        .service
                        .upload_file(file_name, bytes.clone(), FilePurpose::Assistants)
                        .await?;
                    file_ids.push(id);
                }
            }
        }

        let instructions = boot_instructions(&system, output_schema);
        let record = self
            .ensure_conversation(context, Some(&instructions), &file_ids)
            .await?;
        for content in users {
            self.service
                .post_message(&record.remote_thread_id, &NewMessage::user(content))
                .await?;
        }
        Ok(record)
    }

    /// 投递用户消息（图片作为最后一条消息的附件）并运行到最终回复
    ///
    /// 只接受用户文本与图片；系统提示属于 set_boot_messages。没有用户文本时投递一条空消息。
    pub async fn schedule(
        &self,
        context: &CallContext,
        prompts: &[PromptMessage],
    ) -> Result<Value, RunError> {
        if prompts.iter().any(|p| matches!(p, PromptMessage::System(_))) {
            return Err(RunError::Configuration(
                "system prompts must be set with set_boot_messages, not scheduled".to_string(),
            ));
        }

        let mut users = Vec::new();
        let mut file_ids = Vec::new();
        for prompt in prompts {
            match prompt {
                PromptMessage::User(text) => users.push(text.clone()),
                PromptMessage::Image { file_name, bytes } => {
                    let id = self
                        .service
                        .upload_file(file_name, bytes.clone(), FilePurpose::Vision)
                        .await?;
                    file_ids.push(id);
                }
                PromptMessage::System(_) => {}
            }
        }
        if users.is_empty() {
            users.push(String::new());
        }

        let record = self.ensure_conversation(context, None, &[]).await?;
        let last_message_id = self
            .post_messages(&record.remote_thread_id, &users, file_ids)
            .await?;
        self.dispatch(context, &record, &last_message_id).await
    }

    /// 进程的主线程（根上下文）
    pub fn main_thread(self: &Arc<Self>, process_id: &str) -> ConversationThread {
        ConversationThread::new(CallContext::new(process_id), Arc::clone(self))
    }

    /// 同一进程下的新线程（新 thread_id，首次使用时创建远端资源）
    pub fn new_thread(self: &Arc<Self>, process_id: &str) -> ConversationThread {
        ConversationThread::new(CallContext::new(process_id).derive(), Arc::clone(self))
    }

    /// 复制线程：新 thread_id 绑定同一组远端资源，并继承工具调用历史；源线程尚无会话时等同于 new_thread
    pub async fn clone_thread(
        self: &Arc<Self>,
        context: &CallContext,
    ) -> Result<ConversationThread, RunError> {
        let target = context.derive();
        if let Some(record) = self
            .store
            .find_conversation(&context.process_id, context.thread_id())
            .await?
        {
            self.store.create_conversation(record.rebind(&target)).await?;
            for call in self
                .store
                .list_tool_calls(&context.process_id, context.thread_id())
                .await?
            {
                self.store.append_tool_call(call.rebind(&target)).await?;
            }
            tracing::info!(source = %context, target = %target, "Cloned conversation");
        }
        Ok(ConversationThread::new(target, Arc::clone(self)))
    }
}

fn elapsed(now: Instant, started: Instant) -> std::time::Duration {
    now.saturating_duration_since(started)
}

fn run_failure(snapshot: RunSnapshot) -> RunError {
    let (code, message) = match snapshot.last_error {
        Some(failure) => (failure.code, failure.message),
        None => (
            snapshot.status.as_str().to_string(),
            format!("run ended with status {}", snapshot.status),
        ),
    };
    let err = RunError::RunFailed {
        run_id: snapshot.id,
        code,
        message,
    };
    if err.is_rate_limit() {
        tracing::warn!("Run failed due to rate limiting: {}", err);
    }
    err
}

/// 合并系统提示并附加 JSON 输出要求
pub fn boot_instructions(system: &[&str], output_schema: Option<&Value>) -> String {
    let mut instructions = String::new();
    for text in system {
        instructions.push_str(text);
        instructions.push('\n');
    }
    if let Some(schema) = output_schema {
        instructions.push_str(&format!(
            "\nYour response MUST be valid JSON satisfying the following schema:\n{}.",
            schema
        ));
    }
    instructions.push_str("\nOnly reply with JSON and no other text.\n");
    instructions
}
