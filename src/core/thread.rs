//! 会话线程句柄：CallContext + 编排器

use std::sync::Arc;

use serde_json::Value;

use crate::core::{CallContext, RunError, RunOrchestrator};
use crate::memory::{ConversationRecord, PromptMessage};

/// 绑定到编排器的线程；可廉价克隆，在任务间传递
#[derive(Clone)]
pub struct ConversationThread {
    context: CallContext,
    orchestrator: Arc<RunOrchestrator>,
}

impl ConversationThread {
    pub fn new(context: CallContext, orchestrator: Arc<RunOrchestrator>) -> Self {
        Self {
            context,
            orchestrator,
        }
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn orchestrator(&self) -> &Arc<RunOrchestrator> {
        &self.orchestrator
    }

    pub async fn set_boot_messages(
        &self,
        prompts: &[PromptMessage],
        output_schema: Option<&Value>,
    ) -> Result<ConversationRecord, RunError> {
        self.orchestrator
            .set_boot_messages(&self.context, prompts, output_schema)
            .await
    }

    pub async fn schedule(&self, prompts: &[PromptMessage]) -> Result<Value, RunError> {
        self.orchestrator.schedule(&self.context, prompts).await
    }

    /// 复制当前线程（共享远端资源与工具历史）
    pub async fn fork(&self) -> Result<ConversationThread, RunError> {
        self.orchestrator.clone_thread(&self.context).await
    }
}

impl std::fmt::Debug for ConversationThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationThread")
            .field("context", &self.context)
            .finish()
    }
}
