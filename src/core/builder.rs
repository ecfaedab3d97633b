//! 编排器构建器：统一的初始化逻辑
//!
//! 测试直接注入 Mock 服务与虚拟时钟；二进制与上层应用用 create_orchestrator 从配置装配
//! OpenAI 服务与会话存储。

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, RunSettings};
use crate::core::poll::{Clock, TokioClock};
use crate::core::RunOrchestrator;
use crate::llm::{OpenAiRunService, RunService};
use crate::memory::{create_conversation_store, ConversationStore};
use crate::tools::{LogicUnit, ToolExecutor};

/// 编排器构建器：服务与存储必填，其余有默认值
pub struct OrchestratorBuilder {
    service: Arc<dyn RunService>,
    store: Arc<dyn ConversationStore>,
    units: Vec<Arc<dyn LogicUnit>>,
    settings: RunSettings,
    clock: Arc<dyn Clock>,
    executor: ToolExecutor,
    cancel_token: CancellationToken,
}

impl OrchestratorBuilder {
    pub fn new(service: Arc<dyn RunService>, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            service,
            store,
            units: Vec::new(),
            settings: RunSettings::default(),
            clock: Arc::new(TokioClock),
            executor: ToolExecutor::default(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// 注册一个工具提供者（注册顺序即构建注册表时的询问顺序）
    pub fn with_unit(mut self, unit: impl LogicUnit + 'static) -> Self {
        self.units.push(Arc::new(unit));
        self
    }

    pub fn with_units(mut self, units: Vec<Arc<dyn LogicUnit>>) -> Self {
        self.units.extend(units);
        self
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 替换时钟（测试用 ManualClock）
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tool_timeout_secs(mut self, secs: u64) -> Self {
        self.executor = ToolExecutor::new(secs);
        self
    }

    /// 共享外部取消令牌（如 Ctrl+C 处理）
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn build(self) -> Arc<RunOrchestrator> {
        Arc::new(RunOrchestrator::from_parts(
            self.service,
            self.store,
            self.units,
            self.settings,
            self.clock,
            self.executor,
            self.cancel_token,
        ))
    }
}

/// 根据配置装配：OpenAI 服务 + 会话存储（sqlite 或内存）+ 运行参数
pub async fn create_orchestrator(
    config: &AppConfig,
    units: Vec<Arc<dyn LogicUnit>>,
) -> Arc<RunOrchestrator> {
    tracing::info!(model = %config.llm.model, "Using OpenAI Assistants service");
    let service: Arc<dyn RunService> = Arc::new(OpenAiRunService::from_config(&config.llm));
    let store = create_conversation_store(config.store.db_path.as_deref()).await;

    OrchestratorBuilder::new(service, store)
        .with_units(units)
        .with_settings(RunSettings::from_config(config))
        .with_tool_timeout_secs(config.tools.tool_timeout_secs)
        .build()
}

/// 便捷函数：加载配置（失败时用默认值）
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    })
}
