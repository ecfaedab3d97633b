//! runweave - 远端 Assistants Run 编排与工具调度
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 调用上下文、错误、轮询策略、编排器与线程句柄
//! - **llm**: Run 服务抽象与实现（OpenAI Assistants / Mock）
//! - **memory**: 消息类型、会话记录与工具调用日志的存储
//! - **observability**: tracing 日志初始化
//! - **tools**: Tool / LogicUnit 契约、注册表与执行器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;

pub use crate::core::{CallContext, ConversationThread, OrchestratorBuilder, RunError, RunOrchestrator};
