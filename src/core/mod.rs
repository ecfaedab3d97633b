//! 核心编排层：调用上下文、错误、轮询策略、回复解析、编排器与线程句柄

pub mod builder;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod poll;
pub mod thread;

pub use builder::{create_orchestrator, load_config_or_default, OrchestratorBuilder};
pub use context::CallContext;
pub use error::RunError;
pub use orchestrator::{boot_instructions, RunOrchestrator};
pub use output::{extract_answer, parse_answer};
pub use poll::{Clock, ManualClock, PollPolicy, TokioClock};
pub use thread::ConversationThread;
