//! LLM 层：Assistants Run 服务抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockRunService, MockRunStep};
pub use openai::OpenAiRunService;
pub use traits::{
    AssistantRef, AssistantSpec, BuiltinTool, ContentPart, CreateRun, FilePurpose, NewMessage,
    RequestedToolCall, RunFailure, RunService, RunSnapshot, RunStatus, ThreadMessage,
    ToolManifestEntry, ToolOutput,
};
