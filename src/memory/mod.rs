//! 会话记忆：消息角色、会话记录与工具调用日志的存储

pub mod conversation;
pub mod persistent;
pub mod store;

pub use conversation::{Message, PromptMessage, Role};
#[cfg(feature = "async-sqlite")]
pub use persistent::SqliteConversationStore;
pub use store::{
    create_conversation_store, ConversationRecord, ConversationStore, InMemoryConversationStore,
    ToolCallRecord,
};
