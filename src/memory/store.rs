//! 会话存储抽象层
//!
//! 以 (process_id, thread_id) 为键保存会话记录（远端 assistant / thread 的绑定）与工具调用日志，
//! 支持内存和持久化两种实现。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::{CallContext, RunError};
use crate::memory::Message;

#[cfg(feature = "async-sqlite")]
use super::persistent::SqliteConversationStore;

/// 会话记录：某个调用上下文绑定的远端 assistant 与 thread（创建后不再修改）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub process_id: String,
    pub thread_id: Option<String>,
    pub assistant_id: String,
    pub remote_thread_id: String,
}

impl ConversationRecord {
    pub fn new(
        context: &CallContext,
        assistant_id: impl Into<String>,
        remote_thread_id: impl Into<String>,
    ) -> Self {
        Self {
            process_id: context.process_id.clone(),
            thread_id: context.thread_id.clone(),
            assistant_id: assistant_id.into(),
            remote_thread_id: remote_thread_id.into(),
        }
    }

    /// 同一组远端资源换绑到另一个上下文（clone_thread 使用）
    pub fn rebind(&self, context: &CallContext) -> Self {
        Self::new(context, self.assistant_id.clone(), self.remote_thread_id.clone())
    }
}

/// 工具调用记录：每次成功执行的工具调用一条，只追加
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub process_id: String,
    pub thread_id: Option<String>,
    pub assistant_id: String,
    pub remote_thread_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    /// 序列化后的工具结果
    pub result: String,
}

impl ToolCallRecord {
    /// 还原为 Tool 角色消息，供 LogicUnit 构建工具时参考
    pub fn to_message(&self) -> Message {
        Message::tool(&self.tool_call_id, &self.tool_name, &self.result)
    }

    pub fn rebind(&self, context: &CallContext) -> Self {
        Self {
            process_id: context.process_id.clone(),
            thread_id: context.thread_id.clone(),
            ..self.clone()
        }
    }
}

/// 会话存储接口
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 按键查找会话记录
    async fn find_conversation(
        &self,
        process_id: &str,
        thread_id: Option<&str>,
    ) -> Result<Option<ConversationRecord>, RunError>;

    /// 不存在时插入；已存在时不覆盖。返回最终生效的那条记录（并发时只有一个赢家）
    async fn create_conversation(
        &self,
        record: ConversationRecord,
    ) -> Result<ConversationRecord, RunError>;

    /// 追加一条工具调用记录
    async fn append_tool_call(&self, record: ToolCallRecord) -> Result<(), RunError>;

    /// 按插入顺序列出工具调用记录（每次调用都从头返回）
    async fn list_tool_calls(
        &self,
        process_id: &str,
        thread_id: Option<&str>,
    ) -> Result<Vec<ToolCallRecord>, RunError>;
}

type StoreKey = (String, Option<String>);

fn store_key(process_id: &str, thread_id: Option<&str>) -> StoreKey {
    (process_id.to_string(), thread_id.map(String::from))
}

/// 内存会话存储（进程内，重启即丢失）
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<StoreKey, ConversationRecord>>,
    tool_calls: RwLock<HashMap<StoreKey, Vec<ToolCallRecord>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前会话记录数
    pub async fn conversation_count(&self) -> usize {
        self.conversations.read().await.len()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn find_conversation(
        &self,
        process_id: &str,
        thread_id: Option<&str>,
    ) -> Result<Option<ConversationRecord>, RunError> {
        let key = store_key(process_id, thread_id);
        Ok(self.conversations.read().await.get(&key).cloned())
    }

    async fn create_conversation(
        &self,
        record: ConversationRecord,
    ) -> Result<ConversationRecord, RunError> {
        let key = store_key(&record.process_id, record.thread_id.as_deref());
        let mut conversations = self.conversations.write().await;
        Ok(conversations.entry(key).or_insert(record).clone())
    }

    async fn append_tool_call(&self, record: ToolCallRecord) -> Result<(), RunError> {
        let key = store_key(&record.process_id, record.thread_id.as_deref());
        self.tool_calls
            .write()
            .await
            .entry(key)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn list_tool_calls(
        &self,
        process_id: &str,
        thread_id: Option<&str>,
    ) -> Result<Vec<ToolCallRecord>, RunError> {
        let key = store_key(process_id, thread_id);
        Ok(self
            .tool_calls
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }
}

/// 创建会话存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用持久化存储；否则使用内存存储
pub async fn create_conversation_store(
    db_path: Option<&std::path::Path>,
) -> Arc<dyn ConversationStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteConversationStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using persistent conversation store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to create persistent store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("Persistent conversation store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory conversation store");
    Arc::new(InMemoryConversationStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_call(ctx: &CallContext, id: &str) -> ToolCallRecord {
        ToolCallRecord {
            process_id: ctx.process_id.clone(),
            thread_id: ctx.thread_id.clone(),
            assistant_id: "asst_1".to_string(),
            remote_thread_id: "thread_1".to_string(),
            tool_call_id: id.to_string(),
            tool_name: "lookup".to_string(),
            result: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_conversation_first_writer_wins() {
        let store = InMemoryConversationStore::new();
        let ctx = CallContext::with_thread("p1", "t1");

        let first = store
            .create_conversation(ConversationRecord::new(&ctx, "asst_a", "thread_a"))
            .await
            .unwrap();
        let second = store
            .create_conversation(ConversationRecord::new(&ctx, "asst_b", "thread_b"))
            .await
            .unwrap();

        assert_eq!(first.assistant_id, "asst_a");
        assert_eq!(second, first);
        assert_eq!(store.conversation_count().await, 1);
    }

    #[tokio::test]
    async fn test_root_and_thread_keys_are_distinct() {
        let store = InMemoryConversationStore::new();
        let root = CallContext::new("p1");
        store
            .create_conversation(ConversationRecord::new(&root, "asst_a", "thread_a"))
            .await
            .unwrap();

        assert!(store.find_conversation("p1", None).await.unwrap().is_some());
        assert!(store.find_conversation("p1", Some("t1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tool_calls_keep_insertion_order() {
        let store = InMemoryConversationStore::new();
        let ctx = CallContext::with_thread("p1", "t1");
        for id in ["call_1", "call_2", "call_3"] {
            store.append_tool_call(tool_call(&ctx, id)).await.unwrap();
        }

        let ids: Vec<_> = store
            .list_tool_calls("p1", Some("t1"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.tool_call_id)
            .collect();
        assert_eq!(ids, vec!["call_1", "call_2", "call_3"]);

        // 可重复读取
        assert_eq!(store.list_tool_calls("p1", Some("t1")).await.unwrap().len(), 3);
        assert!(store.list_tool_calls("p1", None).await.unwrap().is_empty());
    }

    #[test]
    fn test_tool_call_to_message() {
        let ctx = CallContext::new("p1");
        let msg = tool_call(&ctx, "call_9").to_message();
        assert_eq!(msg.role, crate::memory::Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(msg.name.as_deref(), Some("lookup"));
    }
}
