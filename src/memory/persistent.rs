//! 持久化会话存储
//!
//! 使用 SQLite 保存会话记录与工具调用日志，支持跨重启恢复同一逻辑会话的远端绑定

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use sqlx::Row;

use super::store::{ConversationRecord, ConversationStore, ToolCallRecord};
use crate::core::RunError;

/// 根上下文在表中的 thread_id 取值（主键列不能依赖 NULL 去重）
const ROOT_THREAD: &str = "";

fn thread_column(thread_id: Option<&str>) -> &str {
    thread_id.unwrap_or(ROOT_THREAD)
}

fn thread_from_column(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// SQLite 会话存储
pub struct SqliteConversationStore {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqliteConversationStore {
    /// 打开（或创建）数据库并建表
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 初始化数据库表
    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS run_conversations (
                process_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                assistant_id TEXT NOT NULL,
                remote_thread_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (process_id, thread_id)
            )"
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS run_tool_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                process_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                assistant_id TEXT NOT NULL,
                remote_thread_id TEXT NOT NULL,
                tool_call_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                result TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_run_tool_calls_key ON run_tool_calls(process_id, thread_id)"
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn find_conversation(
        &self,
        process_id: &str,
        thread_id: Option<&str>,
    ) -> Result<Option<ConversationRecord>, RunError> {
        let row = sqlx::query(
            "SELECT process_id, thread_id, assistant_id, remote_thread_id
             FROM run_conversations
             WHERE process_id = ? AND thread_id = ?"
        )
        .bind(process_id)
        .bind(thread_column(thread_id))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ConversationRecord {
            process_id: row.get("process_id"),
            thread_id: thread_from_column(row.get("thread_id")),
            assistant_id: row.get("assistant_id"),
            remote_thread_id: row.get("remote_thread_id"),
        }))
    }

    async fn create_conversation(
        &self,
        record: ConversationRecord,
    ) -> Result<ConversationRecord, RunError> {
        let now = chrono::Utc::now().to_rfc3339();

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO run_conversations
             (process_id, thread_id, assistant_id, remote_thread_id, created_at)
             VALUES (?, ?, ?, ?, ?)"
        )
        .bind(&record.process_id)
        .bind(thread_column(record.thread_id.as_deref()))
        .bind(&record.assistant_id)
        .bind(&record.remote_thread_id)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            tracing::debug!(
                process_id = %record.process_id,
                "Conversation already exists, returning stored record"
            );
        }

        self.find_conversation(&record.process_id, record.thread_id.as_deref())
            .await?
            .ok_or_else(|| RunError::Store("conversation vanished after insert".to_string()))
    }

    async fn append_tool_call(&self, record: ToolCallRecord) -> Result<(), RunError> {
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO run_tool_calls
             (process_id, thread_id, assistant_id, remote_thread_id, tool_call_id, tool_name, result, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        )
        .bind(&record.process_id)
        .bind(thread_column(record.thread_id.as_deref()))
        .bind(&record.assistant_id)
        .bind(&record.remote_thread_id)
        .bind(&record.tool_call_id)
        .bind(&record.tool_name)
        .bind(&record.result)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_tool_calls(
        &self,
        process_id: &str,
        thread_id: Option<&str>,
    ) -> Result<Vec<ToolCallRecord>, RunError> {
        let rows = sqlx::query(
            "SELECT process_id, thread_id, assistant_id, remote_thread_id, tool_call_id, tool_name, result
             FROM run_tool_calls
             WHERE process_id = ? AND thread_id = ?
             ORDER BY id ASC"
        )
        .bind(process_id)
        .bind(thread_column(thread_id))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ToolCallRecord {
                process_id: row.get("process_id"),
                thread_id: thread_from_column(row.get("thread_id")),
                assistant_id: row.get("assistant_id"),
                remote_thread_id: row.get("remote_thread_id"),
                tool_call_id: row.get("tool_call_id"),
                tool_name: row.get("tool_name"),
                result: row.get("result"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CallContext;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_conversation_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("runs.db");
        let ctx = CallContext::with_thread("p1", "t1");

        let store = SqliteConversationStore::new(&db_path).await.unwrap();
        let winner = store
            .create_conversation(ConversationRecord::new(&ctx, "asst_a", "thread_a"))
            .await
            .unwrap();
        let loser = store
            .create_conversation(ConversationRecord::new(&ctx, "asst_b", "thread_b"))
            .await
            .unwrap();
        assert_eq!(loser, winner);
        store.close().await;

        let reopened = SqliteConversationStore::new(&db_path).await.unwrap();
        let found = reopened
            .find_conversation("p1", Some("t1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.assistant_id, "asst_a");
        assert_eq!(found.remote_thread_id, "thread_a");
    }

    #[tokio::test]
    async fn test_root_context_and_tool_call_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteConversationStore::new(temp_dir.path().join("runs.db"))
            .await
            .unwrap();
        let root = CallContext::new("p1");

        store
            .create_conversation(ConversationRecord::new(&root, "asst_a", "thread_a"))
            .await
            .unwrap();
        let found = store.find_conversation("p1", None).await.unwrap().unwrap();
        assert_eq!(found.thread_id, None);

        for id in ["call_1", "call_2"] {
            store
                .append_tool_call(ToolCallRecord {
                    process_id: "p1".to_string(),
                    thread_id: None,
                    assistant_id: "asst_a".to_string(),
                    remote_thread_id: "thread_a".to_string(),
                    tool_call_id: id.to_string(),
                    tool_name: "lookup".to_string(),
                    result: "\"ok\"".to_string(),
                })
                .await
                .unwrap();
        }

        let calls = store.list_tool_calls("p1", None).await.unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_call_id, "call_1");
        assert_eq!(calls[1].tool_call_id, "call_2");
        assert!(store.list_tool_calls("p1", Some("other")).await.unwrap().is_empty());
    }
}
