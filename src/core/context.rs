//! 调用上下文：标识一次逻辑会话（process）及其子线程
//!
//! (process_id, thread_id) 是所有远端资源幂等查找的键；同一逻辑会话在进程重启后必须得到相同的键，
//! 因此 thread_id 只在 derive 时生成，之后随上下文一起传递、持久化。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 调用上下文（值类型，创建后不再修改）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallContext {
    pub process_id: String,
    /// 根上下文为 None；派生的子线程为随机生成的 id
    pub thread_id: Option<String>,
}

impl CallContext {
    /// 根上下文（无 thread_id）
    pub fn new(process_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            thread_id: None,
        }
    }

    /// 用已知的 thread_id 还原上下文（例如从请求参数或存储中恢复）
    pub fn with_thread(process_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            thread_id: Some(thread_id.into()),
        }
    }

    /// 派生子线程：同一 process_id，新的 thread_id
    pub fn derive(&self) -> Self {
        Self {
            process_id: self.process_id.clone(),
            thread_id: Some(format!("thread_{}", uuid::Uuid::new_v4())),
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.thread_id.is_none()
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread_id {
            Some(thread_id) => write!(f, "{}/{}", self.process_id, thread_id),
            None => write!(f, "{}", self.process_id),
        }
    }
}
