//! Run 编排错误类型
//!
//! 所有错误都原样上抛给 dispatch / schedule 的调用方，核心内部不做任何自动重试；
//! 是否退避重试由上层根据 is_retryable / is_rate_limit 决定。

use std::time::Duration;

use thiserror::Error;

use crate::llm::RunStatus;

/// 远端 run 失败码中表示限流的取值
const RATE_LIMIT_CODES: [&str; 2] = ["rate_limit", "rate_limit_exceeded"];

/// 编排过程中可能出现的错误（网络、服务端、配置、轮询超时、工具、输出解析等）
#[derive(Error, Debug)]
pub enum RunError {
    /// 网络层失败（连接、读写、请求超时），调用方可按策略重试
    #[error("Transport error: {0}")]
    Transport(String),

    /// 服务端限流（HTTP 429），单独标出以便上层退避
    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    /// 其它服务端错误（参数校验、5xx 等）
    #[error("Service error ({status}): {message}")]
    Service { status: u16, message: String },

    /// 配置错误：重复的工具名、远端请求了本地不存在的工具、非法的 prompt 组合等
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 轮询在 max_wait_time 内没有等到稳定状态（或 run 已 expired）
    #[error("Timed out waiting for run {run_id} after {waited:?} (last status: {last_status})")]
    Timeout {
        run_id: String,
        last_status: RunStatus,
        waited: Duration,
    },

    /// requires_action ↔ submit 循环超过 max_tool_iterations
    #[error("Exceeded maximum number of tool iterations ({max})")]
    IterationBudgetExceeded { max: usize },

    #[error("Run {run_id} was cancelled")]
    RunCancelled { run_id: String },

    /// 远端 run 失败，携带远端错误码与信息
    #[error("Run {run_id} failed ({code}): {message}")]
    RunFailed {
        run_id: String,
        code: String,
        message: String,
    },

    /// 最终回复无法解析为结构化数据，raw 为拼接后的原始文本
    #[error("Malformed response ({reason}): {raw}")]
    MalformedResponse { raw: String, reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Tool {tool} failed: {message}")]
    ToolExecutionFailed { tool: String, message: String },

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 本地取消令牌触发，轮询提前结束
    #[error("Aborted by caller")]
    Aborted,
}

impl RunError {
    /// 是否为限流：HTTP 429，或远端 run 以 rate_limit 类错误码失败
    pub fn is_rate_limit(&self) -> bool {
        match self {
            RunError::RateLimited { .. } => true,
            RunError::RunFailed { code, .. } => RATE_LIMIT_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// 上层可考虑重新提交的错误（网络、限流、超时）；其余均为确定性失败
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunError::Transport(_) | RunError::Timeout { .. }) || self.is_rate_limit()
    }
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for RunError {
    fn from(e: sqlx::Error) -> Self {
        RunError::Store(e.to_string())
    }
}
