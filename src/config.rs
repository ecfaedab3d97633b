//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RUNWEAVE__*` 覆盖（双下划线表示嵌套，如 `RUNWEAVE__RUNS__POLL_INTERVAL_MS=200`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::PollPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub runs: RunsSection,
    pub tools: ToolsSection,
    pub store: StoreSection,
}

/// [llm] 段：模型、端点与请求超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// 存放 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4-1106-preview".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
            temperature: default_temperature(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// [runs] 段：轮询节奏、迭代上限、内置能力开关
#[derive(Debug, Clone, Deserialize)]
pub struct RunsSection {
    /// 单次等待 run 稳定的墙钟上限（秒）
    #[serde(default = "default_max_wait_time_secs")]
    pub max_wait_time_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 单个 run 内工具调用轮数上限
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    #[serde(default = "default_true")]
    pub enable_retrieval: bool,
    #[serde(default = "default_true")]
    pub enable_code_interpreter: bool,
}

fn default_max_wait_time_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_tool_iterations() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for RunsSection {
    fn default() -> Self {
        Self {
            max_wait_time_secs: default_max_wait_time_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_tool_iterations: default_max_tool_iterations(),
            enable_retrieval: true,
            enable_code_interpreter: true,
        }
    }
}

impl RunsSection {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.max_wait_time_secs),
        )
    }
}

/// [tools] 段：单次工具调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// [store] 段：会话存储位置；未设置时使用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub db_path: Option<PathBuf>,
}

/// 编排器运行参数（由 AppConfig 派生）
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub model: String,
    pub temperature: Option<f32>,
    pub poll: PollPolicy,
    pub max_tool_iterations: usize,
    pub enable_retrieval: bool,
    pub enable_code_interpreter: bool,
}

impl RunSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            model: cfg.llm.model.clone(),
            temperature: Some(cfg.llm.temperature),
            poll: cfg.runs.poll_policy(),
            max_tool_iterations: cfg.runs.max_tool_iterations,
            enable_retrieval: cfg.runs.enable_retrieval,
            enable_code_interpreter: cfg.runs.enable_code_interpreter,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 从 config 目录加载配置，环境变量 RUNWEAVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RUNWEAVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RUNWEAVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
