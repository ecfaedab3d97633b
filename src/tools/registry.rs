//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute）。
//! 工具由 LogicUnit 按会话历史动态提供，ToolRegistry 在每次 dispatch 前按名汇总，
//! 重名视为配置错误。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{CallContext, RunError};
use crate::llm::ToolManifestEntry;
use crate::memory::Message;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（远端 function 名）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    /// 默认返回空对象，表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具，返回结构化结果
    async fn execute(&self, context: &CallContext, args: Value) -> Result<Value, String>;
}

/// 一次注册表快照中的工具定义
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    tool: Arc<dyn Tool>,
}

impl ToolDefinition {
    pub fn new(tool: Arc<dyn Tool>) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters_schema(),
            tool,
        }
    }

    pub fn from_tool(tool: impl Tool + 'static) -> Self {
        Self::new(Arc::new(tool))
    }

    pub async fn execute(&self, context: &CallContext, args: Value) -> Result<Value, String> {
        self.tool.execute(context, args).await
    }

    pub fn manifest_entry(&self) -> ToolManifestEntry {
        ToolManifestEntry::Function {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// 工具提供者：根据会话中已有的工具结果决定本轮暴露哪些工具
#[async_trait]
pub trait LogicUnit: Send + Sync {
    /// 提供者名称（日志与 locate_unit 使用）
    fn name(&self) -> &str;

    async fn build_tools(&self, history: &[Message]) -> Result<Vec<ToolDefinition>, RunError>;
}

/// 固定工具集：不关心历史，始终暴露同一组工具
pub struct ToolSet {
    name: String,
    tools: Vec<ToolDefinition>,
}

impl ToolSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
        }
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(ToolDefinition::from_tool(tool));
        self
    }
}

#[async_trait]
impl LogicUnit for ToolSet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn build_tools(&self, _history: &[Message]) -> Result<Vec<ToolDefinition>, RunError> {
        Ok(self.tools.clone())
    }
}

/// 工具注册表：按名称存储 ToolDefinition，支持 get / manifest / tool_names
#[derive(Default, Debug)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次询问每个 LogicUnit，汇总为按名索引的注册表；任意两处重名即失败
    pub async fn build(
        units: &[Arc<dyn LogicUnit>],
        history: &[Message],
    ) -> Result<Self, RunError> {
        let mut registry = Self::new();
        for unit in units {
            for def in unit.build_tools(history).await? {
                registry.register(unit.name(), def)?;
            }
        }
        Ok(registry)
    }

    fn register(&mut self, unit: &str, def: ToolDefinition) -> Result<(), RunError> {
        if self.tools.contains_key(&def.name) {
            return Err(RunError::Configuration(format!(
                "duplicate tool name '{}' (from logic unit '{}')",
                def.name, unit
            )));
        }
        self.tools.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// 按名称排序的工具名
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 生成 run 的 function 工具清单（按名称排序，保证同一快照结果稳定）
    pub fn manifest(&self) -> Vec<ToolManifestEntry> {
        self.tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(ToolDefinition::manifest_entry)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
