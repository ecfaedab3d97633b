//! runweave 命令行入口
//!
//! 初始化日志、加载配置、装配编排器，在主线程上发送一条用户消息并打印解析后的 JSON 回复。
//! 用法：`runweave <prompt...>`；系统提示从 config/prompts/system.md 读取（可选）。

use std::sync::Arc;

use anyhow::{bail, Context};
use runweave::core::{create_orchestrator, load_config_or_default};
use runweave::memory::PromptMessage;
use runweave::tools::{EchoTool, LogicUnit, ToolSet};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runweave::observability::init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        bail!("usage: runweave <prompt...>");
    }

    let cfg = load_config_or_default(None);
    let units: Vec<Arc<dyn LogicUnit>> = vec![Arc::new(ToolSet::new("builtin").with_tool(EchoTool))];
    let orchestrator = create_orchestrator(&cfg, units).await;

    let process_id = std::env::var("RUNWEAVE_PROCESS_ID").unwrap_or_else(|_| "cli".to_string());
    let thread = orchestrator.main_thread(&process_id);

    // 没有系统提示也要设置启动消息，assistant 指令里才会有 JSON 输出要求
    let boot: Vec<PromptMessage> = ["config/prompts/system.md", "../config/prompts/system.md"]
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .map(PromptMessage::system)
        .into_iter()
        .collect();
    thread
        .set_boot_messages(&boot, None)
        .await
        .context("Failed to set boot messages")?;

    let answer = thread
        .schedule(&[PromptMessage::user(prompt)])
        .await
        .context("Run failed")?;
    println!("{}", serde_json::to_string_pretty(&answer)?);

    Ok(())
}
