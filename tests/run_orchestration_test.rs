//! Run 编排集成测试（Mock 服务 + 虚拟时钟，无需 API）

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use runweave::config::RunSettings;
use runweave::core::{CallContext, ManualClock, OrchestratorBuilder, PollPolicy, RunError, RunOrchestrator};
use runweave::llm::{
    ContentPart, FilePurpose, MockRunService, MockRunStep, RequestedToolCall, RunStatus,
};
use runweave::memory::{ConversationStore, InMemoryConversationStore, Message, PromptMessage, Role};
use runweave::tools::{EchoTool, LogicUnit, Tool, ToolDefinition, ToolSet};

struct LookupTool;

#[async_trait]
impl Tool for LookupTool {
    fn name(&self) -> &str {
        "lookup"
    }

    fn description(&self) -> &str {
        "Look up a value by query."
    }

    async fn execute(&self, _context: &CallContext, args: Value) -> Result<Value, String> {
        let q = args["q"].as_str().ok_or("missing q")?;
        Ok(json!({ "query": q, "value": "42" }))
    }
}

/// 记录每次构建工具时收到的历史
#[derive(Default)]
struct HistoryRecorder {
    seen: Mutex<Vec<Vec<Message>>>,
}

#[async_trait]
impl LogicUnit for HistoryRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn build_tools(&self, history: &[Message]) -> Result<Vec<ToolDefinition>, RunError> {
        self.seen.lock().unwrap().push(history.to_vec());
        Ok(vec![ToolDefinition::from_tool(LookupTool)])
    }
}

struct Harness {
    service: Arc<MockRunService>,
    store: Arc<InMemoryConversationStore>,
    clock: Arc<ManualClock>,
    orch: Arc<RunOrchestrator>,
}

fn settings(max_tool_iterations: usize) -> RunSettings {
    RunSettings {
        poll: PollPolicy::new(Duration::from_millis(100), Duration::from_secs(1)),
        max_tool_iterations,
        ..RunSettings::default()
    }
}

fn harness(service: MockRunService, max_tool_iterations: usize) -> Harness {
    let service = Arc::new(service);
    let store = Arc::new(InMemoryConversationStore::new());
    let clock = Arc::new(ManualClock::new());
    let orch = OrchestratorBuilder::new(service.clone(), store.clone())
        .with_unit(ToolSet::new("lookup").with_tool(LookupTool))
        .with_settings(settings(max_tool_iterations))
        .with_clock(clock.clone())
        .build();
    Harness {
        service,
        store,
        clock,
        orch,
    }
}

#[tokio::test]
async fn test_full_scenario_tool_call_then_answer() {
    let h = harness(
        MockRunService::new()
            .with_script(vec![
                MockRunStep::status(RunStatus::Queued),
                MockRunStep::tool_call("call_1", "lookup", r#"{"q":"x"}"#),
                MockRunStep::status(RunStatus::Completed),
            ])
            .with_reply("```json\n{\"answer\":\"42\"}\n```"),
        10,
    );
    let ctx = CallContext::with_thread("p1", "t1");

    let answer = h
        .orch
        .schedule(&ctx, &[PromptMessage::user("hi")])
        .await
        .unwrap();
    assert_eq!(answer, json!({ "answer": "42" }));

    let submissions = h.service.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0][0].tool_call_id, "call_1");

    let calls = h.store.list_tool_calls("p1", Some("t1")).await.unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].tool_name, "lookup");
    let result: Value = serde_json::from_str(&calls[0].result).unwrap();
    assert_eq!(result, json!({ "query": "x", "value": "42" }));

    let runs = h.service.runs_created();
    assert_eq!(runs.len(), 1);
    assert_eq!(h.clock.sleep_count(), 1);
}

fn lookup_call(id: &str, q: &str) -> RequestedToolCall {
    RequestedToolCall {
        id: id.to_string(),
        name: "lookup".to_string(),
        arguments: json!({ "q": q }).to_string(),
    }
}

#[tokio::test]
async fn test_multiple_calls_in_one_round_are_batched_in_order() {
    let h = harness(
        MockRunService::new()
            .with_script(vec![
                MockRunStep::requires_action(vec![lookup_call("c1", "a"), lookup_call("c2", "b")]),
                MockRunStep::status(RunStatus::Completed),
            ])
            .with_reply(r#"{"done":true}"#),
        10,
    );
    let ctx = CallContext::with_thread("p1", "t1");

    let answer = h
        .orch
        .schedule(&ctx, &[PromptMessage::user("hi")])
        .await
        .unwrap();
    assert_eq!(answer, json!({ "done": true }));

    let submissions = h.service.submissions();
    assert_eq!(submissions.len(), 1);
    let batch: Vec<_> = submissions[0].iter().map(|o| o.tool_call_id.as_str()).collect();
    assert_eq!(batch, ["c1", "c2"]);
    let second: Value = serde_json::from_str(&submissions[0][1].output).unwrap();
    assert_eq!(second["query"], "b");

    let calls = h.store.list_tool_calls("p1", Some("t1")).await.unwrap();
    let ids: Vec<_> = calls.iter().map(|c| c.tool_call_id.as_str()).collect();
    assert_eq!(ids, ["c1", "c2"]);
}

#[tokio::test]
async fn test_conversation_creation_is_idempotent() {
    let h = harness(MockRunService::new(), 10);
    let ctx = CallContext::with_thread("p1", "t1");

    let first = h.orch.ensure_conversation(&ctx, Some("be brief"), &[]).await.unwrap();
    let second = h.orch.ensure_conversation(&ctx, Some("ignored"), &[]).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.service.assistants_created().len(), 1);
    assert_eq!(h.service.threads_created(), 1);

    // 同一存储上的新编排器走快速路径
    let other = OrchestratorBuilder::new(h.service.clone(), h.store.clone()).build();
    let third = other.ensure_conversation(&ctx, None, &[]).await.unwrap();
    assert_eq!(third, first);
    assert_eq!(h.service.assistants_created().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_access_creates_once() {
    let h = harness(MockRunService::new(), 10);
    let ctx = CallContext::new("p-concurrent");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orch = h.orch.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            orch.ensure_conversation(&ctx, None, &[]).await
        }));
    }

    let mut records = Vec::new();
    for handle in handles {
        records.push(handle.await.unwrap().unwrap());
    }
    assert!(records.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(h.service.assistants_created().len(), 1);
    assert_eq!(h.store.conversation_count().await, 1);
}

#[tokio::test]
async fn test_assistant_carries_model_and_builtin_tools() {
    let h = harness(MockRunService::new(), 10);
    h.orch
        .ensure_conversation(&CallContext::new("p1"), Some("sys"), &["file_1".to_string()])
        .await
        .unwrap();

    let spec = &h.service.assistants_created()[0];
    assert_eq!(spec.model, "gpt-4-1106-preview");
    assert_eq!(spec.temperature, Some(0.3));
    assert_eq!(spec.instructions.as_deref(), Some("sys"));
    assert_eq!(spec.file_ids, vec!["file_1".to_string()]);
    assert_eq!(spec.builtin_tools.len(), 2);
}

#[tokio::test]
async fn test_iteration_budget_is_exact() {
    let h = harness(
        MockRunService::new().with_script(vec![MockRunStep::tool_call("call_1", "lookup", r#"{"q":"x"}"#)]),
        3,
    );
    let ctx = CallContext::new("p1");

    let err = h
        .orch
        .schedule(&ctx, &[PromptMessage::user("loop")])
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::IterationBudgetExceeded { max: 3 }));
    assert_eq!(h.service.submissions().len(), 3);
    assert_eq!(h.store.list_tool_calls("p1", None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_zero_iteration_budget_fails_without_polling() {
    let h = harness(MockRunService::new(), 0);
    let err = h
        .orch
        .schedule(&CallContext::new("p1"), &[PromptMessage::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::IterationBudgetExceeded { max: 0 }));
    assert_eq!(h.service.retrieve_count(), 0);
}

#[tokio::test]
async fn test_poll_timeout_bounds_status_checks() {
    let h = harness(
        MockRunService::new().with_script(vec![MockRunStep::status(RunStatus::InProgress)]),
        10,
    );

    let err = h
        .orch
        .schedule(&CallContext::new("p1"), &[PromptMessage::user("slow")])
        .await
        .unwrap_err();
    match err {
        RunError::Timeout { last_status, .. } => assert_eq!(last_status, RunStatus::InProgress),
        other => panic!("expected Timeout, got {other:?}"),
    }
    // floor(1000ms / 100ms) + 1
    assert!(h.service.retrieve_count() <= 11);
    assert!(h.clock.elapsed() <= Duration::from_secs(1));
}

#[tokio::test]
async fn test_cancelled_run() {
    let h = harness(
        MockRunService::new().with_script(vec![MockRunStep::status(RunStatus::Cancelled)]),
        10,
    );
    let err = h
        .orch
        .schedule(&CallContext::new("p1"), &[PromptMessage::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::RunCancelled { .. }));
}

#[tokio::test]
async fn test_failed_run_flags_rate_limit() {
    let h = harness(
        MockRunService::new().with_script(vec![MockRunStep::failed("rate_limit_exceeded", "slow down")]),
        10,
    );
    let err = h
        .orch
        .schedule(&CallContext::new("p1"), &[PromptMessage::user("hi")])
        .await
        .unwrap_err();
    assert!(err.is_rate_limit());
    match err {
        RunError::RunFailed { code, message, .. } => {
            assert_eq!(code, "rate_limit_exceeded");
            assert_eq!(message, "slow down");
        }
        other => panic!("expected RunFailed, got {other:?}"),
    }

    let h = harness(
        MockRunService::new().with_script(vec![MockRunStep::failed("server_error", "boom")]),
        10,
    );
    let err = h
        .orch
        .schedule(&CallContext::new("p1"), &[PromptMessage::user("hi")])
        .await
        .unwrap_err();
    assert!(!err.is_rate_limit());
}

#[tokio::test]
async fn test_unknown_tool_is_configuration_error() {
    let h = harness(
        MockRunService::new().with_script(vec![MockRunStep::tool_call("call_1", "teleport", "{}")]),
        10,
    );
    let err = h
        .orch
        .schedule(&CallContext::new("p1"), &[PromptMessage::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Configuration(_)));
    assert!(h.service.submissions().is_empty());
    assert!(h.store.list_tool_calls("p1", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_tool_names_fail_before_run() {
    let service = Arc::new(MockRunService::new());
    let orch = OrchestratorBuilder::new(service.clone(), Arc::new(InMemoryConversationStore::new()))
        .with_unit(ToolSet::new("a").with_tool(EchoTool))
        .with_unit(ToolSet::new("b").with_tool(EchoTool))
        .build();

    let err = orch
        .schedule(&CallContext::new("p1"), &[PromptMessage::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Configuration(_)));
    assert!(service.runs_created().is_empty());
}

#[tokio::test]
async fn test_malformed_reply_keeps_raw_text() {
    let h = harness(MockRunService::new().with_reply("sorry, no JSON today"), 10);
    let err = h
        .orch
        .schedule(&CallContext::new("p1"), &[PromptMessage::user("hi")])
        .await
        .unwrap_err();
    match err {
        RunError::MalformedResponse { raw, .. } => assert!(raw.contains("no JSON today")),
        other => panic!("expected MalformedResponse, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tool_history_feeds_logic_units() {
    let recorder = Arc::new(HistoryRecorder::default());
    let service = Arc::new(
        MockRunService::new()
            .with_script(vec![
                MockRunStep::tool_call("call_1", "lookup", r#"{"q":"x"}"#),
                MockRunStep::status(RunStatus::Completed),
            ])
            .with_reply("{\"ok\":true}"),
    );
    let orch = OrchestratorBuilder::new(service.clone(), Arc::new(InMemoryConversationStore::new()))
        .with_units(vec![recorder.clone() as Arc<dyn LogicUnit>])
        .with_clock(Arc::new(ManualClock::new()))
        .build();
    let thread = orch.main_thread("p1");

    thread.schedule(&[PromptMessage::user("first")]).await.unwrap();
    thread.schedule(&[PromptMessage::user("second")]).await.unwrap();

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].is_empty());
    assert_eq!(seen[1].len(), 1);
    assert_eq!(seen[1][0].role, Role::Tool);
    assert_eq!(seen[1][0].tool_call_id.as_deref(), Some("call_1"));
}

#[tokio::test]
async fn test_thread_helpers() {
    let h = harness(
        MockRunService::new()
            .with_script(vec![
                MockRunStep::tool_call("call_1", "lookup", r#"{"q":"x"}"#),
                MockRunStep::status(RunStatus::Completed),
            ])
            .with_reply("{\"answer\":\"42\"}"),
        10,
    );

    let main = h.orch.main_thread("p1");
    assert!(main.context().is_root());

    let a = h.orch.new_thread("p1");
    let b = h.orch.new_thread("p1");
    assert_eq!(a.context().process_id, "p1");
    assert_ne!(a.context(), b.context());

    main.schedule(&[PromptMessage::user("hi")]).await.unwrap();

    let clone = main.fork().await.unwrap();
    assert_ne!(clone.context(), main.context());
    let source = h.store.find_conversation("p1", None).await.unwrap().unwrap();
    let copied = h
        .store
        .find_conversation("p1", clone.context().thread_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(copied.assistant_id, source.assistant_id);
    assert_eq!(copied.remote_thread_id, source.remote_thread_id);
    let copied_calls = h
        .store
        .list_tool_calls("p1", clone.context().thread_id())
        .await
        .unwrap();
    assert_eq!(copied_calls.len(), 1);
    assert_eq!(h.service.assistants_created().len(), 1);

    // 源线程尚无会话时，clone 只是一个新的派生上下文
    let fresh = h.orch.clone_thread(&CallContext::new("p2")).await.unwrap();
    assert!(h
        .store
        .find_conversation("p2", fresh.context().thread_id())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_boot_messages_then_schedule_with_image() {
    let h = harness(MockRunService::new().with_reply("{\"done\":true}"), 10);
    let thread = h.orch.main_thread("p1");
    let schema = json!({ "type": "object", "properties": { "done": { "type": "boolean" } } });

    let record = thread
        .set_boot_messages(
            &[
                PromptMessage::system("You grade charts."),
                PromptMessage::image("chart.png", vec![1, 2, 3]),
                PromptMessage::user("context message"),
            ],
            Some(&schema),
        )
        .await
        .unwrap();
    assert!(h.service.runs_created().is_empty());

    let spec = &h.service.assistants_created()[0];
    let instructions = spec.instructions.as_deref().unwrap();
    assert!(instructions.starts_with("You grade charts.\n"));
    assert!(instructions.contains("MUST be valid JSON"));
    assert_eq!(spec.file_ids.len(), 1);

    let answer = thread
        .schedule(&[PromptMessage::image("second.png", vec![4])])
        .await
        .unwrap();
    assert_eq!(answer, json!({ "done": true }));
    assert_eq!(h.service.uploads(), vec!["chart.png".to_string(), "second.png".to_string()]);
    assert_eq!(
        h.service.upload_purposes(),
        vec![FilePurpose::Assistants, FilePurpose::Vision]
    );

    let messages = h.service.thread_messages(&record.remote_thread_id);
    assert_eq!(messages[0].content, vec![ContentPart::Text("context message".to_string())]);
    // 没有用户文本时投递空消息，图片挂在最后一条上
    assert_eq!(messages[1].content[0], ContentPart::Text(String::new()));
    assert!(matches!(messages[1].content[1], ContentPart::Image { .. }));
    assert_eq!(messages[2].role, Role::Assistant);
    assert_eq!(h.service.assistants_created().len(), 1);
}
