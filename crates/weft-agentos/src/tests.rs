use crate::*;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use weft_agent_loop::{AgentConfig, RunCancellationToken};
use weft_contract::testing::{EchoTool, ScriptedProvider, StallingProvider};
use weft_contract::{AgentEvent, ProviderEvent, TokenUsage};

fn delegate_call(name: &str, task: &str) -> Vec<ProviderEvent> {
    ScriptedProvider::tool_call_turn(
        "d1",
        "delegate",
        &format!(r#"{{"name":"{name}","task":"{task}"}}"#),
    )
}

fn agent_events(events: &[WorkflowEvent]) -> Vec<(Option<String>, AgentEvent)> {
    events
        .iter()
        .filter(|e| e.kind == WorkflowEventKind::AgentEvent)
        .filter_map(|e| {
            serde_json::from_value::<AgentEvent>(e.data.clone())
                .ok()
                .map(|parsed| (e.agent.clone(), parsed))
        })
        .collect()
}

fn kinds(events: &[WorkflowEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.as_str()).collect()
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..500 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

// =============================================================================
// Workflow runner
// =============================================================================

#[tokio::test]
async fn test_workflow_with_single_delegation() {
    // S5: main delegates once, sub-agent replies, main wraps up.
    let provider = ScriptedProvider::new(vec![
        delegate_call("coder", "Write code"),
        ScriptedProvider::text_reply("Code written", Some(TokenUsage::new(5, 7))),
        ScriptedProvider::text_reply("All done", Some(TokenUsage::new(1, 2))),
    ]);
    let schema = Arc::new(
        WorkflowSchema::builder("build")
            .description("build workflow")
            .agent(MainAgentConfig::new("test-model"))
            .provider("mock", provider)
            .build(),
    );
    let workflow = Workflow::new(schema);

    let events: Vec<WorkflowEvent> = workflow
        .run("Build the feature", WorkflowRunOptions::default())
        .collect()
        .await;

    let kind_list = kinds(&events);
    assert_eq!(kind_list.first(), Some(&"workflow:started"));
    assert_eq!(kind_list.last(), Some(&"workflow:completed"));

    // agent:spawned fires before the sub-agent's events, which fire before
    // agent:completed.
    let spawned_at = kind_list
        .iter()
        .position(|k| *k == "agent:spawned")
        .expect("agent:spawned expected");
    let completed_at = kind_list
        .iter()
        .position(|k| *k == "agent:completed")
        .expect("agent:completed expected");
    assert!(spawned_at < completed_at);

    let sub_events: Vec<&WorkflowEvent> = events
        .iter()
        .filter(|e| e.agent.as_deref() == Some("coder"))
        .collect();
    assert!(
        sub_events.len() >= 3,
        "sub-agent events should be forwarded, got {}",
        sub_events.len()
    );

    let spawned = &events[spawned_at];
    assert_eq!(spawned.agent.as_deref(), Some("coder"));
    assert_eq!(spawned.data["task"], "Write code");

    let completed = &events[completed_at];
    assert_eq!(completed.data["output"], "Code written");

    // The delegate outcome fed back to the main agent is the sub's output.
    let main_results: Vec<AgentEvent> = agent_events(&events)
        .into_iter()
        .filter(|(agent, e)| {
            agent.as_deref() == Some("build:main") && e.kind() == "tool_result"
        })
        .map(|(_, e)| e)
        .collect();
    match &main_results[0] {
        AgentEvent::ToolResult { outcome } => {
            assert_eq!(outcome.content, "Code written");
            assert!(!outcome.is_error);
        }
        other => panic!("expected tool_result, got {other:?}"),
    }

    let result = events.last().unwrap().result.clone().expect("result");
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.output, "All done");
    assert_eq!(result.usage, TokenUsage::new(16, 29));
}

#[tokio::test]
async fn test_workflow_default_provider_missing() {
    // S6: empty provider map.
    let schema = Arc::new(
        WorkflowSchema::builder("broken")
            .agent(MainAgentConfig::new("m"))
            .default_provider("missing")
            .build(),
    );
    let workflow = Workflow::new(schema);
    let events: Vec<WorkflowEvent> = workflow
        .run("hello", WorkflowRunOptions::default())
        .collect()
        .await;

    let errors: Vec<&WorkflowEvent> = events
        .iter()
        .filter(|e| e.kind == WorkflowEventKind::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    let result = errors[0].result.clone().expect("result");
    assert_eq!(result.status, WorkflowStatus::Error);
    assert!(result.error.unwrap().contains("not found"));
    assert_eq!(events.last().unwrap().kind, WorkflowEventKind::Error);
}

#[tokio::test]
async fn test_workflow_without_delegation_has_no_delegate_tool() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_reply("plain", None)]);
    let schema = Arc::new(
        WorkflowSchema::builder("plain")
            .agent(MainAgentConfig::new("m"))
            .provider("mock", provider)
            .delegation(DelegationConfig::disabled())
            .build(),
    );
    let workflow = Workflow::new(schema);
    let events: Vec<WorkflowEvent> = workflow
        .run("go", WorkflowRunOptions::default())
        .collect()
        .await;

    assert!(events
        .iter()
        .all(|e| e.kind != WorkflowEventKind::AgentSpawned));
    let result = events.last().unwrap().result.clone().unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.output, "plain");
}

#[tokio::test]
async fn test_workflow_cancellation_yields_canceled_result() {
    let provider = Arc::new(StallingProvider { prefix: vec![] });
    let schema = Arc::new(
        WorkflowSchema::builder("slow")
            .agent(MainAgentConfig::new("m"))
            .provider("mock", provider)
            .build(),
    );
    let workflow = Workflow::new(schema);

    let token = RunCancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let events: Vec<WorkflowEvent> = tokio::time::timeout(
        Duration::from_secs(2),
        workflow
            .run(
                "go",
                WorkflowRunOptions {
                    session: None,
                    cancellation: Some(token),
                },
            )
            .collect::<Vec<_>>(),
    )
    .await
    .expect("workflow should terminate after cancellation");

    let result = events.last().unwrap().result.clone().unwrap();
    assert_eq!(result.status, WorkflowStatus::Canceled);
}

#[tokio::test]
async fn test_workflow_hooks_lifecycle() {
    struct RecordingHooks {
        before: AtomicBool,
        after: AtomicBool,
    }

    #[async_trait]
    impl WorkflowHooks for RecordingHooks {
        async fn before_run(&self, ctx: &WorkflowContext) {
            assert_eq!(ctx.workflow_name, "hooked");
            self.before.store(true, Ordering::SeqCst);
        }

        async fn after_run(&self, _ctx: &WorkflowContext, result: &WorkflowResult) {
            assert_eq!(result.status, WorkflowStatus::Completed);
            self.after.store(true, Ordering::SeqCst);
        }
    }

    let hooks = Arc::new(RecordingHooks {
        before: AtomicBool::new(false),
        after: AtomicBool::new(false),
    });
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_reply("ok", None)]);
    let schema = Arc::new(
        WorkflowSchema::builder("hooked")
            .agent(MainAgentConfig::new("m"))
            .provider("mock", provider)
            .hooks(hooks.clone())
            .build(),
    );
    let _events: Vec<WorkflowEvent> = Workflow::new(schema)
        .run("go", WorkflowRunOptions::default())
        .collect()
        .await;

    assert!(hooks.before.load(Ordering::SeqCst));
    assert!(hooks.after.load(Ordering::SeqCst));
}

// =============================================================================
// Delegation admission
// =============================================================================

async fn run_delegation_workflow(
    delegation: DelegationConfig,
    hooks: Option<Arc<dyn WorkflowHooks>>,
    turns: Vec<Vec<ProviderEvent>>,
) -> Vec<WorkflowEvent> {
    let provider = ScriptedProvider::new(turns);
    let mut builder = WorkflowSchema::builder("wf")
        .agent(MainAgentConfig::new("test-model"))
        .provider("mock", provider)
        .delegation(delegation);
    if let Some(hooks) = hooks {
        builder = builder.hooks(hooks);
    }
    let workflow = Workflow::new(Arc::new(builder.build()));
    workflow
        .run("go", WorkflowRunOptions::default())
        .collect()
        .await
}

fn first_tool_result(events: &[WorkflowEvent]) -> weft_contract::ToolOutcome {
    agent_events(events)
        .into_iter()
        .find_map(|(_, e)| match e {
            AgentEvent::ToolResult { outcome } => Some(outcome),
            _ => None,
        })
        .expect("tool_result expected")
}

#[tokio::test]
async fn test_delegation_concurrency_cap() {
    let events = run_delegation_workflow(
        DelegationConfig::default().with_max_concurrent(0),
        None,
        vec![
            delegate_call("coder", "task"),
            ScriptedProvider::text_reply("done", None),
        ],
    )
    .await;

    let outcome = first_tool_result(&events);
    assert!(outcome.is_error);
    assert!(outcome.content.contains("Delegation limit reached"));
    assert!(events
        .iter()
        .all(|e| e.kind != WorkflowEventKind::AgentSpawned));
}

#[tokio::test]
async fn test_delegation_model_allow_list() {
    let call = ScriptedProvider::tool_call_turn(
        "d1",
        "delegate",
        r#"{"name":"coder","task":"t","model":"forbidden-model"}"#,
    );
    let events = run_delegation_workflow(
        DelegationConfig::default().with_allowed_models(["good-model"]),
        None,
        vec![call, ScriptedProvider::text_reply("done", None)],
    )
    .await;

    let outcome = first_tool_result(&events);
    assert!(outcome.is_error);
    assert!(outcome.content.contains("forbidden-model"));
    assert!(outcome.content.contains("not allowed"));
}

#[tokio::test]
async fn test_delegation_unknown_provider_lists_available() {
    let call = ScriptedProvider::tool_call_turn(
        "d1",
        "delegate",
        r#"{"name":"coder","task":"t","provider":"nope"}"#,
    );
    let events = run_delegation_workflow(
        DelegationConfig::default(),
        None,
        vec![call, ScriptedProvider::text_reply("done", None)],
    )
    .await;

    let outcome = first_tool_result(&events);
    assert!(outcome.is_error);
    assert!(outcome.content.contains("Provider 'nope' not found"));
    assert!(outcome.content.contains("mock"));
}

#[tokio::test]
async fn test_delegation_spawn_blocked_by_policy() {
    struct DenyAll;

    #[async_trait]
    impl WorkflowHooks for DenyAll {
        async fn on_spawn(&self, _spawn: &SpawnRequest) -> bool {
            false
        }
    }

    let events = run_delegation_workflow(
        DelegationConfig::default(),
        Some(Arc::new(DenyAll)),
        vec![
            delegate_call("coder", "task"),
            ScriptedProvider::text_reply("done", None),
        ],
    )
    .await;

    let outcome = first_tool_result(&events);
    assert!(outcome.is_error);
    assert!(outcome.content.contains("spawn blocked by workflow policy"));
    assert!(events
        .iter()
        .all(|e| e.kind != WorkflowEventKind::AgentSpawned));
}

#[tokio::test]
async fn test_delegation_missing_required_fields() {
    let call = ScriptedProvider::tool_call_turn("d1", "delegate", r#"{"name":"coder"}"#);
    let events = run_delegation_workflow(
        DelegationConfig::default(),
        None,
        vec![call, ScriptedProvider::text_reply("done", None)],
    )
    .await;

    let outcome = first_tool_result(&events);
    assert!(outcome.is_error);
    assert!(outcome.content.contains("'task'"));
}

#[tokio::test]
async fn test_sub_agents_inherit_shared_tools_but_not_delegate() {
    // The sub-agent calls `echo` (inherited) and then tries `delegate`
    // (not inherited), which must come back as an unknown tool.
    let provider = ScriptedProvider::new(vec![
        // main: spawn the sub-agent
        delegate_call("helper", "use your tools"),
        // sub turn 1: echo
        ScriptedProvider::tool_call_turn("s1", "echo", r#"{"text":"inherited"}"#),
        // sub turn 2: try to delegate
        ScriptedProvider::tool_call_turn("s2", "delegate", r#"{"name":"x","task":"y"}"#),
        // sub turn 3: wrap up
        ScriptedProvider::text_reply("sub done", None),
        // main: wrap up
        ScriptedProvider::text_reply("main done", None),
    ]);
    let schema = Arc::new(
        WorkflowSchema::builder("wf")
            .agent(MainAgentConfig::new("m"))
            .provider("mock", provider)
            .tool(Arc::new(EchoTool))
            .build(),
    );
    let events: Vec<WorkflowEvent> = Workflow::new(schema)
        .run("go", WorkflowRunOptions::default())
        .collect()
        .await;

    let sub_results: Vec<weft_contract::ToolOutcome> = agent_events(&events)
        .into_iter()
        .filter(|(agent, _)| agent.as_deref() == Some("helper"))
        .filter_map(|(_, e)| match e {
            AgentEvent::ToolResult { outcome } => Some(outcome),
            _ => None,
        })
        .collect();
    assert_eq!(sub_results.len(), 2);
    assert_eq!(sub_results[0].content, "inherited");
    assert!(sub_results[1].is_error);
    assert!(sub_results[1].content.contains("Unknown tool: delegate"));
}

#[tokio::test]
async fn test_multiple_delegations_in_spawn_order() {
    let provider = ScriptedProvider::new(vec![
        delegate_call("alpha", "first task"),
        ScriptedProvider::text_reply("alpha out", None),
        delegate_call("beta", "second task"),
        ScriptedProvider::text_reply("beta out", None),
        ScriptedProvider::text_reply("all done", None),
    ]);
    let schema = Arc::new(
        WorkflowSchema::builder("wf")
            .agent(MainAgentConfig::new("m"))
            .provider("mock", provider)
            .build(),
    );
    let manager = WorkflowManager::new();
    let run_id = manager.start_run(schema, "go", WorkflowRunOptions::default());

    wait_until(|| {
        manager
            .get_run(&run_id)
            .is_some_and(|info| info.status != WorkflowStatus::Running)
    })
    .await;

    let agents = manager.get_agents(&run_id);
    let names: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert!(agents
        .iter()
        .all(|a| a.status == SubAgentStatus::Completed));
    assert!(agents.iter().all(|a| a.event_count > 0));
}

// =============================================================================
// Workflow manager
// =============================================================================

#[tokio::test]
async fn test_workflow_manager_materializes_run_info() {
    let provider = ScriptedProvider::new(vec![
        delegate_call("coder", "Write code"),
        ScriptedProvider::text_reply("Code written", Some(TokenUsage::new(5, 7))),
        ScriptedProvider::text_reply("All done", Some(TokenUsage::new(1, 2))),
    ]);
    let schema = Arc::new(
        WorkflowSchema::builder("build")
            .agent(MainAgentConfig::new("test-model"))
            .provider("mock", provider)
            .build(),
    );
    let manager = WorkflowManager::new();
    let run_id = manager.start_run(schema, "Build it", WorkflowRunOptions::default());

    // The snapshot is queryable immediately.
    let info = manager.get_run(&run_id).expect("run info");
    assert_eq!(info.name, "build");
    assert_eq!(info.prompt, "Build it");
    assert_eq!(info.policy.model, "test-model");
    assert_eq!(info.policy.default_provider, "mock");
    assert!(info.policy.delegation_enabled);

    wait_until(|| {
        manager
            .get_run(&run_id)
            .is_some_and(|info| info.status == WorkflowStatus::Completed)
    })
    .await;

    let info = manager.get_run(&run_id).unwrap();
    assert_eq!(info.output, "All done");
    assert_eq!(info.usage, TokenUsage::new(16, 29));
    assert_eq!(info.agents.len(), 1);
    assert_eq!(info.agents[0].name, "coder");
    assert_eq!(info.agents[0].status, SubAgentStatus::Completed);

    // Events are retained and limitable.
    let all = manager.get_events(&run_id, None);
    assert!(all.len() > 4);
    let last_two = manager.get_events(&run_id, Some(2));
    assert_eq!(last_two.len(), 2);
    assert_eq!(last_two[1].kind, WorkflowEventKind::Completed);

    assert_eq!(manager.list_runs(None).len(), 1);
    assert_eq!(
        manager.list_runs(Some(WorkflowStatus::Completed)).len(),
        1
    );
    assert!(manager.list_runs(Some(WorkflowStatus::Error)).is_empty());
}

#[tokio::test]
async fn test_workflow_manager_forwards_events_on_bus() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_reply("hi", None)]);
    let schema = Arc::new(
        WorkflowSchema::builder("wf")
            .agent(MainAgentConfig::new("m"))
            .provider("mock", provider)
            .build(),
    );
    let manager = WorkflowManager::new();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = manager.bus().on(
        "workflow:completed",
        Arc::new(move |name: &str, _data: &serde_json::Value| {
            sink.lock().unwrap().push(name.to_string());
        }),
    );

    let run_id = manager.start_run(schema, "go", WorkflowRunOptions::default());
    wait_until(|| {
        manager
            .get_run(&run_id)
            .is_some_and(|info| info.status == WorkflowStatus::Completed)
    })
    .await;

    assert_eq!(*seen.lock().unwrap(), vec!["workflow:completed"]);
}

// =============================================================================
// Agent manager
// =============================================================================

#[tokio::test]
async fn test_agent_manager_run_lifecycle() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_reply(
        "hello",
        Some(TokenUsage::new(10, 20)),
    )]);
    let manager = AgentManager::new();
    let agent_id = manager.register(AgentConfig::new("greeter", provider, "m"), None);

    let info = manager.get_agent(&agent_id).unwrap();
    assert_eq!(info.name, "greeter");
    assert_eq!(info.status, AgentStatus::Idle);

    let run_id = manager.start_run(&agent_id, "Say hi").unwrap();
    wait_until(|| {
        manager
            .get_run(&run_id)
            .is_some_and(|run| run.status != RunStatus::Running)
    })
    .await;

    let run = manager.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.agent_id, agent_id);
    assert!(run.finished_at_ms.is_some());
    assert_eq!(run.usage, Some(TokenUsage::new(10, 20)));
    assert!(run.events.last().unwrap().is_terminal());

    let info = manager.get_agent(&agent_id).unwrap();
    assert_eq!(info.status, AgentStatus::Idle);
    assert!(info.current_run_id.is_none());
    assert_eq!(info.total_usage, TokenUsage::new(10, 20));

    // The agent's session kept the conversation.
    let session = manager.get_session(&agent_id).unwrap();
    assert_eq!(session.len(), 2);

    assert_eq!(manager.list_runs(Some(&agent_id)).len(), 1);
    assert_eq!(manager.list_runs(Some("other")).len(), 0);
}

#[tokio::test]
async fn test_agent_manager_unknown_agent() {
    let manager = AgentManager::new();
    let err = manager.start_run("ghost", "p").unwrap_err();
    assert!(matches!(err, ManagerError::AgentNotFound(_)));
}

#[tokio::test]
async fn test_agent_manager_cancel_run() {
    let provider = Arc::new(StallingProvider { prefix: vec![] });
    let manager = AgentManager::new();
    let agent_id = manager.register(AgentConfig::new("slow", provider, "m"), None);
    let run_id = manager.start_run(&agent_id, "hang").unwrap();

    // Let the run reach the provider, then cancel through the manager.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(manager.cancel_run(&agent_id));

    wait_until(|| {
        manager
            .get_run(&run_id)
            .is_some_and(|run| run.status != RunStatus::Running)
    })
    .await;
    assert_eq!(manager.get_run(&run_id).unwrap().status, RunStatus::Canceled);
    assert_eq!(
        manager.get_agent(&agent_id).unwrap().status,
        AgentStatus::Idle
    );
}

#[tokio::test]
async fn test_agent_manager_bus_events() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_reply("x", None)]);
    let manager = AgentManager::new();

    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = log.clone();
    let _sub = manager.bus().on(
        "*",
        Arc::new(move |name: &str, _data: &serde_json::Value| {
            sink.lock().unwrap().push(name.to_string());
        }),
    );

    let agent_id = manager.register(AgentConfig::new("a", provider, "m"), None);
    let run_id = manager.start_run(&agent_id, "p").unwrap();
    wait_until(|| {
        manager
            .get_run(&run_id)
            .is_some_and(|run| run.status != RunStatus::Running)
    })
    .await;
    manager.remove(&agent_id);

    let names = log.lock().unwrap().clone();
    assert!(names.contains(&"agent:registered".to_string()));
    assert!(names.contains(&"run:event".to_string()));
    assert!(names.contains(&"run:completed".to_string()));
    assert!(names.contains(&"agent:status".to_string()));
    assert!(names.contains(&"agent:removed".to_string()));

    // run:completed arrives after every run:event.
    let last_event = names
        .iter()
        .rposition(|n| n == "run:event")
        .expect("run events");
    let completed = names
        .iter()
        .position(|n| n == "run:completed")
        .expect("run completed");
    assert!(last_event < completed);
}

#[tokio::test]
async fn test_agent_manager_error_run_status() {
    let provider = Arc::new(weft_contract::testing::FailingProvider {
        prefix: vec![],
        message: "boom".to_string(),
    });
    let manager = AgentManager::new();
    let agent_id = manager.register(AgentConfig::new("a", provider, "m"), None);
    let run_id = manager.start_run(&agent_id, "p").unwrap();

    wait_until(|| {
        manager
            .get_run(&run_id)
            .is_some_and(|run| run.status != RunStatus::Running)
    })
    .await;
    let run = manager.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Error);
    assert!(run
        .events
        .iter()
        .any(|e| matches!(e, AgentEvent::Error { .. })));
}
