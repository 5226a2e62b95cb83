use super::*;
use std::sync::Mutex as StdMutex;
use tokio::time::Duration;
use weft_contract::testing::{EchoTool, FailingProvider, ScriptedProvider, StallingProvider};
use weft_contract::{ProviderEvent, Role, TokenUsage, ToolInvocation};

async fn collect(stream: AgentEventStream) -> Vec<AgentEvent> {
    stream.collect::<Vec<_>>().await
}

fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
    events.iter().map(AgentEvent::kind).collect()
}

// =============================================================================
// Terminal invariants
// =============================================================================

#[tokio::test]
async fn test_plain_reply_event_order() {
    // S1: content → message → done(end_turn, usage)
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_reply(
        "Hello!",
        Some(TokenUsage::new(10, 20)),
    )]);
    let agent = Agent::new(AgentConfig::new("greeter", provider, "test-model"));

    let events = collect(agent.run(RunInput::new("Say hi"))).await;
    assert_eq!(kinds(&events), vec!["content", "message", "done"]);

    match &events[1] {
        AgentEvent::Message { message } => {
            assert_eq!(message.role, Role::Assistant);
            assert_eq!(message.content, "Hello!");
            assert_eq!(message.model.as_deref(), Some("test-model"));
        }
        other => panic!("expected message event, got {other:?}"),
    }
    match &events[2] {
        AgentEvent::Done { reason, usage } => {
            assert_eq!(*reason, FinishReason::EndTurn);
            assert_eq!(*usage, Some(TokenUsage::new(10, 20)));
        }
        other => panic!("expected done event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_exactly_one_done_event() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_reply("x", None)]);
    let agent = Agent::new(AgentConfig::new("a", provider, "m"));

    let events = collect(agent.run(RunInput::new("p"))).await;
    let done_count = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(done_count, 1);
    assert!(events.last().unwrap().is_terminal());
}

// =============================================================================
// Tool round trips
// =============================================================================

#[tokio::test]
async fn test_single_tool_round_trip() {
    // S2: tool turn then final text turn.
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_turn("tc1", "echo", r#"{"text":"hi"}"#),
        ScriptedProvider::text_reply("Tool said: hi", None),
    ]);
    let agent = Agent::new(
        AgentConfig::new("worker", provider, "m").with_tool(Arc::new(EchoTool)),
    );

    let events = collect(agent.run(RunInput::new("run the tool"))).await;
    assert_eq!(
        kinds(&events),
        vec![
            "tool_call",
            "message",
            "tool_result",
            "content",
            "message",
            "done"
        ]
    );

    match &events[2] {
        AgentEvent::ToolResult { outcome } => {
            assert_eq!(outcome.call_id, "tc1");
            assert_eq!(outcome.content, "hi");
            assert!(!outcome.is_error);
        }
        other => panic!("expected tool_result, got {other:?}"),
    }
    match &events[4] {
        AgentEvent::Message { message } => assert_eq!(message.content, "Tool said: hi"),
        other => panic!("expected message, got {other:?}"),
    }
    match events.last().unwrap() {
        AgentEvent::Done { reason, .. } => assert_eq!(*reason, FinishReason::EndTurn),
        other => panic!("expected done, got {other:?}"),
    }
}

#[tokio::test]
async fn test_n_tool_calls_produce_n_ordered_results() {
    let calls = vec![
        ToolInvocation::new("c1", "echo", r#"{"text":"one"}"#),
        ToolInvocation::new("c2", "echo", r#"{"text":"two"}"#),
        ToolInvocation::new("c3", "echo", r#"{"text":"three"}"#),
    ];
    let provider = ScriptedProvider::new(vec![
        vec![ProviderEvent::Complete {
            finish_reason: FinishReason::ToolUse,
            tool_calls: calls,
            usage: None,
        }],
        ScriptedProvider::text_reply("done", None),
    ]);
    let agent = Agent::new(
        AgentConfig::new("worker", provider, "m").with_tool(Arc::new(EchoTool)),
    );

    let events = collect(agent.run(RunInput::new("go"))).await;
    let call_ids: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolCall { invocation } => Some(invocation.id.clone()),
            _ => None,
        })
        .collect();
    let result_ids: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolResult { outcome } => Some(outcome.call_id.clone()),
            _ => None,
        })
        .collect();

    assert_eq!(call_ids, vec!["c1", "c2", "c3"]);
    assert_eq!(result_ids, call_ids);

    let contents: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolResult { outcome } => Some(outcome.content.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_unknown_tool_produces_error_outcome_and_loop_continues() {
    // S3: unknown tool name → synthetic error outcome, next turn still runs.
    let provider = ScriptedProvider::new(vec![
        vec![ProviderEvent::Complete {
            finish_reason: FinishReason::ToolUse,
            tool_calls: vec![ToolInvocation::new("x", "nonexistent", "{}")],
            usage: None,
        }],
        ScriptedProvider::text_reply("recovered", None),
    ]);
    let agent = Agent::new(AgentConfig::new("worker", provider, "m"));

    let events = collect(agent.run(RunInput::new("go"))).await;
    let outcome = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolResult { outcome } => Some(outcome.clone()),
            _ => None,
        })
        .expect("tool_result expected");
    assert!(outcome.is_error);
    assert!(outcome.content.contains("Unknown tool"));
    assert!(outcome.content.contains("nonexistent"));

    // The loop continued into a second turn.
    match events.last().unwrap() {
        AgentEvent::Done { reason, .. } => assert_eq!(*reason, FinishReason::EndTurn),
        other => panic!("expected done, got {other:?}"),
    }
    assert!(events.iter().any(
        |e| matches!(e, AgentEvent::Message { message } if message.content == "recovered")
    ));
}

#[tokio::test]
async fn test_tool_error_becomes_error_outcome() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_turn("tc1", "echo", "not json"),
        ScriptedProvider::text_reply("after", None),
    ]);
    let agent = Agent::new(
        AgentConfig::new("worker", provider, "m").with_tool(Arc::new(EchoTool)),
    );

    let events = collect(agent.run(RunInput::new("go"))).await;
    let outcome = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolResult { outcome } => Some(outcome.clone()),
            _ => None,
        })
        .expect("tool_result expected");
    assert!(outcome.is_error);
    assert!(outcome.content.contains("Invalid arguments"));
}

#[tokio::test]
async fn test_tool_message_appended_to_session_with_outcomes() {
    let session = Session::new();
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_turn("tc1", "echo", r#"{"text":"hi"}"#),
        ScriptedProvider::text_reply("done", None),
    ]);
    let agent = Agent::new(
        AgentConfig::new("worker", provider, "m").with_tool(Arc::new(EchoTool)),
    );

    let _ = collect(agent.run(RunInput::new("go").with_session(session.clone()))).await;

    let messages = session.messages();
    // user, assistant(tool call), tool, assistant, and roles in that order.
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);

    let tool_msg = &messages[2];
    let outcomes = tool_msg.tool_results.as_ref().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].content, "hi");
    assert_eq!(tool_msg.content, "hi");
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_provider_failure_emits_error_then_done_error() {
    let provider = Arc::new(FailingProvider {
        prefix: vec![ProviderEvent::ContentDelta {
            text: "partial".to_string(),
        }],
        message: "connection reset".to_string(),
    });
    let agent = Agent::new(AgentConfig::new("a", provider, "m"));

    let events = collect(agent.run(RunInput::new("p"))).await;
    assert_eq!(kinds(&events), vec!["content", "error", "done"]);
    match &events[1] {
        AgentEvent::Error { message } => assert!(message.contains("connection reset")),
        other => panic!("expected error, got {other:?}"),
    }
    match &events[2] {
        AgentEvent::Done { reason, .. } => assert_eq!(*reason, FinishReason::Error),
        other => panic!("expected done, got {other:?}"),
    }
}

#[tokio::test]
async fn test_in_band_error_event_terminates_run() {
    let provider = ScriptedProvider::new(vec![vec![
        ProviderEvent::ContentDelta {
            text: "a".to_string(),
        },
        ProviderEvent::Error {
            message: "overloaded".to_string(),
        },
    ]]);
    let agent = Agent::new(AgentConfig::new("a", provider, "m"));

    let events = collect(agent.run(RunInput::new("p"))).await;
    assert_eq!(kinds(&events), vec!["content", "error", "done"]);
    match events.last().unwrap() {
        AgentEvent::Done { reason, .. } => assert_eq!(*reason, FinishReason::Error),
        other => panic!("expected done, got {other:?}"),
    }
    // No assistant message is saved on the error path.
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::Message { .. })));
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancellation_mid_stream() {
    // S4: content then a stalled provider; cancel after 20ms.
    let provider = Arc::new(StallingProvider {
        prefix: vec![ProviderEvent::ContentDelta {
            text: "start...".to_string(),
        }],
    });
    let agent = Agent::new(AgentConfig::new("a", provider, "m"));

    let token = RunCancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let events = tokio::time::timeout(
        Duration::from_secs(2),
        collect(agent.run(RunInput::new("p").with_cancellation(token))),
    )
    .await
    .expect("run should terminate after cancellation");

    assert_eq!(kinds(&events), vec!["content", "done"]);
    match events.last().unwrap() {
        AgentEvent::Done { reason, .. } => assert_eq!(*reason, FinishReason::Canceled),
        other => panic!("expected done, got {other:?}"),
    }
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::Message { .. })));
}

#[tokio::test]
async fn test_cancel_by_session_id() {
    let provider = Arc::new(StallingProvider { prefix: vec![] });
    let agent = Arc::new(Agent::new(AgentConfig::new("a", provider, "m")));
    let session = Session::with_id("sess-cancel");

    let stream = agent.run(RunInput::new("p").with_session(session.clone()));
    let drain = tokio::spawn(collect(stream));

    // Give the run a moment to register its token, then cancel by session.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(agent.cancel("sess-cancel"));

    let events = tokio::time::timeout(Duration::from_secs(2), drain)
        .await
        .expect("run should terminate")
        .expect("drain task should not panic");
    match events.last().unwrap() {
        AgentEvent::Done { reason, .. } => assert_eq!(*reason, FinishReason::Canceled),
        other => panic!("expected done, got {other:?}"),
    }

    // The token was deregistered on completion.
    assert!(!agent.cancel("sess-cancel"));
}

#[tokio::test]
async fn test_cancelled_before_tool_execution_synthesizes_canceled_outcomes() {
    struct CancellingTool {
        token: RunCancellationToken,
    }

    #[async_trait::async_trait]
    impl Tool for CancellingTool {
        fn descriptor(&self) -> weft_contract::ToolDescriptor {
            weft_contract::ToolDescriptor::new("first", "cancels the run")
        }

        async fn execute(
            &self,
            _input: &str,
            _ctx: &ToolContext,
        ) -> Result<weft_contract::ToolOutput, weft_contract::ToolError> {
            self.token.cancel();
            Ok(weft_contract::ToolOutput::success("ok"))
        }
    }

    let token = RunCancellationToken::new();
    let provider = ScriptedProvider::new(vec![vec![ProviderEvent::Complete {
        finish_reason: FinishReason::ToolUse,
        tool_calls: vec![
            ToolInvocation::new("c1", "first", "{}"),
            ToolInvocation::new("c2", "first", "{}"),
        ],
        usage: None,
    }]]);
    let agent = Agent::new(
        AgentConfig::new("a", provider, "m").with_tool(Arc::new(CancellingTool {
            token: token.clone(),
        })),
    );

    let events = collect(agent.run(RunInput::new("p").with_cancellation(token))).await;
    let outcomes: Vec<ToolOutcome> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolResult { outcome } => Some(outcome.clone()),
            _ => None,
        })
        .collect();

    // First call ran and cancelled the token; the second was synthesized.
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].content, "ok");
    assert_eq!(outcomes[1].content, "Canceled");
    assert!(outcomes[1].is_error);
    match events.last().unwrap() {
        AgentEvent::Done { reason, .. } => assert_eq!(*reason, FinishReason::Canceled),
        other => panic!("expected done, got {other:?}"),
    }
}

// =============================================================================
// Turn budget
// =============================================================================

#[tokio::test]
async fn test_turn_exhaustion_emits_done_max_tokens() {
    let tool_turn = || ScriptedProvider::tool_call_turn("t", "echo", r#"{"text":"x"}"#);
    let provider = ScriptedProvider::new(vec![tool_turn(), tool_turn(), tool_turn()]);
    let agent = Agent::new(
        AgentConfig::new("a", provider, "m")
            .with_tool(Arc::new(EchoTool))
            .with_max_turns(2),
    );

    let events = collect(agent.run(RunInput::new("p"))).await;
    match events.last().unwrap() {
        AgentEvent::Done { reason, .. } => assert_eq!(*reason, FinishReason::MaxTokens),
        other => panic!("expected done, got {other:?}"),
    }
    let turn_count = events
        .iter()
        .filter(|e| matches!(e, AgentEvent::Message { .. }))
        .count();
    assert_eq!(turn_count, 2);
}

// =============================================================================
// Observers and session reuse
// =============================================================================

#[tokio::test]
async fn test_observers_see_every_event() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_reply("x", None)]);
    let config_log: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    let run_log: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

    let config_sink = config_log.clone();
    let agent = Agent::new(
        AgentConfig::new("a", provider, "m").with_observer(Arc::new(move |e: &AgentEvent| {
            config_sink.lock().unwrap().push(e.kind().to_string());
        })),
    );

    let run_sink = run_log.clone();
    let events = collect(agent.run(RunInput::new("p").with_observer(Arc::new(
        move |e: &AgentEvent| {
            run_sink.lock().unwrap().push(e.kind().to_string());
        },
    ))))
    .await;

    let expected: Vec<String> = events.iter().map(|e| e.kind().to_string()).collect();
    assert_eq!(*config_log.lock().unwrap(), expected);
    assert_eq!(*run_log.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_panicking_observer_does_not_break_run() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_reply("x", None)]);
    let agent = Agent::new(
        AgentConfig::new("a", provider, "m")
            .with_observer(Arc::new(|_e: &AgentEvent| panic!("observer bug"))),
    );

    let events = collect(agent.run(RunInput::new("p"))).await;
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn test_supplied_session_accumulates_history_across_runs() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::text_reply("first", None),
        ScriptedProvider::text_reply("second", None),
    ]);
    let agent = Agent::new(AgentConfig::new("a", provider.clone(), "m"));
    let session = Session::new();

    let _ = collect(agent.run(RunInput::new("one").with_session(session.clone()))).await;
    let _ = collect(agent.run(RunInput::new("two").with_session(session.clone()))).await;

    assert_eq!(session.len(), 4);

    // The second provider call saw the full history.
    let calls = provider.calls.lock().unwrap();
    assert_eq!(calls[1].len(), 3);
    assert_eq!(calls[1][0].content, "one");
    assert_eq!(calls[1][2].content, "two");
}

#[tokio::test]
async fn test_images_attached_to_user_message() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_reply("seen", None)]);
    let session = Session::new();
    let agent = Agent::new(AgentConfig::new("a", provider, "m"));

    let images = vec![ImageSource::Base64 {
        media_type: "image/png".to_string(),
        data: "aGk=".to_string(),
    }];
    let _ = collect(
        agent.run(
            RunInput::new("look")
                .with_session(session.clone())
                .with_images(images.clone()),
        ),
    )
    .await;

    let user = &session.messages()[0];
    assert_eq!(user.images.as_ref().unwrap(), &images);
}
