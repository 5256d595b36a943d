//! End-to-end coverage spanning more than one subsystem at once: a chat
//! turn that runs the full tool-call human-in-the-loop gate against a real
//! store and connection registry, and a scheduled callback that fires
//! through the actor's own wakeup timer and reaches a registered method.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_runtime::actor::{
    spawn_actor, Agent, ActorContext, ConnectRequest, ConnectionId, ConnectionInfo, MethodRegistry,
    MethodSpec,
};
use agent_runtime::chat::{ChatEngine, ChatHandler, ChatTurnRequest};
use agent_runtime::error::AgentError;
use agent_runtime::scheduler::{ScheduleWhen, SchedulerHandle};
use agent_runtime::store::AgentStore;
use agent_wire::{MessagePart, Role, ServerFrame, ToolPartState, WireMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;

struct NoopAgent;

#[async_trait]
impl Agent for NoopAgent {}

async fn actor_context() -> Arc<ActorContext> {
    let store = AgentStore::open_in_memory().unwrap();
    let scheduler = SchedulerHandle::new(store.clone());
    Arc::new(ActorContext::new(
        "demo".into(),
        "room-1".into(),
        store,
        scheduler,
        Arc::new(NoopAgent),
    ))
}

/// Answers one tool call per turn, then waits for the handler future to be
/// driven again by nothing — the engine finalizes once the channel closes.
struct ToolCallingHandler;

#[async_trait]
impl ChatHandler for ToolCallingHandler {
    async fn on_chat_message(
        &self,
        _ctx: Arc<ActorContext>,
        _body: Option<serde_json::Value>,
        _messages: Vec<WireMessage>,
        tx: mpsc::Sender<MessagePart>,
        _cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), AgentError> {
        tx.send(MessagePart::ToolCall {
            tool_call_id: "call-1".into(),
            name: "lookup".into(),
            args: serde_json::json!({"q": "weather"}),
            state: ToolPartState::AwaitingConfirmation,
        })
        .await
        .ok();
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn tool_call_turn_halts_then_resolves_and_delivers_to_every_connection() {
    let ctx = actor_context().await;
    let (tx1, mut rx1) = mpsc::channel(8);
    let (tx2, mut rx2) = mpsc::channel(8);
    ctx.connections.insert(ConnectionInfo::new("c1".into(), tx1));
    ctx.connections.insert(ConnectionInfo::new("c2".into(), tx2));

    let engine = ChatEngine::new();
    let handler = Arc::new(ToolCallingHandler);
    engine
        .submit(
            ctx.clone(),
            handler.clone(),
            ChatTurnRequest {
                turn_id: "t1".into(),
                requesting_connection: "c1".into(),
                messages: vec![WireMessage {
                    id: "u1".into(),
                    role: Role::User,
                    parts: vec![MessagePart::Text {
                        text: "what's the weather".into(),
                    }],
                    created_at: None,
                }],
                custom_body: None,
            },
        )
        .await;

    // Both attached connections see the halted turn, not just the one that
    // submitted it: `send_turn_frame` both replies to the requester and
    // broadcasts to the registry.
    for rx in [&mut rx1, &mut rx2] {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            ServerFrame::CfAgentUseChatResponse { done, message, .. } => {
                assert!(!done);
                assert!(message.parts.iter().any(|p| matches!(
                    p,
                    MessagePart::ToolCall {
                        state: ToolPartState::AwaitingConfirmation,
                        ..
                    }
                )));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    engine
        .apply_tool_result(
            ctx.clone(),
            handler,
            "c1".into(),
            "t1",
            "call-1",
            serde_json::json!({"forecast": "sunny"}),
            false,
        )
        .await
        .unwrap();

    for rx in [&mut rx1, &mut rx2] {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            ServerFrame::CfAgentUseChatResponse { done, message, .. } => {
                assert!(done);
                assert!(message.parts.iter().any(|p| matches!(
                    p,
                    MessagePart::ToolResult { tool_call_id, .. } if tool_call_id == "call-1"
                )));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    // The log in the store now holds the user message and the resolved
    // assistant message, surviving past the in-memory engine state.
    let logged = ctx.store.list_wire_messages(None).await.unwrap();
    assert_eq!(logged.len(), 2);
}

struct SchedulingAgent {
    fired: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for SchedulingAgent {
    async fn on_start(&self, ctx: &ActorContext) -> Result<(), AgentError> {
        ctx.scheduler
            .schedule(ScheduleWhen::DelaySeconds(0), "tick", serde_json::json!({}), 0)
            .await?;
        Ok(())
    }

    fn methods(&self) -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        let fired = self.fired.clone();
        registry.register(
            "tick",
            MethodSpec {
                handler: Arc::new(move |_ctx, _args| {
                    let fired = fired.clone();
                    Box::pin(async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                        Ok(serde_json::json!(null))
                    })
                }),
                callable: false,
            },
        );
        registry
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduled_callback_fires_through_the_actor_loop() {
    let store = AgentStore::open_in_memory().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let agent = Arc::new(SchedulingAgent { fired: fired.clone() });
    let _handle = spawn_actor("demo".into(), "room-2".into(), store, agent).await;

    for _ in 0..50 {
        if fired.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/// A connection that only ever calls the registered RPC method, confirming
/// the actor loop's dispatch reaches the same `MethodRegistry` a scheduled
/// fire would use.
struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    fn methods(&self) -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        registry.register(
            "double",
            MethodSpec {
                handler: Arc::new(|_ctx, args| {
                    Box::pin(async move {
                        let n = args.as_i64().unwrap_or(0);
                        Ok(serde_json::json!(n * 2))
                    })
                }),
                callable: true,
            },
        );
        registry
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rpc_call_over_a_live_connection_reaches_the_registered_method() {
    let store = AgentStore::open_in_memory().unwrap();
    let handle = spawn_actor("demo".into(), "room-3".into(), store, Arc::new(EchoAgent)).await;
    let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
    let conn_id: ConnectionId = handle
        .connect(ConnectRequest::default(), outbound_tx)
        .await
        .unwrap();
    // Drain the `identity` + `state` sync every successful connect sends
    // before anything else (§4.2).
    assert!(matches!(
        outbound_rx.recv().await.unwrap(),
        ServerFrame::Identity { .. }
    ));
    assert!(matches!(
        outbound_rx.recv().await.unwrap(),
        ServerFrame::CfAgentState { .. }
    ));

    handle
        .send_frame(
            conn_id,
            agent_wire::ClientFrame::Rpc {
                id: "1".into(),
                method: "double".into(),
                args: serde_json::json!(21),
            },
        )
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), outbound_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match frame {
        ServerFrame::Rpc { result, error, .. } => {
            assert_eq!(result, Some(serde_json::json!(42)));
            assert!(error.is_none());
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}
