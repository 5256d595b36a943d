//! The Agent Actor (§4.1): identity, lifecycle, and the single-writer
//! message loop every mutation to an instance's state, SQL, scheduler, or
//! task tracker funnels through.
//!
//! One [`tokio::spawn`]ed task per live instance owns an [`ActorContext`]
//! and drains a fixed-priority set of inbound channels with a biased
//! `select!` — lifecycle transitions, then scheduled fires, then
//! connection frames in per-connection FIFO order, then HTTP requests —
//! exactly the ordering promised by §4.1's "Contracts" paragraph. Nothing
//! about a connection's own recv loop or a scheduler wakeup runs handler
//! code directly; they only enqueue, so two handlers for one instance can
//! never run concurrently.

pub mod connection;
pub mod context;
pub mod registry;

use std::sync::Arc;

use agent_wire::{ClientFrame, McpInfo, ServerFrame};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub use connection::{ConnectionId, ConnectionInfo};
pub use context::ActorContext;
pub use registry::{MethodHandler, MethodRegistry, MethodSpec};

use crate::chat::{ChatHandler, ChatTurnRequest};
use crate::error::AgentError;
use crate::scheduler::SchedulerHandle;
use crate::store::AgentStore;

/// Where a proposed (or applied) state change came from — mirrors the
/// `source` argument to `onStateUpdate` in §4.1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateUpdateSource {
    Server,
    Connection(ConnectionId),
}

#[derive(Clone, Debug, Default)]
pub struct ConnectRequest {
    pub path: String,
}

#[derive(Clone, Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn not_found() -> Self {
        Self {
            status: 404,
            body: Vec::new(),
        }
    }
}

/// The typed object every agent class implements. Every method has a
/// sensible default so an implementation only overrides the hooks its
/// workload actually needs — the same "implement only what you use"
/// posture the teacher's `Checkpointer<S>` trait takes for its optional
/// capabilities.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn on_start(&self, _ctx: &ActorContext) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_before_connect(
        &self,
        _ctx: &ActorContext,
        _req: &ConnectRequest,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_connect(&self, _ctx: &ActorContext, _conn_id: &ConnectionId) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_message(
        &self,
        _ctx: &ActorContext,
        _conn_id: &ConnectionId,
        _frame: ClientFrame,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_request(&self, _ctx: &ActorContext, _req: HttpRequest) -> Result<HttpResponse, AgentError> {
        Ok(HttpResponse::not_found())
    }

    async fn on_close(
        &self,
        _ctx: &ActorContext,
        _conn_id: &ConnectionId,
        _code: u16,
        _reason: String,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_error(&self, _ctx: &ActorContext, _err: &AgentError) {}

    async fn on_state_update(
        &self,
        _ctx: &ActorContext,
        _prev: serde_json::Value,
        _next: serde_json::Value,
        _source: StateUpdateSource,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn destroy(&self, _ctx: &ActorContext) {}

    /// Methods schedulable/callable-over-RPC for this class. Looked up by
    /// name rather than introspected (§9).
    fn methods(&self) -> MethodRegistry {
        MethodRegistry::new()
    }

    /// Gates whether the initial `identity`/`state`/`mcp` frames are sent
    /// right after `onConnect` returns (§4.2 "Admission" step 4). Defaults
    /// to true; an agent can override this to opt a connection out, e.g.
    /// by inspecting a query parameter on `req.path`.
    fn protocol_enabled(&self, _req: &ConnectRequest) -> bool {
        true
    }

    /// The tool registry to mirror as the optional initial `cf_agent_mcp`
    /// frame (§4.2). `None` (the default) means no MCP frame is sent; a
    /// class wiring up a tool registry overrides this to report it.
    async fn mcp_info(&self, _ctx: &ActorContext) -> Option<McpInfo> {
        None
    }

    /// The turn processor the chat subsystem drives `cf_agent_use_chat_request`
    /// / `cf_agent_tool_result` / `cf_agent_chat_clear` through. `None` (the
    /// default) means this class doesn't speak chat at all, so the actor
    /// loop ignores those frame types rather than queuing work nobody will
    /// answer.
    fn chat_handler(&self) -> Option<Arc<dyn ChatHandler>> {
        None
    }
}

enum ConnEvent {
    Connect {
        req: ConnectRequest,
        outbound: mpsc::Sender<ServerFrame>,
        reply: oneshot::Sender<Result<ConnectionId, AgentError>>,
    },
    Frame {
        conn_id: ConnectionId,
        frame: ClientFrame,
    },
    Close {
        conn_id: ConnectionId,
        code: u16,
        reason: String,
    },
}

enum LifecycleEvent {
    Destroy,
}

/// A cheap, cloneable reference to a live actor's mailbox. This, not the
/// actor task itself, is what the connection layer and the host router
/// hold on to.
#[derive(Clone)]
pub struct ActorHandle {
    lifecycle: mpsc::Sender<LifecycleEvent>,
    conn_events: mpsc::Sender<ConnEvent>,
    http: mpsc::Sender<(HttpRequest, oneshot::Sender<Result<HttpResponse, AgentError>>)>,
    method_calls: mpsc::Sender<MethodCall>,
}

type MethodCall = (
    String,
    serde_json::Value,
    oneshot::Sender<Result<serde_json::Value, AgentError>>,
);

impl ActorHandle {
    /// Admits a new connection: runs `onBeforeConnect`/`onConnect` on the
    /// actor's own execution context and returns the assigned connection
    /// id once admitted.
    pub async fn connect(
        &self,
        req: ConnectRequest,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Result<ConnectionId, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.conn_events
            .send(ConnEvent::Connect { req, outbound, reply })
            .await
            .map_err(|_| AgentError::Internal("actor mailbox closed".into()))?;
        rx.await.map_err(|_| AgentError::Internal("actor dropped connect reply".into()))?
    }

    pub async fn send_frame(&self, conn_id: ConnectionId, frame: ClientFrame) -> Result<(), AgentError> {
        self.conn_events
            .send(ConnEvent::Frame { conn_id, frame })
            .await
            .map_err(|_| AgentError::Internal("actor mailbox closed".into()))
    }

    pub async fn close(&self, conn_id: ConnectionId, code: u16, reason: String) -> Result<(), AgentError> {
        self.conn_events
            .send(ConnEvent::Close { conn_id, code, reason })
            .await
            .map_err(|_| AgentError::Internal("actor mailbox closed".into()))
    }

    pub async fn request(&self, req: HttpRequest) -> Result<HttpResponse, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.http
            .send((req, reply))
            .await
            .map_err(|_| AgentError::Internal("actor mailbox closed".into()))?;
        rx.await.map_err(|_| AgentError::Internal("actor dropped http reply".into()))?
    }

    pub async fn destroy(&self) {
        let _ = self.lifecycle.send(LifecycleEvent::Destroy).await;
    }

    /// Invokes a registered method directly, bypassing any client
    /// connection — the path an external capability (e.g. a durable-step
    /// executor reporting back through the reserved `handleWorkflowUpdate`
    /// method, §4.5) uses to call into the actor.
    pub async fn invoke_method(
        &self,
        method: impl Into<String>,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.method_calls
            .send((method.into(), args, reply))
            .await
            .map_err(|_| AgentError::Internal("actor mailbox closed".into()))?;
        rx.await.map_err(|_| AgentError::Internal("actor dropped method reply".into()))?
    }
}

const MAILBOX_CAPACITY: usize = 256;

/// How long an instance stays degraded after a failed `onStart` before the
/// loop tries it again (§4.1 "Failure semantics": "a retryable error for a
/// bounded interval, then a retry of onStart is attempted").
const ON_START_RETRY: std::time::Duration = std::time::Duration::from_secs(10);

/// Spawns the single task that will own this instance for its lifetime.
/// Runs `onStart` before returning the handle so the caller (the
/// connection/HTTP layer) never races a connection against instantiation.
/// A failing `onStart` does not stop the actor from spawning: the loop
/// starts in a degraded state that refuses inbound events with a retryable
/// error and retries `onStart` itself after a bounded interval (§4.1
/// "Failure semantics").
pub async fn spawn_actor(
    class: String,
    name: String,
    store: AgentStore,
    agent: Arc<dyn Agent>,
) -> ActorHandle {
    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(8);
    let (conn_tx, conn_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (http_tx, http_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (method_tx, method_rx) = mpsc::channel(MAILBOX_CAPACITY);

    let scheduler = SchedulerHandle::new(store.clone());
    let ctx = Arc::new(ActorContext::new(class, name, store, scheduler, agent.clone()));
    let mut methods = agent.methods();
    register_reserved_methods(&mut methods);

    let phase = match agent.on_start(&ctx).await {
        Ok(()) => StartPhase::Ready,
        Err(e) => {
            tracing::warn!(class = %ctx.class, name = %ctx.name, error = %e, "onStart failed, entering degraded state");
            let retry_at = Instant::now() + ON_START_RETRY;
            StartPhase::Degraded { retry_at, last_err: e }
        }
    };

    tokio::spawn(run_actor_loop(
        ctx, agent, methods, phase, lifecycle_rx, conn_rx, http_rx, method_rx,
    ));

    ActorHandle {
        lifecycle: lifecycle_tx,
        conn_events: conn_tx,
        http: http_tx,
        method_calls: method_tx,
    }
}

/// Registers the framework-provided methods every instance answers to
/// regardless of what the agent class itself registers — currently just
/// `handleWorkflowUpdate` (§4.5). An agent class that registers the same
/// name itself wins; the reserved handler only fills a gap.
fn register_reserved_methods(methods: &mut MethodRegistry) {
    if !methods.contains("handleWorkflowUpdate") {
        methods.register(
            "handleWorkflowUpdate",
            MethodSpec {
                handler: Arc::new(|ctx, args| {
                    Box::pin(async move {
                        let update: crate::tasks::WorkflowUpdate = serde_json::from_value(args)
                            .map_err(|e| AgentError::InvalidRequest(e.to_string()))?;
                        ctx.tasks.handle_workflow_update(&ctx, update).await?;
                        Ok(serde_json::json!(null))
                    })
                }),
                callable: false,
            },
        );
    }
}

/// `onStart` succeeded, or failed and the loop is refusing inbound events
/// until `retry_at`, when it will call `onStart` again.
enum StartPhase {
    Ready,
    Degraded { retry_at: Instant, last_err: AgentError },
}

fn degraded_error(e: &AgentError) -> AgentError {
    AgentError::Timeout(format!("actor is degraded after onStart failure, retry shortly: {e}"))
}

async fn run_actor_loop(
    ctx: Arc<ActorContext>,
    agent: Arc<dyn Agent>,
    methods: MethodRegistry,
    mut phase: StartPhase,
    mut lifecycle_rx: mpsc::Receiver<LifecycleEvent>,
    mut conn_rx: mpsc::Receiver<ConnEvent>,
    mut http_rx: mpsc::Receiver<(HttpRequest, oneshot::Sender<Result<HttpResponse, AgentError>>)>,
    mut method_rx: mpsc::Receiver<MethodCall>,
) {
    let deadline = match &phase {
        StartPhase::Degraded { retry_at, .. } => Some(*retry_at),
        StartPhase::Ready => next_wakeup(&ctx).await,
    };
    let sleep = tokio::time::sleep_until(deadline.unwrap_or_else(far_future));
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;

            Some(event) = lifecycle_rx.recv() => {
                match event {
                    LifecycleEvent::Destroy => {
                        agent.destroy(&ctx).await;
                        break;
                    }
                }
            }

            () = &mut sleep => {
                if matches!(phase, StartPhase::Degraded { .. }) {
                    match agent.on_start(&ctx).await {
                        Ok(()) => phase = StartPhase::Ready,
                        Err(e) => {
                            tracing::warn!(class = %ctx.class, name = %ctx.name, error = %e, "onStart retry failed, staying degraded");
                            phase = StartPhase::Degraded {
                                retry_at: Instant::now() + ON_START_RETRY,
                                last_err: e,
                            };
                        }
                    }
                } else {
                    fire_due_schedules(&ctx, &agent, &methods).await;
                }
            }

            Some(event) = conn_rx.recv() => {
                match &phase {
                    StartPhase::Degraded { last_err, .. } => reject_degraded(event, last_err),
                    StartPhase::Ready => handle_conn_event(&ctx, &agent, &methods, event).await,
                }
            }

            Some((req, reply)) = http_rx.recv() => {
                match &phase {
                    StartPhase::Degraded { last_err, .. } => {
                        let _ = reply.send(Err(degraded_error(last_err)));
                    }
                    StartPhase::Ready => {
                        ctx.set_current_call(context::CurrentCall {
                            connection: None,
                            request_path: Some(req.path.clone()),
                        });
                        let result = agent.on_request(&ctx, req).await;
                        if let Err(e) = &result {
                            agent.on_error(&ctx, e).await;
                        }
                        let _ = reply.send(result);
                        ctx.set_current_call(context::CurrentCall::default());
                    }
                }
            }

            Some((method, args, reply)) = method_rx.recv() => {
                match &phase {
                    StartPhase::Degraded { last_err, .. } => {
                        let _ = reply.send(Err(degraded_error(last_err)));
                    }
                    StartPhase::Ready => {
                        let result = match methods.get(&method) {
                            Some(spec) => (spec.handler)(ctx.clone(), args).await,
                            None => Err(AgentError::NotFound(format!("unknown method: {method}"))),
                        };
                        if let Err(e) = &result {
                            agent.on_error(&ctx, e).await;
                        }
                        let _ = reply.send(result);
                    }
                }
            }

            else => break,
        }

        if matches!(phase, StartPhase::Ready) {
            ctx.tasks.reap_orphans(&ctx).await;
        }
        let next = match &phase {
            StartPhase::Degraded { retry_at, .. } => Some(*retry_at),
            StartPhase::Ready => next_wakeup(&ctx).await,
        };
        sleep.as_mut().reset(next.unwrap_or_else(far_future));
    }
}

/// Refuses an inbound connection event with the retryable error §4.1
/// mandates while the actor is degraded, rather than silently dropping it.
fn reject_degraded(event: ConnEvent, last_start_err: &AgentError) {
    let err = degraded_error(last_start_err);
    match event {
        ConnEvent::Connect { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        ConnEvent::Frame { .. } => {
            tracing::warn!(error = %err, "dropping inbound frame while actor is degraded");
        }
        ConnEvent::Close { .. } => {
            // Closing is always accepted even while degraded: a connection
            // tearing down shouldn't have to wait out the retry interval.
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + std::time::Duration::from_secs(60 * 60 * 24 * 365)
}

async fn next_wakeup(ctx: &ActorContext) -> Option<Instant> {
    let earliest = ctx.scheduler.earliest_deadline().await.ok().flatten()?;
    let now = now_epoch();
    let delta = (earliest - now).max(0);
    Some(Instant::now() + std::time::Duration::from_secs(delta as u64))
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn fire_due_schedules(ctx: &Arc<ActorContext>, agent: &Arc<dyn Agent>, methods: &MethodRegistry) {
    let now = now_epoch();
    let due = match ctx.scheduler.drain_due(now).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(class = %ctx.class, name = %ctx.name, error = %e, "failed to drain due schedules");
            return;
        }
    };
    for row in due {
        match methods.get(&row.callback_method) {
            Some(spec) => {
                if let Err(e) = (spec.handler)(ctx.clone(), row.payload.clone()).await {
                    tracing::warn!(method = %row.callback_method, error = %e, "scheduled callback failed");
                    agent.on_error(ctx, &e).await;
                }
            }
            None => {
                tracing::warn!(method = %row.callback_method, "scheduled callback method not registered");
            }
        }
    }
}

async fn handle_conn_event(
    ctx: &Arc<ActorContext>,
    agent: &Arc<dyn Agent>,
    methods: &MethodRegistry,
    event: ConnEvent,
) {
    match event {
        ConnEvent::Connect { req, outbound, reply } => {
            if let Err(e) = agent.on_before_connect(ctx, &req).await {
                let _ = reply.send(Err(e));
                return;
            }
            let conn_id = uuid::Uuid::new_v4().to_string();
            ctx.connections
                .insert(ConnectionInfo::new(conn_id.clone(), outbound));
            ctx.set_current_call(context::CurrentCall {
                connection: Some(conn_id.clone()),
                request_path: Some(req.path.clone()),
            });
            let result = agent.on_connect(ctx, &conn_id).await;
            ctx.set_current_call(context::CurrentCall::default());
            match result {
                Ok(()) => {
                    if agent.protocol_enabled(&req) {
                        send_initial_frames(ctx, agent, &conn_id).await;
                    }
                    let _ = reply.send(Ok(conn_id));
                }
                Err(e) => {
                    ctx.connections.remove(&conn_id);
                    let _ = reply.send(Err(e));
                }
            }
        }
        ConnEvent::Frame { conn_id, frame } => {
            ctx.set_current_call(context::CurrentCall {
                connection: Some(conn_id.clone()),
                request_path: None,
            });
            route_frame(ctx, agent, methods, &conn_id, frame.clone()).await;
            if let Err(e) = agent.on_message(ctx, &conn_id, frame).await {
                agent.on_error(ctx, &e).await;
                ctx.connections.remove(&conn_id);
            }
            ctx.set_current_call(context::CurrentCall::default());
        }
        ConnEvent::Close { conn_id, code, reason } => {
            ctx.connections.remove(&conn_id);
            if let Err(e) = agent.on_close(ctx, &conn_id, code, reason).await {
                agent.on_error(ctx, &e).await;
            }
        }
    }
}

/// Drives the protocol's own behavior for a connection frame: the state
/// proposal (§4.2) and the whole chat subsystem (§4.4) are framework
/// concerns, not something every agent class should have to reimplement in
/// `onMessage`. `onMessage` still runs afterwards so a class can observe or
/// layer its own behavior on top, but the canonical action happens here
/// regardless of whether that hook is overridden.
async fn route_frame(
    ctx: &Arc<ActorContext>,
    agent: &Arc<dyn Agent>,
    methods: &MethodRegistry,
    conn_id: &ConnectionId,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Rpc { id, method, args } => {
            dispatch_rpc(ctx, methods, conn_id, id, method, args).await;
        }
        ClientFrame::CfAgentState { state } => {
            if let Err(e) = ctx
                .set_state(state, StateUpdateSource::Connection(conn_id.clone()))
                .await
            {
                agent.on_error(ctx, &e).await;
            }
        }
        ClientFrame::CfAgentChatMessages => match ctx.store.list_wire_messages(None).await {
            Ok(messages) => {
                ctx.connections
                    .send_to(conn_id, ServerFrame::CfAgentChatMessages { messages })
                    .await;
            }
            Err(e) => {
                let err: AgentError = e.into();
                agent.on_error(ctx, &err).await;
            }
        },
        ClientFrame::CfAgentChatClear => {
            if agent.chat_handler().is_some() {
                if let Err(e) = ctx.chat.clear(ctx).await {
                    let err: AgentError = e.into();
                    agent.on_error(ctx, &err).await;
                }
            }
        }
        ClientFrame::CfAgentChatRequestCancel { turn_id } => {
            if agent.chat_handler().is_some() {
                ctx.chat.cancel_turn(&turn_id).await;
            }
        }
        ClientFrame::CfAgentUseChatRequest {
            turn_id,
            messages,
            custom_body,
            client_tools,
        } => {
            if let Some(handler) = agent.chat_handler() {
                ctx.chat
                    .submit(
                        ctx.clone(),
                        handler,
                        ChatTurnRequest {
                            turn_id,
                            requesting_connection: conn_id.clone(),
                            messages,
                            custom_body: merge_custom_body(custom_body, client_tools),
                        },
                    )
                    .await;
            } else {
                tracing::warn!(class = %ctx.class, name = %ctx.name, "chat turn requested but no chat handler registered");
            }
        }
        ClientFrame::CfAgentToolResult {
            turn_id,
            tool_call_id,
            tool_name,
            result,
            auto_continue,
        } => {
            if let Some(handler) = agent.chat_handler() {
                if let Err(e) = ctx
                    .chat
                    .apply_tool_result(
                        ctx.clone(),
                        handler,
                        conn_id.clone(),
                        &turn_id,
                        &tool_call_id,
                        result,
                        auto_continue,
                    )
                    .await
                {
                    let err: AgentError = e.into();
                    agent.on_error(ctx, &err).await;
                }
            } else {
                tracing::warn!(class = %ctx.class, name = %ctx.name, tool_name = %tool_name, "tool result delivered but no chat handler registered");
            }
        }
    }
}

/// Folds a request's `clientTools` declaration into its `customBody` so the
/// single `ChatTurnRequest::custom_body` slot carries both (§4.4's
/// `init.body`); the wire frame keeps them as separate fields because a
/// client sends them independently.
fn merge_custom_body(
    custom_body: Option<serde_json::Value>,
    client_tools: Option<serde_json::Value>,
) -> Option<serde_json::Value> {
    match (custom_body, client_tools) {
        (None, None) => None,
        (Some(body), None) => Some(body),
        (None, Some(tools)) => Some(serde_json::json!({ "clientTools": tools })),
        (Some(mut body), Some(tools)) => {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("clientTools".to_string(), tools);
            }
            Some(body)
        }
    }
}

/// Sends the connect-time sync (§4.2 "Initial frames"): `identity`, the
/// current `state` row, and an optional `mcp` mirror. Sent once, right
/// after `onConnect` returns and before the connect reply unblocks the
/// caller, so a client never sees runtime frames before these.
async fn send_initial_frames(ctx: &Arc<ActorContext>, agent: &Arc<dyn Agent>, conn_id: &ConnectionId) {
    ctx.connections
        .send_to(
            conn_id,
            ServerFrame::Identity {
                class: ctx.class.clone(),
                name: ctx.name.clone(),
            },
        )
        .await;
    match ctx.get_state().await {
        Ok(state) => {
            ctx.connections
                .send_to(conn_id, ServerFrame::CfAgentState { state })
                .await;
        }
        Err(e) => {
            tracing::warn!(class = %ctx.class, name = %ctx.name, error = %e, "failed to read state for initial sync");
        }
    }
    if let Some(mcp) = agent.mcp_info(ctx).await {
        ctx.connections
            .send_to(conn_id, ServerFrame::CfAgentMcp { mcp })
            .await;
    }
}

async fn dispatch_rpc(
    ctx: &Arc<ActorContext>,
    methods: &MethodRegistry,
    conn_id: &ConnectionId,
    id: String,
    method: String,
    args: serde_json::Value,
) {
    let frame = match methods.get(&method) {
        Some(spec) if spec.callable => match (spec.handler)(ctx.clone(), args).await {
            Ok(result) => ServerFrame::Rpc {
                id,
                result: Some(result),
                error: None,
            },
            Err(e) => ServerFrame::Rpc {
                id,
                result: None,
                error: Some(e.to_string()),
            },
        },
        Some(_) => ServerFrame::Rpc {
            id,
            result: None,
            error: Some(format!("method not callable: {method}")),
        },
        None => ServerFrame::Rpc {
            id,
            result: None,
            error: Some(format!("unknown method: {method}")),
        },
    };
    ctx.connections.send_to(conn_id, frame).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Drains the `identity` + `state` frames every successful connect now
    /// sends before anything else (§4.2), so tests can get straight to the
    /// frame they actually care about.
    async fn drain_initial_frames(rx: &mut mpsc::Receiver<ServerFrame>) {
        assert!(matches!(rx.recv().await.unwrap(), ServerFrame::Identity { .. }));
        assert!(matches!(rx.recv().await.unwrap(), ServerFrame::CfAgentState { .. }));
    }

    struct EchoAgent {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Agent for EchoAgent {
        async fn on_connect(&self, _ctx: &ActorContext, _conn_id: &ConnectionId) -> Result<(), AgentError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn methods(&self) -> MethodRegistry {
            let mut registry = MethodRegistry::new();
            registry.register(
                "ping",
                MethodSpec {
                    handler: Arc::new(|_ctx, _args| Box::pin(async { Ok(serde_json::json!("pong")) })),
                    callable: true,
                },
            );
            registry
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_then_rpc_roundtrip() {
        let store = AgentStore::open_in_memory().unwrap();
        let agent = Arc::new(EchoAgent {
            connects: AtomicUsize::new(0),
        });
        let handle = spawn_actor("demo".into(), "x".into(), store, agent.clone()).await;
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
        let conn_id = handle
            .connect(ConnectRequest::default(), outbound_tx)
            .await
            .unwrap();
        assert_eq!(agent.connects.load(Ordering::SeqCst), 1);
        drain_initial_frames(&mut outbound_rx).await;

        handle
            .send_frame(
                conn_id,
                ClientFrame::Rpc {
                    id: "1".into(),
                    method: "ping".into(),
                    args: serde_json::json!(null),
                },
            )
            .await
            .unwrap();
        let frame = outbound_rx.recv().await.unwrap();
        match frame {
            ServerFrame::Rpc { result, error, .. } => {
                assert_eq!(result, Some(serde_json::json!("pong")));
                assert!(error.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_rpc_method_returns_error_not_panic() {
        let store = AgentStore::open_in_memory().unwrap();
        let agent = Arc::new(EchoAgent {
            connects: AtomicUsize::new(0),
        });
        let handle = spawn_actor("demo".into(), "x".into(), store, agent).await;
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
        let conn_id = handle
            .connect(ConnectRequest::default(), outbound_tx)
            .await
            .unwrap();
        drain_initial_frames(&mut outbound_rx).await;
        handle
            .send_frame(
                conn_id,
                ClientFrame::Rpc {
                    id: "1".into(),
                    method: "missing".into(),
                    args: serde_json::json!(null),
                },
            )
            .await
            .unwrap();
        let frame = outbound_rx.recv().await.unwrap();
        match frame {
            ServerFrame::Rpc { error, .. } => assert!(error.is_some()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    struct HangingTask;
    #[async_trait]
    impl crate::tasks::TaskHandler for HangingTask {
        async fn run(
            &self,
            _ctx: Arc<ActorContext>,
            _task: crate::tasks::TaskContext,
            _input: serde_json::Value,
        ) -> Result<serde_json::Value, AgentError> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(serde_json::json!(null))
        }
    }

    struct TaskStartingAgent;
    #[async_trait]
    impl Agent for TaskStartingAgent {
        fn methods(&self) -> MethodRegistry {
            let mut registry = MethodRegistry::new();
            registry.register(
                "startTask",
                MethodSpec {
                    handler: Arc::new(|ctx, _args| {
                        Box::pin(async move {
                            let id = ctx
                                .tasks
                                .start(
                                    ctx.clone(),
                                    Arc::new(HangingTask),
                                    "review".into(),
                                    serde_json::json!({}),
                                    true,
                                    None,
                                    Arc::new(crate::tasks::EphemeralExecutor),
                                    None,
                                )
                                .await?;
                            Ok(serde_json::json!(id))
                        })
                    }),
                    callable: true,
                },
            );
            registry
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invoke_method_reaches_the_reserved_workflow_update_handler() {
        let store = AgentStore::open_in_memory().unwrap();
        let handle = spawn_actor("demo".into(), "x".into(), store, Arc::new(TaskStartingAgent)).await;
        let (tx, mut rx) = mpsc::channel(8);
        let conn_id = handle.connect(ConnectRequest::default(), tx).await.unwrap();
        drain_initial_frames(&mut rx).await;
        handle
            .send_frame(
                conn_id,
                ClientFrame::Rpc {
                    id: "1".into(),
                    method: "startTask".into(),
                    args: serde_json::json!(null),
                },
            )
            .await
            .unwrap();
        let task_id = match rx.recv().await.unwrap() {
            ServerFrame::Rpc { result: Some(v), .. } => v.as_str().unwrap().to_string(),
            other => panic!("unexpected frame: {other:?}"),
        };

        let result = handle
            .invoke_method(
                "handleWorkflowUpdate",
                serde_json::json!({"task_id": task_id, "progress": 50}),
            )
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(null));

        // The mirror is visible as an ordinary state broadcast to every
        // attached connection.
        let frame = rx.recv().await.unwrap();
        match frame {
            ServerFrame::CfAgentState { state } => {
                assert_eq!(state["tasks"][task_id.as_str()]["progress"], serde_json::json!(50));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invoke_method_unknown_name_errors_without_panicking() {
        let store = AgentStore::open_in_memory().unwrap();
        let handle = spawn_actor("demo".into(), "x".into(), store, Arc::new(TaskStartingAgent)).await;
        let err = handle
            .invoke_method("notRegistered", serde_json::json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    struct FlakyStartAgent {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Agent for FlakyStartAgent {
        async fn on_start(&self, _ctx: &ActorContext) -> Result<(), AgentError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AgentError::Internal("cold cache unreachable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", start_paused = true)]
    async fn failed_onstart_degrades_then_recovers_on_retry() {
        let store = AgentStore::open_in_memory().unwrap();
        let agent = Arc::new(FlakyStartAgent {
            calls: AtomicUsize::new(0),
        });
        let handle = spawn_actor("demo".into(), "x".into(), store, agent.clone()).await;
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

        let (tx, _rx) = mpsc::channel(4);
        let err = handle
            .connect(ConnectRequest::default(), tx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));

        tokio::time::advance(ON_START_RETRY + std::time::Duration::from_secs(1)).await;

        let conn_id = handle.connect(ConnectRequest::default(), tx).await.unwrap();
        assert!(!conn_id.is_empty());
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    }
}
