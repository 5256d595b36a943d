//! The Chat Subsystem (§4.4): a serialized turn queue, an append-only
//! streaming message log, a tool-call human-in-the-loop gate, and
//! resumable output for reconnecting clients.

mod log;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use agent_wire::{MessagePart, Role, ServerFrame, WireMessage};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::actor::{ActorContext, ConnectionId};
use crate::error::{AgentError, ChatError};

pub use log::{find_awaiting_tool_call, resolve_tool_call};

#[derive(Clone, Debug)]
pub struct ChatTurnRequest {
    pub turn_id: String,
    pub requesting_connection: ConnectionId,
    pub messages: Vec<WireMessage>,
    /// Everything besides `messages`/`clientTools` from the request body.
    /// `None` clears the previously stored body (§4.4 step 2).
    pub custom_body: Option<serde_json::Value>,
}

/// The workload-supplied turn processor. `tx` carries message parts as
/// they are produced; the engine persists and broadcasts each one as it
/// arrives and finalizes the turn once the handler returns. This is the
/// "typed async sequence with explicit next()/close()" the design notes
/// call for, realized as a bounded channel.
#[async_trait]
pub trait ChatHandler: Send + Sync {
    async fn on_chat_message(
        &self,
        ctx: Arc<ActorContext>,
        body: Option<serde_json::Value>,
        messages: Vec<WireMessage>,
        tx: mpsc::Sender<MessagePart>,
        cancel: CancellationToken,
    ) -> Result<(), AgentError>;
}

struct EngineState {
    queue: VecDeque<ChatTurnRequest>,
    processing: bool,
    stored_body: Option<serde_json::Value>,
    /// Assistant message id of a turn halted on the HITL gate, keyed by
    /// the turn that produced it, so a later `cf_agent_tool_result` can
    /// find it.
    halted_turns: HashMap<String, String>,
    cancel_tokens: HashMap<String, CancellationToken>,
    /// Assistant message id of every turn still streaming or halted,
    /// keyed by turn id. Entries are removed once a `done: true` frame is
    /// sent for that turn — while an entry lives here, a reconnecting
    /// client can catch up on it (§4.4 "Resumable streams").
    active_turns: HashMap<String, String>,
}

/// One chat engine per agent instance. Cheap to clone — internal state is
/// behind a `Mutex`, and only the owning actor ever calls in, matching the
/// single-writer invariant; the mutex exists so the background drain task
/// and the actor's own calls (cancel, clear) can both reach it safely.
#[derive(Clone)]
pub struct ChatEngine {
    state: Arc<Mutex<EngineState>>,
}

impl ChatEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState {
                queue: VecDeque::new(),
                processing: false,
                stored_body: None,
                halted_turns: HashMap::new(),
                cancel_tokens: HashMap::new(),
                active_turns: HashMap::new(),
            })),
        }
    }

    /// Enqueues a turn. Requests are processed strictly in the order they
    /// are submitted; if nothing is in flight, this call kicks off the
    /// drain loop in the background so the caller (the actor's frame
    /// handler) is not blocked for the turn's whole duration.
    ///
    /// A request that names a `turn_id` already in flight (or halted on
    /// the HITL gate) and carries no new messages is treated as a resume:
    /// a reconnecting client re-sends `cf_agent_use_chat_request` with the
    /// turn id it was last following and an empty `messages`, and gets the
    /// accumulated parts delivered as a single catch-up frame to just that
    /// connection rather than being enqueued as a new turn. Once caught
    /// up, the connection is already registered and receives every further
    /// chunk the same way every other attached connection does, so the
    /// turn "continues live" without any separate subscription step.
    pub async fn submit(&self, ctx: Arc<ActorContext>, handler: Arc<dyn ChatHandler>, req: ChatTurnRequest) {
        if req.messages.is_empty() && self.try_resume(&ctx, &req.requesting_connection, &req.turn_id).await {
            return;
        }

        let start = {
            let mut state = self.state.lock().await;
            state.queue.push_back(req);
            if state.processing {
                false
            } else {
                state.processing = true;
                true
            }
        };
        if start {
            let engine = self.clone();
            tokio::spawn(async move { engine.drain(ctx, handler).await });
        }
    }

    /// Delivers the current state of an in-flight or halted turn to one
    /// connection. Returns `false` (and does nothing) when `turn_id` isn't
    /// active, so the caller can fall back to submitting it as a new turn.
    async fn try_resume(&self, ctx: &Arc<ActorContext>, requester: &ConnectionId, turn_id: &str) -> bool {
        let assistant_id = {
            let state = self.state.lock().await;
            match state.active_turns.get(turn_id) {
                Some(id) => id.clone(),
                None => return false,
            }
        };
        let messages = match ctx.store.list_wire_messages(None).await {
            Ok(m) => m,
            Err(_) => return false,
        };
        let Some(assistant) = messages.into_iter().find(|m| m.id == assistant_id) else {
            return false;
        };
        let frame = ServerFrame::CfAgentUseChatResponse {
            turn_id: turn_id.to_string(),
            message: assistant,
            done: false,
        };
        ctx.connections.send_to(requester, frame).await;
        true
    }

    async fn drain(&self, ctx: Arc<ActorContext>, handler: Arc<dyn ChatHandler>) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                match state.queue.pop_front() {
                    Some(req) => Some(req),
                    None => {
                        state.processing = false;
                        None
                    }
                }
            };
            let req = match next {
                Some(r) => r,
                None => break,
            };
            self.process_turn(&ctx, handler.as_ref(), req).await;
        }
    }

    async fn process_turn(&self, ctx: &Arc<ActorContext>, handler: &dyn ChatHandler, req: ChatTurnRequest) {
        let now = chrono::Utc::now().timestamp();
        for message in &req.messages {
            if matches!(message.role, Role::User) {
                let _ = ctx.store.append_wire_message_if_absent(message, now).await;
            }
        }

        let body = {
            let mut state = self.state.lock().await;
            state.stored_body = req.custom_body.clone();
            state.stored_body.clone()
        };

        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock().await;
            state.cancel_tokens.insert(req.turn_id.clone(), cancel.clone());
        }

        let assistant_id = format!("{}-assistant", req.turn_id);
        let mut assistant = WireMessage {
            id: assistant_id.clone(),
            role: Role::Assistant,
            parts: Vec::new(),
            created_at: Some(now.to_string()),
        };
        let _ = ctx
            .store
            .append_wire_message_if_absent(&assistant, now)
            .await;
        {
            let mut state = self.state.lock().await;
            state.active_turns.insert(req.turn_id.clone(), assistant_id.clone());
        }

        let (tx, mut rx) = mpsc::channel::<MessagePart>(32);
        let handler_fut = handler.on_chat_message(ctx.clone(), body, req.messages.clone(), tx, cancel.clone());
        tokio::pin!(handler_fut);

        let mut handler_done = false;
        let mut handler_result: Result<(), AgentError> = Ok(());
        loop {
            tokio::select! {
                maybe_part = rx.recv() => {
                    match maybe_part {
                        Some(part) => {
                            assistant.parts.push(part);
                            let _ = ctx.store.replace_wire_message(&assistant).await;
                            self.send_turn_frame(ctx, &req.requesting_connection, &req.turn_id, &assistant, false).await;
                        }
                        // The handler dropped its sender once its future
                        // resolved, so a `None` here is the turn's true end.
                        None => break,
                    }
                }
                result = &mut handler_fut, if !handler_done => {
                    handler_done = true;
                    handler_result = result;
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            state.cancel_tokens.remove(&req.turn_id);
        }

        if let Err(e) = handler_result {
            assistant.parts.push(MessagePart::Text {
                text: format!("error: {e}"),
            });
            let _ = ctx.store.replace_wire_message(&assistant).await;
            self.send_turn_frame(ctx, &req.requesting_connection, &req.turn_id, &assistant, true).await;
            self.retire_turn(&req.turn_id).await;
            return;
        }

        if cancel.is_cancelled() {
            self.send_turn_frame(ctx, &req.requesting_connection, &req.turn_id, &assistant, true).await;
            self.retire_turn(&req.turn_id).await;
            return;
        }

        let awaiting = find_awaiting_tool_call_in(&assistant).is_some();
        if awaiting {
            let mut state = self.state.lock().await;
            state.halted_turns.insert(req.turn_id.clone(), assistant.id.clone());
        } else {
            self.send_turn_frame(ctx, &req.requesting_connection, &req.turn_id, &assistant, true).await;
            self.retire_turn(&req.turn_id).await;
        }
    }

    /// Drops bookkeeping for a turn once a `done: true` frame has gone out
    /// for it — after this, `try_resume` no longer has anything to offer a
    /// reconnecting client, so a same-id resend is treated as a fresh turn.
    async fn retire_turn(&self, turn_id: &str) {
        let mut state = self.state.lock().await;
        state.active_turns.remove(turn_id);
    }

    async fn send_turn_frame(
        &self,
        ctx: &Arc<ActorContext>,
        requester: &ConnectionId,
        turn_id: &str,
        message: &WireMessage,
        done: bool,
    ) {
        let frame = ServerFrame::CfAgentUseChatResponse {
            turn_id: turn_id.to_string(),
            message: message.clone(),
            done,
        };
        ctx.connections.send_to(requester, frame.clone()).await;
        ctx.connections.broadcast_except(requester, frame).await;
    }

    pub async fn cancel_turn(&self, turn_id: &str) -> bool {
        let state = self.state.lock().await;
        match state.cancel_tokens.get(turn_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// `cf_agent_tool_result`: resolves the matching tool-call part on the
    /// halted assistant message and, if `auto_continue`, enqueues a
    /// continuation turn reusing the stored chat body.
    pub async fn apply_tool_result(
        &self,
        ctx: Arc<ActorContext>,
        handler: Arc<dyn ChatHandler>,
        requesting_connection: ConnectionId,
        turn_id: &str,
        tool_call_id: &str,
        result: serde_json::Value,
        auto_continue: bool,
    ) -> Result<(), ChatError> {
        let assistant_id = {
            let state = self.state.lock().await;
            state
                .halted_turns
                .get(turn_id)
                .cloned()
                .ok_or_else(|| ChatError::NoMatchingToolCall(tool_call_id.to_string()))?
        };
        let messages = ctx.store.list_wire_messages(None).await?;
        let mut assistant = messages
            .into_iter()
            .find(|m| m.id == assistant_id)
            .ok_or_else(|| ChatError::NoMatchingToolCall(tool_call_id.to_string()))?;
        resolve_tool_call(&mut assistant, tool_call_id, result)?;
        ctx.store.replace_wire_message(&assistant).await?;
        self.send_turn_frame(&ctx, &requesting_connection, turn_id, &assistant, true)
            .await;

        {
            let mut state = self.state.lock().await;
            state.halted_turns.remove(turn_id);
            state.active_turns.remove(turn_id);
        }

        if auto_continue {
            let body = {
                let state = self.state.lock().await;
                state.stored_body.clone()
            };
            let messages = ctx.store.list_wire_messages(None).await?;
            self.submit(
                ctx,
                handler,
                ChatTurnRequest {
                    turn_id: format!("{turn_id}-cont"),
                    requesting_connection,
                    messages,
                    custom_body: body,
                },
            )
            .await;
        }
        Ok(())
    }

    /// `cf_agent_chat_clear`: truncates the log, clears the stored body,
    /// cancels anything in flight, and drains the pending queue.
    pub async fn clear(&self, ctx: &Arc<ActorContext>) -> Result<(), ChatError> {
        ctx.store.clear_messages().await?;
        let mut state = self.state.lock().await;
        state.stored_body = None;
        state.halted_turns.clear();
        state.active_turns.clear();
        for (_, token) in state.cancel_tokens.drain() {
            token.cancel();
        }
        state.queue.clear();
        Ok(())
    }
}

impl Default for ChatEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn find_awaiting_tool_call_in(message: &WireMessage) -> Option<&MessagePart> {
    message.parts.iter().find(|part| {
        matches!(
            part,
            MessagePart::ToolCall {
                state: agent_wire::ToolPartState::AwaitingConfirmation,
                ..
            }
        )
    })
}
