use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use {
    serde::de::DeserializeOwned,
    tracing::{debug, info, warn},
};

use {
    duet_protocol::{
        ChannelParams, DeclareOnlineParams, ErrorShape, NewMessageEvent, ResponseFrame, SendAck,
        SendMessageParams, TypingEvent, TypingParams, error_codes, events, intents,
    },
    duet_store::MessageKind,
};

use crate::{
    auth::Identity,
    broadcast::{BroadcastOpts, emit_to_channel},
    error::GatewayError,
    rooms::{channel_id, validate_user_id},
    state::GatewayState,
};

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every intent handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: serde_json::Value,
    pub conn_id: String,
    pub identity: Identity,
    pub state: Arc<GatewayState>,
}

/// A handler failure: the error for the response frame plus an optional
/// payload (`send-message` always carries its ack).
#[derive(Debug)]
pub struct Rejection {
    pub error: GatewayError,
    pub payload: Option<serde_json::Value>,
}

impl From<GatewayError> for Rejection {
    fn from(error: GatewayError) -> Self {
        Self {
            error,
            payload: None,
        }
    }
}

/// `Ok(None)` means the intent succeeded silently: no response frame.
pub type MethodResult = Result<Option<serde_json::Value>, Rejection>;

/// A boxed async intent handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

// ── Method registry ──────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register_defaults();
        reg
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    /// Run the handler for `ctx.method`. Returns the response frame to send
    /// back, or `None` when the intent gets no reply.
    pub async fn dispatch(&self, ctx: MethodContext) -> Option<ResponseFrame> {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.conn_id.clone();
        let user_id = ctx.identity.user_id.clone();

        let Some(handler) = self.handlers.get(&method) else {
            warn!(intent = %method, conn_id = %conn_id, user_id = %user_id, "unknown intent");
            return Some(ResponseFrame::err(
                &request_id,
                ErrorShape::new(
                    error_codes::INVALID_INTENT,
                    format!("unknown intent: {method}"),
                ),
            ));
        };

        debug!(intent = %method, request_id = %request_id, conn_id = %conn_id, "dispatching");
        match handler(ctx).await {
            Ok(None) => None,
            Ok(Some(payload)) => Some(ResponseFrame::ok(&request_id, payload)),
            Err(Rejection { error, payload }) => {
                warn!(
                    intent = %method,
                    request_id = %request_id,
                    conn_id = %conn_id,
                    user_id = %user_id,
                    code = error.code(),
                    error = %error,
                    "intent failed"
                );
                let shape = error.to_error_shape();
                Some(match payload {
                    Some(payload) => ResponseFrame::err_with_payload(&request_id, shape, payload),
                    None => ResponseFrame::err(&request_id, shape),
                })
            },
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        self.register(
            intents::DECLARE_ONLINE,
            Box::new(|ctx| Box::pin(declare_online(ctx))),
        );
        self.register(
            intents::JOIN_CHANNEL,
            Box::new(|ctx| Box::pin(join_channel(ctx))),
        );
        self.register(
            intents::LEAVE_CHANNEL,
            Box::new(|ctx| Box::pin(leave_channel(ctx))),
        );
        self.register(
            intents::SEND_MESSAGE,
            Box::new(|ctx| Box::pin(send_message(ctx))),
        );
        self.register(intents::TYPING, Box::new(|ctx| Box::pin(typing(ctx))));
    }
}

// ── Param helpers ────────────────────────────────────────────────────────────

fn parse_params<T: DeserializeOwned>(params: &serde_json::Value) -> Result<T, GatewayError> {
    let params = if params.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| GatewayError::invalid(format!("bad params: {e}")))
}

fn require(value: Option<String>, field: &str) -> Result<String, GatewayError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GatewayError::invalid(format!("missing {field}")))
}

/// A user id field that must name the authenticated caller.
fn require_self(
    ctx: &MethodContext,
    value: Option<String>,
    field: &str,
) -> Result<String, GatewayError> {
    let id = require(value, field)?;
    validate_user_id(&id)?;
    if id != ctx.identity.user_id {
        return Err(GatewayError::invalid(format!(
            "{field} does not match the authenticated user"
        )));
    }
    Ok(id)
}

fn require_other(
    value: Option<String>,
    field: &str,
    self_id: &str,
) -> Result<String, GatewayError> {
    let id = require(value, field)?;
    validate_user_id(&id)?;
    if id == self_id {
        return Err(GatewayError::invalid(format!("{field} must differ from the caller")));
    }
    Ok(id)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn declare_online(ctx: MethodContext) -> MethodResult {
    let params: DeclareOnlineParams = parse_params(&ctx.params)?;
    let user_id = require_self(&ctx, params.user_id, "userId")?;

    ctx.state.presence.mark_online(&user_id, &ctx.conn_id).await;
    info!(user_id = %user_id, conn_id = %ctx.conn_id, "user online");
    Ok(None)
}

async fn join_channel(ctx: MethodContext) -> MethodResult {
    let params: ChannelParams = parse_params(&ctx.params)?;
    let self_id = require_self(&ctx, params.self_id, "selfId")?;
    let other_id = require_other(params.other_id, "otherId", &self_id)?;

    let channel = channel_id(&self_id, &other_id);
    let added = ctx.state.rooms.join(&ctx.conn_id, &channel).await;
    ctx.state
        .set_current_channel(&ctx.conn_id, Some(channel.clone()))
        .await;
    debug!(conn_id = %ctx.conn_id, channel = %channel, added, "joined channel");
    Ok(None)
}

async fn leave_channel(ctx: MethodContext) -> MethodResult {
    let params: ChannelParams = parse_params(&ctx.params)?;
    let self_id = require_self(&ctx, params.self_id, "selfId")?;
    let other_id = require_other(params.other_id, "otherId", &self_id)?;

    let channel = channel_id(&self_id, &other_id);
    let removed = ctx.state.rooms.leave(&ctx.conn_id, &channel).await;
    // Fall back to another joined channel, or Idle.
    let remaining = ctx.state.rooms.channels_of(&ctx.conn_id).await;
    ctx.state
        .set_current_channel(&ctx.conn_id, remaining.into_iter().next())
        .await;
    debug!(conn_id = %ctx.conn_id, channel = %channel, removed, "left channel");
    Ok(None)
}

/// A validated `send-message`.
struct Outgoing {
    sender_id: String,
    recipient_id: String,
    content: String,
    kind: MessageKind,
}

fn validate_send(ctx: &MethodContext) -> Result<Outgoing, GatewayError> {
    let params: SendMessageParams = parse_params(&ctx.params)?;
    let sender_id = require_self(ctx, params.sender_id, "senderId")?;
    let recipient_id = require_other(params.recipient_id, "recipientId", &sender_id)?;
    let content = params
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| GatewayError::invalid("missing content"))?;
    let kind = match params.kind.as_deref() {
        None | Some("") => MessageKind::default(),
        Some(raw) => MessageKind::parse(raw)
            .ok_or_else(|| GatewayError::invalid(format!("unknown message kind: {raw}")))?,
    };
    Ok(Outgoing {
        sender_id,
        recipient_id,
        content,
        kind,
    })
}

fn send_failure(error: GatewayError) -> Rejection {
    let payload = serde_json::to_value(SendAck::failed(error.to_string())).ok();
    Rejection { error, payload }
}

async fn send_message(ctx: MethodContext) -> MethodResult {
    let outgoing = validate_send(&ctx).map_err(send_failure)?;
    let Outgoing {
        sender_id,
        recipient_id,
        content,
        kind,
    } = outgoing;

    // Persist on its own task: once committed, the message stays even if
    // this connection goes away or the wait below times out.
    let persist = {
        let store = Arc::clone(&ctx.state.store);
        let (sender_id, recipient_id, content) =
            (sender_id.clone(), recipient_id.clone(), content.clone());
        tokio::spawn(async move {
            let conversation = store
                .find_or_create_private(&sender_id, &recipient_id)
                .await?;
            store
                .append_message(&conversation.id, &sender_id, &content, kind)
                .await
        })
    };

    let timeout = ctx.state.settings.storage_timeout;
    let message = match tokio::time::timeout(timeout, persist).await {
        Ok(Ok(Ok(message))) => message,
        Ok(Ok(Err(e))) => return Err(send_failure(GatewayError::from(e))),
        Ok(Err(e)) => {
            return Err(send_failure(GatewayError::StorageUnavailable(format!(
                "persistence task failed: {e}"
            ))));
        },
        Err(_) => {
            return Err(send_failure(GatewayError::StorageUnavailable(format!(
                "persistence timed out after {}ms",
                timeout.as_millis()
            ))));
        },
    };

    let event = NewMessageEvent {
        id: message.id,
        conversation_id: message.conversation_id,
        sender_id,
        recipient_id,
        content: message.content,
        kind: message.kind.as_str().to_string(),
        created_at: message.created_at,
    };
    let channel = channel_id(&event.sender_id, &event.recipient_id);
    match serde_json::to_value(&event) {
        Ok(payload) => {
            let delivered = emit_to_channel(
                &ctx.state,
                &channel,
                events::NEW_MESSAGE,
                payload,
                BroadcastOpts::default(),
            )
            .await;
            info!(
                message_id = %event.id,
                conversation_id = %event.conversation_id,
                sender_id = %event.sender_id,
                channel = %channel,
                delivered,
                "message sent"
            );
        },
        Err(e) => warn!(message_id = %event.id, error = %e, "failed to serialize new-message"),
    }

    serde_json::to_value(SendAck::sent(&event))
        .map(Some)
        .map_err(|e| send_failure(GatewayError::StorageUnavailable(e.to_string())))
}

async fn typing(ctx: MethodContext) -> MethodResult {
    let params: TypingParams = parse_params(&ctx.params)?;
    let sender_id = require_self(&ctx, params.sender_id, "senderId")?;
    let recipient_id = require_other(params.recipient_id, "recipientId", &sender_id)?;
    let is_typing = params
        .is_typing
        .ok_or_else(|| GatewayError::invalid("missing isTyping"))?;

    let channel = channel_id(&sender_id, &recipient_id);
    let payload = serde_json::to_value(TypingEvent {
        sender_id,
        is_typing,
    })
    .map_err(|e| GatewayError::invalid(e.to_string()))?;
    emit_to_channel(
        &ctx.state,
        &channel,
        events::TYPING,
        payload,
        BroadcastOpts::excluding(ctx.conn_id.as_str()),
    )
    .await;
    Ok(None)
}
