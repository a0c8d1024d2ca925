use tracing::{debug, warn};

use duet_protocol::{EventFrame, Frame};

use crate::state::GatewayState;

/// Delivery options for a channel broadcast.
#[derive(Debug, Default, Clone)]
pub struct BroadcastOpts {
    /// Skip this connection (e.g. the typist of a typing indicator).
    pub exclude_conn: Option<String>,
}

impl BroadcastOpts {
    pub fn excluding(conn_id: impl Into<String>) -> Self {
        Self {
            exclude_conn: Some(conn_id.into()),
        }
    }
}

/// Serialize `payload` as the next event frame.
fn event_text(state: &GatewayState, event: &str, payload: serde_json::Value) -> Option<String> {
    let frame = Frame::Event(EventFrame {
        event: event.to_string(),
        payload,
        seq: state.next_seq(),
    });
    match frame.to_text() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(event, error = %e, "failed to serialize event");
            None
        },
    }
}

/// Deliver `event` to every live connection. Returns the number of
/// connections it was handed to.
pub async fn emit_to_all(state: &GatewayState, event: &str, payload: serde_json::Value) -> usize {
    let Some(text) = event_text(state, event, payload) else {
        return 0;
    };
    let clients = state.clients.read().await;
    let delivered = clients.values().filter(|c| c.send(&text)).count();
    debug!(event, delivered, "broadcast to all");
    delivered
}

/// Deliver `event` to the connections subscribed to `channel` at call time.
///
/// Fire-and-forget: a connection whose write loop has already gone away
/// silently drops the frame.
pub async fn emit_to_channel(
    state: &GatewayState,
    channel: &str,
    event: &str,
    payload: serde_json::Value,
    opts: BroadcastOpts,
) -> usize {
    let members = state.rooms.members(channel).await;
    let targets: Vec<&String> = members
        .iter()
        .filter(|conn_id| opts.exclude_conn.as_deref() != Some(conn_id.as_str()))
        .collect();
    if targets.is_empty() {
        debug!(event, channel, "no subscribers");
        return 0;
    }

    let Some(text) = event_text(state, event, payload) else {
        return 0;
    };
    let clients = state.clients.read().await;
    let delivered = targets
        .into_iter()
        .filter_map(|conn_id| clients.get(conn_id.as_str()))
        .filter(|client| client.send(&text))
        .count();
    debug!(event, channel, delivered, "broadcast to channel");
    delivered
}
