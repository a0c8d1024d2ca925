use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use duet_protocol::{ErrorShape, Frame, RequestFrame, ResponseFrame, error_codes};

use crate::{
    auth::Identity,
    methods::{MethodContext, MethodRegistry},
    state::{ConnectedClient, GatewayState},
};

/// Drive one authenticated connection until the transport closes.
///
/// Intents from a connection are handled one at a time, in arrival order.
/// Outbound frames (responses and broadcasts) go through a per-connection
/// write task so slow sockets never block broadcasters.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    identity: Identity,
    remote_addr: SocketAddr,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let write_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let user_id = identity.user_id.clone();
    state
        .register_client(ConnectedClient::new(
            conn_id.clone(),
            identity.clone(),
            remote_addr,
            tx.clone(),
        ))
        .await;
    info!(conn_id = %conn_id, user_id = %user_id, remote = %remote_addr, "client connected");

    while let Some(incoming) = ws_rx.next().await {
        let text = match incoming {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                reply(&tx, ResponseFrame::err(
                    "",
                    ErrorShape::new(error_codes::INVALID_INTENT, "binary frames are not supported"),
                ));
                continue;
            },
            // Ping/pong are answered by the transport.
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "read failed");
                break;
            },
        };

        let request = match parse_request(text.as_str()) {
            Ok(request) => request,
            Err(response) => {
                warn!(conn_id = %conn_id, user_id = %user_id, "malformed frame");
                reply(&tx, response);
                continue;
            },
        };

        let ctx = MethodContext {
            request_id: request.id,
            method: request.method,
            params: request.params,
            conn_id: conn_id.clone(),
            identity: identity.clone(),
            state: Arc::clone(&state),
        };
        if let Some(response) = methods.dispatch(ctx).await {
            reply(&tx, response);
        }
    }

    let dropped = state.close_client(&conn_id).await;
    drop(tx);
    write_task.abort();
    info!(
        conn_id = %conn_id,
        user_id = %user_id,
        was_online = dropped.is_some(),
        "client disconnected"
    );
}

/// Only `req` frames are accepted from clients. Anything else is answered
/// with an `INVALID_INTENT` response carrying whatever `id` could be read.
fn parse_request(text: &str) -> Result<RequestFrame, ResponseFrame> {
    match Frame::parse(text) {
        Ok(Frame::Req(request)) => Ok(request),
        Ok(_) => Err(ResponseFrame::err(
            "",
            ErrorShape::new(error_codes::INVALID_INTENT, "expected a request frame"),
        )),
        Err(e) => {
            let id = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
                .unwrap_or_default();
            Err(ResponseFrame::err(
                &id,
                ErrorShape::new(error_codes::INVALID_INTENT, format!("malformed frame: {e}")),
            ))
        },
    }
}

fn reply(tx: &mpsc::UnboundedSender<String>, response: ResponseFrame) {
    match Frame::Res(response).to_text() {
        Ok(text) => {
            let _ = tx.send(text);
        },
        Err(e) => warn!(error = %e, "failed to serialize response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_request_frames() {
        let request =
            parse_request(r#"{"type":"req","id":"9","method":"typing","params":{}}"#).unwrap();
        assert_eq!(request.id, "9");
        assert_eq!(request.method, "typing");
    }

    #[test]
    fn malformed_frame_keeps_the_id() {
        let response = parse_request(r#"{"type":"req","id":"9"}"#).unwrap_err();
        assert_eq!(response.id, "9");
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_INTENT);

        let response = parse_request("{not json").unwrap_err();
        assert_eq!(response.id, "");
    }

    #[test]
    fn server_frames_are_not_requests() {
        let response = parse_request(r#"{"type":"event","event":"typing","payload":{},"seq":1}"#)
            .unwrap_err();
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_INTENT);
    }
}
