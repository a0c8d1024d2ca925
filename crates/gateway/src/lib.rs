//! Gateway: WebSocket/HTTP server for live two-party messaging.
//!
//! Lifecycle of a connection:
//! 1. Handshake credential verified (`auth`); failure is a 401 before upgrade
//! 2. Client registered; intents dispatched through `methods`
//! 3. `declare-online` feeds `presence`; the announcer broadcasts the list
//! 4. `join-channel` / `leave-channel` manage `rooms` subscriptions
//! 5. `send-message` persists through `duet_store`, then fans out via `broadcast`
//! 6. On close: subscriptions dropped, presence entry removed if still current

pub mod auth;
pub mod broadcast;
pub mod error;
pub mod methods;
pub mod presence;
pub mod rooms;
pub mod server;
pub mod state;
pub mod ws;

pub use {
    auth::{Claims, Identity, SessionAuthenticator, TokenIssuer},
    error::GatewayError,
    methods::MethodRegistry,
    presence::spawn_presence_announcer,
    server::{build_gateway_app, prepare_gateway, start_gateway},
    state::{GatewaySettings, GatewayState},
};
