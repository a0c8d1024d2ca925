//! Channel derivation and channel membership.
//!
//! A channel is the transport-level grouping for one user pair. Its id is
//! derived, never stored, and is unrelated to the durable conversation id.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::error::GatewayError;

/// Joins the two sorted ids of a channel. User ids may not contain it.
pub const CHANNEL_SEPARATOR: char = '|';

pub const MAX_USER_ID_BYTES: usize = 128;

/// Non-empty, bounded, printable, and free of [`CHANNEL_SEPARATOR`].
pub fn validate_user_id(id: &str) -> Result<(), GatewayError> {
    if id.is_empty() {
        return Err(GatewayError::invalid("user id is empty"));
    }
    if id.len() > MAX_USER_ID_BYTES {
        return Err(GatewayError::invalid(format!(
            "user id exceeds {MAX_USER_ID_BYTES} bytes"
        )));
    }
    if id.contains(CHANNEL_SEPARATOR) {
        return Err(GatewayError::invalid(format!(
            "user id may not contain '{CHANNEL_SEPARATOR}'"
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(GatewayError::invalid("user id contains control characters"));
    }
    Ok(())
}

/// Order-independent channel id for a user pair: the ids sorted bytewise
/// and joined with [`CHANNEL_SEPARATOR`].
pub fn channel_id(a: &str, b: &str) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{low}{CHANNEL_SEPARATOR}{high}")
}

// ── Membership ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Membership {
    /// channel → subscribed connections
    members: HashMap<String, HashSet<String>>,
    /// connection → joined channels
    joined: HashMap<String, HashSet<String>>,
}

/// Channel subscriptions by connection id. Never touches storage.
#[derive(Default)]
pub struct RoomRouter {
    inner: RwLock<Membership>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `conn_id` to `channel`. Returns false if already subscribed.
    pub async fn join(&self, conn_id: &str, channel: &str) -> bool {
        let mut inner = self.inner.write().await;
        let added = inner
            .members
            .entry(channel.to_string())
            .or_default()
            .insert(conn_id.to_string());
        inner
            .joined
            .entry(conn_id.to_string())
            .or_default()
            .insert(channel.to_string());
        added
    }

    /// Unsubscribe `conn_id` from `channel`. Returns false if it wasn't subscribed.
    pub async fn leave(&self, conn_id: &str, channel: &str) -> bool {
        let mut inner = self.inner.write().await;
        let removed = remove_member(&mut inner.members, channel, conn_id);
        remove_member(&mut inner.joined, conn_id, channel);
        removed
    }

    /// Drop every subscription of `conn_id`, returning the channels it had joined.
    pub async fn leave_all(&self, conn_id: &str) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let channels: Vec<String> = inner
            .joined
            .remove(conn_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for channel in &channels {
            remove_member(&mut inner.members, channel, conn_id);
        }
        channels
    }

    pub async fn members(&self, channel: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .members
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn channels_of(&self, conn_id: &str) -> Vec<String> {
        let mut channels: Vec<String> = self
            .inner
            .read()
            .await
            .joined
            .get(conn_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.read().await.members.len()
    }
}

/// Remove `value` from `map[key]`, dropping the set once empty.
fn remove_member(map: &mut HashMap<String, HashSet<String>>, key: &str, value: &str) -> bool {
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(value);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}
