//! Online registry and the presence announcer.

use std::{collections::HashMap, sync::Arc};

use {
    tokio::{
        sync::{Notify, RwLock},
        task::JoinHandle,
    },
    tracing::{debug, warn},
};

use duet_protocol::{OnlineUser, OnlineUserList, events};

use crate::{broadcast::emit_to_all, error::GatewayError, state::GatewayState};

/// user id → connection id of the connection currently representing them.
///
/// Last writer wins per user. Removal is by connection id, so a stale
/// connection closing never evicts a newer one.
#[derive(Default)]
pub struct PresenceTracker {
    entries: RwLock<HashMap<String, String>>,
    changed: Notify,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `conn_id` as the connection for `user_id`, replacing any prior one.
    pub async fn mark_online(&self, user_id: &str, conn_id: &str) {
        let previous = self
            .entries
            .write()
            .await
            .insert(user_id.to_string(), conn_id.to_string());
        if let Some(previous) = previous.filter(|p| p != conn_id) {
            debug!(user_id, conn_id, previous = %previous, "presence handle replaced");
        }
        self.changed.notify_one();
    }

    /// Remove the entry whose handle is `conn_id`. Returns the user it
    /// represented, or `None` when that user has since moved to another
    /// connection (or never declared).
    pub async fn mark_offline(&self, conn_id: &str) -> Option<String> {
        let removed = {
            let mut entries = self.entries.write().await;
            let user_id = entries
                .iter()
                .find(|(_, handle)| handle.as_str() == conn_id)
                .map(|(user_id, _)| user_id.clone());
            if let Some(user_id) = &user_id {
                entries.remove(user_id);
            }
            user_id
        };
        self.changed.notify_one();
        removed
    }

    /// Currently online user ids, sorted.
    pub async fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn handle_for(&self, user_id: &str) -> Option<String> {
        self.entries.read().await.get(user_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Resolves after at least one change since the last call. Changes
    /// made while nobody waits collapse into one wakeup.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

// ── Announcer ────────────────────────────────────────────────────────────────

/// Snapshot the registry and enrich it with profiles, bounded by the
/// configured timeout. On failure the list goes out id-only.
pub async fn online_user_list(state: &GatewayState) -> OnlineUserList {
    let ids = state.presence.snapshot().await;
    if ids.is_empty() {
        return OnlineUserList {
            users: Vec::new(),
            degraded: false,
        };
    }

    let lookup = tokio::time::timeout(
        state.settings.enrichment_timeout,
        state.directory.profiles(&ids),
    )
    .await;
    let failure = match lookup {
        Ok(Ok(profiles)) => {
            return OnlineUserList {
                users: profiles
                    .into_iter()
                    .map(|p| OnlineUser {
                        id: p.id,
                        name: p.name,
                        email: p.email,
                    })
                    .collect(),
                degraded: false,
            };
        },
        Ok(Err(e)) => GatewayError::EnrichmentDegraded(e.to_string()),
        Err(_) => GatewayError::EnrichmentDegraded(format!(
            "profile lookup timed out after {}ms",
            state.settings.enrichment_timeout.as_millis()
        )),
    };

    warn!(online = ids.len(), error = %failure, "broadcasting id-only presence");
    OnlineUserList {
        users: ids.into_iter().map(OnlineUser::id_only).collect(),
        degraded: true,
    }
}

/// Emit the current online list to every connection.
pub async fn announce(state: &GatewayState) -> usize {
    let list = online_user_list(state).await;
    let online = list.users.len();
    let payload = match serde_json::to_value(&list) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to serialize online user list");
            return 0;
        },
    };
    let delivered = emit_to_all(state, events::ONLINE_USER_LIST, payload).await;
    debug!(online, delivered, "presence announced");
    delivered
}

/// Background task that announces presence after every change.
pub fn spawn_presence_announcer(state: Arc<GatewayState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            state.presence.changed().await;
            announce(&state).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use {
        async_trait::async_trait,
        duet_protocol::Frame,
        duet_store::{SqliteConversationStore, StoreError, UserDirectory, UserProfile},
        sqlx::sqlite::SqlitePoolOptions,
        tokio::sync::mpsc,
    };

    use {
        super::*,
        crate::{
            auth::Identity,
            state::{ConnectedClient, GatewaySettings},
        },
    };

    const ENRICHMENT_TIMEOUT: Duration = Duration::from_millis(50);

    /// Never answers within any reasonable bound.
    struct StallingDirectory;

    #[async_trait]
    impl UserDirectory for StallingDirectory {
        async fn profiles(&self, _: &[String]) -> duet_store::Result<Vec<UserProfile>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    struct FailingDirectory;

    #[async_trait]
    impl UserDirectory for FailingDirectory {
        async fn profiles(&self, _: &[String]) -> duet_store::Result<Vec<UserProfile>> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }
    }

    async fn state_with(directory: Arc<dyn UserDirectory>) -> Arc<GatewayState> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        duet_store::init(&pool).await.unwrap();
        let settings = GatewaySettings {
            enrichment_timeout: ENRICHMENT_TIMEOUT,
            ..GatewaySettings::default()
        };
        GatewayState::new(
            settings,
            Arc::new(SqliteConversationStore::new(pool)),
            directory,
        )
    }

    async fn bring_online(state: &GatewayState, user_id: &str) -> mpsc::UnboundedReceiver<String> {
        let conn_id = format!("c-{user_id}");
        let (tx, rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let identity = Identity {
            user_id: user_id.into(),
            email: None,
        };
        state
            .register_client(ConnectedClient::new(conn_id.as_str(), identity, addr, tx))
            .await;
        state.presence.mark_online(user_id, &conn_id).await;
        rx
    }

    fn assert_id_only(list: &OnlineUserList, ids: &[&str]) {
        assert!(list.degraded);
        let got: Vec<&str> = list.users.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(got, ids);
        assert!(list.users.iter().all(|u| u.name.is_none() && u.email.is_none()));
    }

    #[tokio::test]
    async fn stalled_lookup_degrades_to_ids_within_the_timeout() {
        let state = state_with(Arc::new(StallingDirectory)).await;
        let _alice = bring_online(&state, "alice").await;
        let _bob = bring_online(&state, "bob").await;

        let started = tokio::time::Instant::now();
        let list = online_user_list(&state).await;
        let elapsed = started.elapsed();

        assert_id_only(&list, &["alice", "bob"]);
        assert!(elapsed >= ENRICHMENT_TIMEOUT);
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn failed_lookup_degrades_to_ids() {
        let state = state_with(Arc::new(FailingDirectory)).await;
        let _alice = bring_online(&state, "alice").await;

        let started = tokio::time::Instant::now();
        let list = online_user_list(&state).await;

        assert_id_only(&list, &["alice"]);
        assert!(started.elapsed() < ENRICHMENT_TIMEOUT * 20);
    }

    #[tokio::test]
    async fn degraded_list_still_reaches_every_connection() {
        let state = state_with(Arc::new(StallingDirectory)).await;
        let mut alice = bring_online(&state, "alice").await;
        let mut bob = bring_online(&state, "bob").await;

        assert_eq!(announce(&state).await, 2);

        for rx in [&mut alice, &mut bob] {
            let Ok(Frame::Event(event)) = Frame::parse(&rx.try_recv().unwrap()) else {
                panic!("expected an event frame");
            };
            assert_eq!(event.event, events::ONLINE_USER_LIST);
            let list: OnlineUserList = serde_json::from_value(event.payload).unwrap();
            assert_id_only(&list, &["alice", "bob"]);
        }
    }

    #[tokio::test]
    async fn empty_registry_skips_the_lookup() {
        let state = state_with(Arc::new(StallingDirectory)).await;
        let list = online_user_list(&state).await;
        assert!(list.users.is_empty());
        assert!(!list.degraded);
    }

    #[tokio::test]
    async fn stale_handle_does_not_evict_newer_connection() {
        let presence = PresenceTracker::new();
        presence.mark_online("u", "h1").await;
        presence.mark_online("u", "h2").await;

        assert_eq!(presence.mark_offline("h1").await, None);
        assert_eq!(presence.snapshot().await, ["u"]);
        assert_eq!(presence.handle_for("u").await.as_deref(), Some("h2"));

        assert_eq!(presence.mark_offline("h2").await.as_deref(), Some("u"));
        assert!(presence.is_empty().await);
    }

    #[tokio::test]
    async fn mark_online_is_idempotent() {
        let presence = PresenceTracker::new();
        presence.mark_online("alice", "c1").await;
        presence.mark_online("alice", "c1").await;
        presence.mark_online("bob", "c2").await;
        assert_eq!(presence.len().await, 2);
        assert_eq!(presence.snapshot().await, ["alice", "bob"]);
    }

    #[tokio::test]
    async fn changes_coalesce_into_one_wakeup() {
        let presence = PresenceTracker::new();
        presence.mark_online("alice", "c1").await;
        presence.mark_online("bob", "c2").await;
        presence.mark_offline("c1").await;

        tokio::time::timeout(Duration::from_millis(100), presence.changed())
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), presence.changed())
                .await
                .is_err()
        );
        assert_eq!(presence.snapshot().await, ["bob"]);
    }

    #[tokio::test]
    async fn concurrent_updates_for_different_users() {
        let presence = Arc::new(PresenceTracker::new());
        let tasks = (0..32).map(|i| {
            let presence = Arc::clone(&presence);
            tokio::spawn(async move {
                presence
                    .mark_online(&format!("user-{i}"), &format!("conn-{i}"))
                    .await;
                if i % 2 == 0 {
                    presence.mark_offline(&format!("conn-{i}")).await;
                }
            })
        });
        for task in tasks {
            task.await.unwrap();
        }
        let online = presence.snapshot().await;
        assert_eq!(online.len(), 16);
        assert!(online.iter().all(|id| {
            let n: usize = id.trim_start_matches("user-").parse().unwrap();
            n % 2 == 1
        }));
    }
}
