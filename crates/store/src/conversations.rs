use {
    async_trait::async_trait,
    sqlx::SqlitePool,
    tracing::{debug, info, warn},
};

use crate::{
    Result, StoreError,
    models::{
        Conversation, ConversationRow, ConversationSummary, Message, MessageKind, MessageRow,
        ParticipantPair, SummaryRow, now_ms,
    },
};

/// Attempts at appending before a `(conversation_id, seq)` collision is surfaced.
const APPEND_ATTEMPTS: usize = 3;

/// Durable two-party conversations and their append-only message lists.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The private conversation between `a` and `b`, created if absent.
    ///
    /// Concurrent callers for the same pair always observe the same row.
    async fn find_or_create_private(&self, a: &str, b: &str) -> Result<Conversation>;

    /// Persist a message at the end of the conversation and refresh the
    /// conversation's last-message cache.
    async fn append_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message>;

    /// Page `page` (1-based, newest page first) of the conversation,
    /// delivered oldest-first.
    async fn load_history(
        &self,
        conversation_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>>;

    async fn find_between(&self, a: &str, b: &str) -> Result<Option<Conversation>>;

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>>;

    /// Chat list for `user_id`, most recently active first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConversationSummary>>;
}

// ── SQLite ───────────────────────────────────────────────────────────────────

pub struct SqliteConversationStore {
    pool: SqlitePool,
}

impl SqliteConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn find_pair(&self, pair: &ParticipantPair) -> Result<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT * FROM conversations
             WHERE participant_low = ? AND participant_high = ? AND is_group = 0",
        )
        .bind(pair.low())
        .bind(pair.high())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Insert the row for `pair`. Losing the race to a concurrent creator
    /// trips the unique index; the winner's row is returned instead.
    async fn create_pair(&self, pair: &ParticipantPair) -> Result<Conversation> {
        let now = now_ms();
        let created = sqlx::query_as::<_, ConversationRow>(
            "INSERT INTO conversations
                 (id, participant_low, participant_high, is_group, created_at, updated_at)
             VALUES (?, ?, ?, 0, ?, ?)
             RETURNING *",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(pair.low())
        .bind(pair.high())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match created {
            Ok(row) => {
                info!(
                    conversation_id = %row.id,
                    low = pair.low(),
                    high = pair.high(),
                    "conversation created"
                );
                Ok(row.into())
            },
            Err(e) if StoreError::is_unique_violation(&e) => {
                debug!(
                    low = pair.low(),
                    high = pair.high(),
                    "conversation created concurrently, re-fetching"
                );
                self.find_pair(pair).await?.ok_or_else(|| {
                    StoreError::Conflict(format!("{} and {}", pair.low(), pair.high()))
                })
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Insert at the next `seq`, stamping `max(now, newest createdAt)` in the
    /// same statement. `None` when the conversation is missing or `sender_id`
    /// is not one of its participants.
    async fn insert_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<Option<Message>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let id = uuid::Uuid::new_v4().to_string();
            let inserted = sqlx::query_as::<_, MessageRow>(
                r#"INSERT INTO messages (id, conversation_id, seq, sender_id, content, kind, created_at)
                   SELECT ?, c.id,
                          COALESCE((SELECT MAX(m.seq) FROM messages m WHERE m.conversation_id = c.id), 0) + 1,
                          ?, ?, ?,
                          MAX(?, COALESCE((SELECT MAX(m.created_at) FROM messages m WHERE m.conversation_id = c.id), 0))
                   FROM conversations c
                   WHERE c.id = ? AND ? IN (c.participant_low, c.participant_high)
                   RETURNING id, conversation_id, seq, sender_id, content, kind, created_at"#,
            )
            .bind(&id)
            .bind(sender_id)
            .bind(content)
            .bind(kind.as_str())
            .bind(now_ms())
            .bind(conversation_id)
            .bind(sender_id)
            .fetch_optional(&self.pool)
            .await;

            match inserted {
                Ok(row) => return Ok(row.map(Into::into)),
                Err(e) if StoreError::is_unique_violation(&e) && attempt < APPEND_ATTEMPTS => {
                    debug!(conversation_id, attempt, "seq collision, retrying append");
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Refresh the denormalized last-message fields. Never moves backwards:
    /// a slower writer holding an older `seq` leaves the newer cache alone.
    async fn refresh_cache(&self, message: &Message) -> Result<()> {
        sqlx::query(
            "UPDATE conversations
             SET last_message_id = ?, last_message_text = ?, last_message_at = ?,
                 message_count = ?, updated_at = MAX(updated_at, ?)
             WHERE id = ? AND message_count < ?",
        )
        .bind(&message.id)
        .bind(&message.content)
        .bind(message.created_at)
        .bind(message.seq)
        .bind(message.created_at)
        .bind(&message.conversation_id)
        .bind(message.seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn find_or_create_private(&self, a: &str, b: &str) -> Result<Conversation> {
        let pair = ParticipantPair::new(a, b).ok_or(StoreError::InvalidParticipants)?;
        if let Some(existing) = self.find_pair(&pair).await? {
            return Ok(existing);
        }
        self.create_pair(&pair).await
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message> {
        let Some(message) = self
            .insert_message(conversation_id, sender_id, content, kind)
            .await?
        else {
            return Err(match self.get_conversation(conversation_id).await? {
                None => StoreError::ConversationNotFound(conversation_id.to_string()),
                Some(_) => StoreError::NotParticipant {
                    conversation_id: conversation_id.to_string(),
                    sender_id: sender_id.to_string(),
                },
            });
        };

        // The message is committed; a stale cache is tolerated.
        if let Err(e) = self.refresh_cache(&message).await {
            warn!(
                conversation_id,
                message_id = %message.id,
                error = %e,
                "failed to refresh conversation cache"
            );
        }
        Ok(message)
    }

    async fn load_history(
        &self,
        conversation_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>> {
        if page == 0 {
            return Err(StoreError::InvalidPage("pages start at 1".into()));
        }
        if page_size == 0 {
            return Err(StoreError::InvalidPage("page size must be at least 1".into()));
        }
        let offset = i64::from(page - 1) * i64::from(page_size);

        let mut messages: Vec<Message> = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE conversation_id = ?
             ORDER BY created_at DESC, seq DESC
             LIMIT ? OFFSET ?",
        )
        .bind(conversation_id)
        .bind(i64::from(page_size))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
        messages.reverse();
        Ok(messages)
    }

    async fn find_between(&self, a: &str, b: &str) -> Result<Option<Conversation>> {
        let pair = ParticipantPair::new(a, b).ok_or(StoreError::InvalidParticipants)?;
        self.find_pair(&pair).await
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"WITH mine AS (
                   SELECT id, updated_at, last_message_id, last_message_text, last_message_at,
                          CASE WHEN participant_low = ? THEN participant_high
                               ELSE participant_low END AS contact_id
                   FROM conversations
                   WHERE is_group = 0 AND (participant_low = ? OR participant_high = ?)
               )
               SELECT mine.id, mine.updated_at, mine.last_message_text, mine.last_message_at,
                      mine.contact_id, u.name AS contact_name, u.email AS contact_email,
                      m.sender_id AS last_sender_id
               FROM mine
               LEFT JOIN users u ON u.id = mine.contact_id
               LEFT JOIN messages m ON m.id = mine.last_message_id
               ORDER BY mine.updated_at DESC, mine.id"#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn memory_store() -> SqliteConversationStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::init(&pool).await.unwrap();
        SqliteConversationStore::new(pool)
    }

    async fn count(pool: &SqlitePool, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
    }

    #[tokio::test]
    async fn find_or_create_is_order_independent() {
        let store = memory_store().await;
        let first = store.find_or_create_private("alice", "bob").await.unwrap();
        let second = store.find_or_create_private("bob", "alice").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.participant_ids, ["alice".to_string(), "bob".to_string()]);
        assert!(!first.is_group);
        assert_eq!(count(store.pool(), "SELECT COUNT(*) FROM conversations").await, 1);
    }

    #[tokio::test]
    async fn losing_the_create_race_returns_the_winner() {
        let store = memory_store().await;
        // Another writer commits the pair after our lookup came back empty.
        sqlx::query(
            "INSERT INTO conversations
                 (id, participant_low, participant_high, is_group, created_at, updated_at)
             VALUES ('winner', 'alice', 'bob', 0, 1, 1)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let pair = ParticipantPair::new("bob", "alice").unwrap();
        let conv = store.create_pair(&pair).await.unwrap();
        assert_eq!(conv.id, "winner");
        assert_eq!(conv.participant_ids, ["alice".to_string(), "bob".to_string()]);
        assert_eq!(count(store.pool(), "SELECT COUNT(*) FROM conversations").await, 1);
    }

    #[tokio::test]
    async fn rejects_degenerate_pairs() {
        let store = memory_store().await;
        assert!(matches!(
            store.find_or_create_private("alice", "alice").await,
            Err(StoreError::InvalidParticipants)
        ));
        assert!(matches!(
            store.find_or_create_private("", "bob").await,
            Err(StoreError::InvalidParticipants)
        ));
        assert_eq!(count(store.pool(), "SELECT COUNT(*) FROM conversations").await, 0);
    }

    #[tokio::test]
    async fn append_updates_cache_and_positions() {
        let store = memory_store().await;
        let conv = store.find_or_create_private("alice", "bob").await.unwrap();

        let first = store
            .append_message(&conv.id, "alice", "hi", MessageKind::Text)
            .await
            .unwrap();
        let second = store
            .append_message(&conv.id, "bob", "photo.png", MessageKind::Image)
            .await
            .unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert!(second.created_at >= first.created_at);
        assert_eq!(second.kind, MessageKind::Image);

        let conv = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(conv.message_count, 2);
        assert_eq!(conv.last_message_id.as_deref(), Some(second.id.as_str()));
        assert_eq!(conv.last_message_text.as_deref(), Some("photo.png"));
        assert_eq!(conv.last_message_at, Some(second.created_at));
    }

    #[tokio::test]
    async fn append_to_unknown_conversation_fails() {
        let store = memory_store().await;
        assert!(matches!(
            store
                .append_message("missing", "alice", "hi", MessageKind::Text)
                .await,
            Err(StoreError::ConversationNotFound(id)) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn outsiders_cannot_append() {
        let store = memory_store().await;
        let conv = store.find_or_create_private("alice", "bob").await.unwrap();
        assert!(matches!(
            store
                .append_message(&conv.id, "mallory", "hi", MessageKind::Text)
                .await,
            Err(StoreError::NotParticipant { .. })
        ));
        assert_eq!(count(store.pool(), "SELECT COUNT(*) FROM messages").await, 0);
    }

    #[tokio::test]
    async fn timestamps_never_go_backwards() {
        let store = memory_store().await;
        let conv = store.find_or_create_private("alice", "bob").await.unwrap();
        let future = now_ms() + 60_000;
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, seq, sender_id, content, kind, created_at)
             VALUES ('skewed', ?, 1, 'alice', 'from the future', 'text', ?)",
        )
        .bind(&conv.id)
        .bind(future)
        .execute(store.pool())
        .await
        .unwrap();

        let next = store
            .append_message(&conv.id, "bob", "reply", MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(next.seq, 2);
        assert_eq!(next.created_at, future);
    }

    #[tokio::test]
    async fn message_survives_a_stale_cache() {
        let store = memory_store().await;
        let conv = store.find_or_create_private("alice", "bob").await.unwrap();
        // A message committed without the follow-up cache update.
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, seq, sender_id, content, kind, created_at)
             VALUES ('orphan', ?, 1, 'alice', 'hello', 'text', ?)",
        )
        .bind(&conv.id)
        .bind(now_ms())
        .execute(store.pool())
        .await
        .unwrap();

        let stale = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(stale.message_count, 0);
        assert!(store.get_message("orphan").await.unwrap().is_some());
        let history = store.load_history(&conv.id, 1, 10).await.unwrap();
        assert_eq!(history.len(), 1);

        let next = store
            .append_message(&conv.id, "bob", "hey", MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(next.seq, 2);
        let healed = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(healed.message_count, 2);
    }

    #[tokio::test]
    async fn history_pages_newest_first_delivered_oldest_first() {
        let store = memory_store().await;
        let conv = store.find_or_create_private("alice", "bob").await.unwrap();
        for i in 1..=5 {
            store
                .append_message(&conv.id, "alice", &format!("m{i}"), MessageKind::Text)
                .await
                .unwrap();
        }

        let contents = |msgs: Vec<Message>| msgs.into_iter().map(|m| m.content).collect::<Vec<_>>();
        assert_eq!(
            contents(store.load_history(&conv.id, 1, 2).await.unwrap()),
            ["m4", "m5"]
        );
        assert_eq!(
            contents(store.load_history(&conv.id, 2, 2).await.unwrap()),
            ["m2", "m3"]
        );
        assert_eq!(
            contents(store.load_history(&conv.id, 3, 2).await.unwrap()),
            ["m1"]
        );
        assert!(store.load_history(&conv.id, 4, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_sorted_and_repeatable() {
        let store = memory_store().await;
        let conv = store.find_or_create_private("alice", "bob").await.unwrap();
        for i in 0..10 {
            let sender = if i % 2 == 0 { "alice" } else { "bob" };
            store
                .append_message(&conv.id, sender, &i.to_string(), MessageKind::Text)
                .await
                .unwrap();
        }

        let first = store.load_history(&conv.id, 1, 50).await.unwrap();
        let second = store.load_history(&conv.id, 1, 50).await.unwrap();
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert!(first.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn page_zero_is_invalid() {
        let store = memory_store().await;
        assert!(matches!(
            store.load_history("any", 0, 10).await,
            Err(StoreError::InvalidPage(_))
        ));
        assert!(matches!(
            store.load_history("any", 1, 0).await,
            Err(StoreError::InvalidPage(_))
        ));
    }

    #[tokio::test]
    async fn find_between_does_not_create() {
        let store = memory_store().await;
        assert!(store.find_between("alice", "bob").await.unwrap().is_none());
        let conv = store.find_or_create_private("alice", "bob").await.unwrap();
        let found = store.find_between("bob", "alice").await.unwrap().unwrap();
        assert_eq!(found.id, conv.id);
    }

    #[tokio::test]
    async fn chat_list_orders_by_activity_and_names_contacts() {
        let store = memory_store().await;
        sqlx::query("INSERT INTO users (id, name, email, updated_at) VALUES ('bob', 'Bob', 'bob@example.com', 0)")
            .execute(store.pool())
            .await
            .unwrap();

        let with_bob = store.find_or_create_private("alice", "bob").await.unwrap();
        let with_carol = store.find_or_create_private("carol", "alice").await.unwrap();
        store
            .append_message(&with_bob.id, "bob", "older", MessageKind::Text)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .append_message(&with_carol.id, "alice", "newer", MessageKind::Text)
            .await
            .unwrap();

        let list = store.list_for_user("alice").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].conversation_id, with_carol.id);
        assert_eq!(list[0].contact.id, "carol");
        assert_eq!(list[0].contact.name, None);
        let last = list[0].last_message.as_ref().unwrap();
        assert_eq!(last.content, "newer");
        assert_eq!(last.sender_id.as_deref(), Some("alice"));

        assert_eq!(list[1].contact.id, "bob");
        assert_eq!(list[1].contact.name.as_deref(), Some("Bob"));
        assert_eq!(list[1].contact.email.as_deref(), Some("bob@example.com"));

        assert!(store.list_for_user("dave").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_share_one_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("race.db").display());
        let pool = crate::connect(&url, 8).await.unwrap();
        let store = Arc::new(SqliteConversationStore::new(pool));

        const PER_SIDE: usize = 12;
        let tasks = (0..PER_SIDE * 2).map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let (me, them) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
                let conv = store.find_or_create_private(me, them).await.unwrap();
                store
                    .append_message(&conv.id, me, &format!("msg {i}"), MessageKind::Text)
                    .await
                    .unwrap();
                conv.id
            })
        });
        let ids: Vec<String> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(count(store.pool(), "SELECT COUNT(*) FROM conversations").await, 1);
        assert_eq!(
            count(store.pool(), "SELECT COUNT(*) FROM messages").await,
            (PER_SIDE * 2) as i64
        );

        let conv = store.get_conversation(&ids[0]).await.unwrap().unwrap();
        assert_eq!(conv.message_count, (PER_SIDE * 2) as i64);
        let history = store.load_history(&conv.id, 1, 100).await.unwrap();
        let seqs: Vec<i64> = history.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, (1..=(PER_SIDE * 2) as i64).collect::<Vec<_>>());
    }
}
