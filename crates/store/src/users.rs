use std::collections::HashMap;

use {
    async_trait::async_trait,
    sqlx::{QueryBuilder, Sqlite, SqlitePool},
};

use crate::{
    Result,
    models::{UserProfile, now_ms},
};

/// Display attributes for user ids, used to enrich presence broadcasts.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// One profile per requested id, in request order. Ids without a
    /// record come back id-only.
    async fn profiles(&self, ids: &[String]) -> Result<Vec<UserProfile>>;
}

pub struct SqliteUserDirectory {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    name: Option<String>,
    email: Option<String>,
}

impl From<UserRow> for UserProfile {
    fn from(r: UserRow) -> Self {
        Self {
            id: r.id,
            name: r.name,
            email: r.email,
        }
    }
}

impl SqliteUserDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a profile.
    pub async fn upsert(&self, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO users (id, name, email, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 email = excluded.email,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&profile.id)
        .bind(&profile.name)
        .bind(&profile.email)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT id, name, email FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl UserDirectory for SqliteUserDirectory {
    async fn profiles(&self, ids: &[String]) -> Result<Vec<UserProfile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT id, name, email FROM users WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");

        let mut found: HashMap<String, UserProfile> = query
            .build_query_as::<UserRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| (row.id.clone(), row.into()))
            .collect();

        Ok(ids
            .iter()
            .map(|id| {
                found
                    .remove(id)
                    .unwrap_or_else(|| UserProfile::id_only(id.as_str()))
            })
            .collect())
    }
}
