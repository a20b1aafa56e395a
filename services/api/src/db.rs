//! Data Access Layer
//!
//! Two narrow stores back the session engine: an append-only conversation log
//! used to hydrate new sessions and a per-user credential table the tool
//! services are built from. Both have a PostgreSQL implementation and an
//! in-memory one for tests and local runs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use companion_core::tools::Integration;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{IntegrationCredential, MessageRole, StoredMessage};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(
        &self,
        user_id: &str,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<()>;

    /// The user's last `limit` messages across sessions, oldest first.
    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<StoredMessage>>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credential(
        &self,
        user_id: &str,
        integration: Integration,
    ) -> Result<Option<IntegrationCredential>>;

    async fn upsert(&self, credential: IntegrationCredential) -> Result<()>;
}

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for Db {
    async fn append(
        &self,
        user_id: &str,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_messages (user_id, session_id, role, content) VALUES ($1, $2, $3, $4)",
        )
        .bind(user_id)
        .bind(session_id)
        .bind(role)
        .bind(content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let mut messages = sqlx::query_as::<_, StoredMessage>(
            r#"
            SELECT id, user_id, session_id, role, content, created_at
            FROM conversation_messages
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        messages.reverse();
        Ok(messages)
    }
}

#[async_trait]
impl CredentialStore for Db {
    async fn credential(
        &self,
        user_id: &str,
        integration: Integration,
    ) -> Result<Option<IntegrationCredential>> {
        let credential = sqlx::query_as::<_, IntegrationCredential>(
            r#"
            SELECT user_id, integration, access_token, refresh_token, expires_at
            FROM integration_credentials
            WHERE user_id = $1 AND integration = $2
            "#,
        )
        .bind(user_id)
        .bind(integration.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(credential)
    }

    async fn upsert(&self, credential: IntegrationCredential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO integration_credentials (user_id, integration, access_token, refresh_token, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, integration) DO UPDATE
            SET access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expires_at = EXCLUDED.expires_at,
                updated_at = now()
            "#,
        )
        .bind(&credential.user_id)
        .bind(&credential.integration)
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Process-local store with the same semantics as `Db`.
#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<StoredMessage>>,
    credentials: Mutex<HashMap<(String, String), IntegrationCredential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn message_count(&self) -> usize {
        self.messages.lock().await.len()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn append(
        &self,
        user_id: &str,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<()> {
        let mut messages = self.messages.lock().await;
        let id = messages.len() as i64 + 1;
        messages.push(StoredMessage {
            id,
            user_id: user_id.to_string(),
            session_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let messages = self.messages.lock().await;
        let mut recent: Vec<StoredMessage> = messages
            .iter()
            .rev()
            .filter(|m| m.user_id == user_id)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn credential(
        &self,
        user_id: &str,
        integration: Integration,
    ) -> Result<Option<IntegrationCredential>> {
        let credentials = self.credentials.lock().await;
        Ok(credentials
            .get(&(user_id.to_string(), integration.as_str().to_string()))
            .cloned())
    }

    async fn upsert(&self, credential: IntegrationCredential) -> Result<()> {
        let key = (credential.user_id.clone(), credential.integration.clone());
        self.credentials.lock().await.insert(key, credential);
        Ok(())
    }
}
