use crate::error::Error;
use crate::models::{
    truncate_chars, validate_outgoing, Message, MessageStatus, MAX_GATEWAY_RESPONSE_LEN,
    MAX_GATEWAY_STATUS_LEN,
};
use chrono::{TimeDelta, Utc};
use sqlx::{query_as, SqlitePool};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../schema.sql");

const MESSAGE_COLUMNS: &str =
    "id, created, modified, destination, body, status, gateway_status, gateway_response";

/// A batch of queued messages reserved for one dispatch pass.
#[derive(Debug)]
pub struct Claim {
    pub token: Uuid,
    pub messages: Vec<Message>,
}

/// Durable FIFO queue of outbound messages.
#[derive(Debug, Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_schema(&self) -> Result<(), Error> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Drops every stored message and recreates the table. Cannot be undone.
    pub async fn reset(&self) -> Result<(), Error> {
        sqlx::query("DROP TABLE IF EXISTS messages")
            .execute(&self.pool)
            .await?;
        self.create_schema().await
    }

    #[instrument(skip(self, body))]
    pub async fn insert(&self, destination: &str, body: &str) -> Result<i64, Error> {
        validate_outgoing(destination, body)?;

        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO messages (created, modified, destination, body, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
            .bind(now)
            .bind(now)
            .bind(destination)
            .bind(body)
            .bind(MessageStatus::Queued)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        debug!(id, "Message queued.");
        Ok(id)
    }

    /// Oldest first, ties broken by id.
    pub async fn fetch_by_status(
        &self,
        status: MessageStatus,
        limit: i64,
    ) -> Result<Vec<Message>, Error> {
        check_limit(limit)?;

        let messages = query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE status = ? ORDER BY created, id LIMIT ?"
        ))
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(messages)
    }

    pub async fn fetch_all(&self, limit: i64) -> Result<Vec<Message>, Error> {
        check_limit(limit)?;

        let messages = query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY created, id LIMIT ?"
        ))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(messages)
    }

    pub async fn get(&self, id: i64) -> Result<Message, Error> {
        query_as::<_, Message>(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound(id))
    }

    /// Atomically reserves up to `limit` of the oldest queued messages.
    ///
    /// Claimed messages stay `Queued` but are skipped by other claims until
    /// their status is updated, the claim is released, or `lease` runs out.
    #[instrument(skip(self))]
    pub async fn claim_queued(&self, limit: i64, lease: Duration) -> Result<Claim, Error> {
        check_limit(limit)?;

        let lease = TimeDelta::from_std(lease)
            .map_err(|e| Error::Configuration(format!("claim lease out of range: {}", e)))?;
        let now = Utc::now();
        let token = Uuid::new_v4();

        let mut messages = query_as::<_, Message>(&format!(
            r#"
            UPDATE messages
            SET claim_token = ?, claimed_at = ?
            WHERE id IN (
                SELECT id FROM messages
                WHERE status = ? AND (claim_token IS NULL OR claimed_at < ?)
                ORDER BY created, id
                LIMIT ?
            )
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
            .bind(token)
            .bind(now)
            .bind(MessageStatus::Queued)
            .bind(now - lease)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING does not preserve the subquery order.
        messages.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));

        debug!(%token, claimed = messages.len(), "Claimed queued messages.");
        Ok(Claim { token, messages })
    }

    /// Hands still-queued messages of a claim back to the queue.
    pub async fn release_claims(&self, token: Uuid, ids: &[i64]) -> Result<u64, Error> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE messages SET claim_token = NULL, claimed_at = NULL \
             WHERE claim_token = ? AND status = ? AND id IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql).bind(token).bind(MessageStatus::Queued);
        for id in ids {
            query = query.bind(*id);
        }
        let released = query.execute(&self.pool).await?.rows_affected();

        debug!(%token, released, "Released claimed messages.");
        Ok(released)
    }

    /// Pushes the lease of one claimed message forward.
    ///
    /// Returns `false` when the message is no longer held by `token`: the
    /// lease ran out and another pass claimed it, or it already transitioned.
    pub async fn renew_claim(&self, token: Uuid, id: i64) -> Result<bool, Error> {
        let renewed = sqlx::query(
            r#"
            UPDATE messages
            SET claimed_at = ?
            WHERE id = ? AND claim_token = ? AND status = ?
            "#,
        )
            .bind(Utc::now())
            .bind(id)
            .bind(token)
            .bind(MessageStatus::Queued)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(renewed == 1)
    }

    /// Records the outcome of a dispatch attempt.
    ///
    /// Only `Queued -> SentOk | SentError` is accepted, plus rewriting a
    /// terminal status with itself, which refreshes `modified`.
    #[instrument(skip(self, gateway_response))]
    pub async fn update_status(
        &self,
        id: i64,
        status: MessageStatus,
        gateway_status: Option<&str>,
        gateway_response: Option<&str>,
    ) -> Result<(), Error> {
        self.write_status(id, status, gateway_status, gateway_response, None)
            .await
    }

    /// Records the outcome of a send made under `token`.
    ///
    /// Fails with [`Error::ClaimLost`] unless the message is still queued and
    /// held by that claim.
    #[instrument(skip(self, gateway_response))]
    pub async fn complete_claimed(
        &self,
        token: Uuid,
        id: i64,
        status: MessageStatus,
        gateway_status: Option<&str>,
        gateway_response: Option<&str>,
    ) -> Result<(), Error> {
        self.write_status(id, status, gateway_status, gateway_response, Some(token))
            .await
    }

    async fn write_status(
        &self,
        id: i64,
        status: MessageStatus,
        gateway_status: Option<&str>,
        gateway_response: Option<&str>,
        claim: Option<Uuid>,
    ) -> Result<(), Error> {
        if !status.is_terminal() {
            let current = self.current_status(id).await?;
            return Err(Error::InvalidTransition {
                id,
                from: current,
                to: status,
            });
        }

        let gateway_status = gateway_status.map(|s| truncate_chars(s, MAX_GATEWAY_STATUS_LEN));
        let gateway_response =
            gateway_response.map(|s| truncate_chars(s, MAX_GATEWAY_RESPONSE_LEN));

        let guard = match claim {
            Some(_) => "status = ? AND claim_token = ?",
            None => "(status = ? OR status = ?)",
        };
        let sql = format!(
            r#"
            UPDATE messages
            SET status = ?,
                gateway_status = ?,
                gateway_response = ?,
                modified = MAX(modified, ?),
                claim_token = NULL,
                claimed_at = NULL
            WHERE id = ? AND {guard}
            "#
        );

        let query = sqlx::query(&sql)
            .bind(status)
            .bind(gateway_status)
            .bind(gateway_response)
            .bind(Utc::now())
            .bind(id)
            .bind(MessageStatus::Queued);
        let query = match claim {
            Some(token) => query.bind(token),
            None => query.bind(status),
        };
        let updated = query.execute(&self.pool).await?.rows_affected();

        if updated == 0 {
            let current = self.current_status(id).await?;
            return Err(match claim {
                Some(_) => Error::ClaimLost(id),
                None => Error::InvalidTransition {
                    id,
                    from: current,
                    to: status,
                },
            });
        }

        Ok(())
    }

    async fn current_status(&self, id: i64) -> Result<MessageStatus, Error> {
        sqlx::query_scalar::<_, MessageStatus>("SELECT status FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound(id))
    }
}

fn check_limit(limit: i64) -> Result<(), Error> {
    if limit <= 0 {
        return Err(Error::InvalidLimit(limit));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_store() -> MessageStore {
    use sqlx::sqlite::SqlitePoolOptions;

    // A single long-lived connection keeps the in-memory database alive.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database");

    let store = MessageStore::new(pool);
    store.create_schema().await.expect("Failed to create schema");
    store
}
