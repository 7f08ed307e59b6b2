//! SQLite implementation of the idempotency storage primitives.

use super::{CachedResponse, IdempotencyRecord, IdempotencyStore};
use crate::error::StoreError;
use crate::store::{from_millis, to_millis, Store};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

/// Idempotency rows in the `idempotency_keys` table.
#[derive(Clone)]
pub struct SqliteIdempotencyStore {
    store: Store,
}

impl SqliteIdempotencyStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl IdempotencyStore for SqliteIdempotencyStore {
    fn load_active(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let conn = self.store.lock();
        let row = conn
            .query_row(
                "SELECT request_hash, response_code, response_body, expires_at
                 FROM idempotency_keys
                 WHERE scope = ?1 AND idempotency_key = ?2 AND expires_at > ?3",
                params![scope, key, to_millis(now)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((request_hash, code, body, expires_at)) = row else {
            return Ok(None);
        };

        let response = match code {
            Some(code) => {
                let code = u16::try_from(code)
                    .map_err(|_| StoreError::Corrupt(format!("response code out of range: {code}")))?;
                Some(CachedResponse {
                    code,
                    body: body.unwrap_or_default(),
                })
            }
            None => None,
        };

        Ok(Some(IdempotencyRecord {
            request_hash,
            response,
            expires_at: from_millis(expires_at)?,
        }))
    }

    fn delete_expired(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.store.lock();
        let n = conn.execute(
            "DELETE FROM idempotency_keys
             WHERE scope = ?1 AND idempotency_key = ?2 AND expires_at <= ?3",
            params![scope, key, to_millis(now)],
        )?;
        Ok(n)
    }

    fn insert_if_absent(
        &self,
        scope: &str,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.store.lock();
        // An expired row is superseded in the same statement, so a failed GC
        // never blocks a fresh reservation.
        let n = conn.execute(
            "INSERT INTO idempotency_keys
                 (scope, idempotency_key, request_hash, response_code, response_body, created_at, expires_at)
             VALUES (?1, ?2, ?3, NULL, NULL, ?4, ?5)
             ON CONFLICT(scope, idempotency_key) DO UPDATE SET
                 request_hash = excluded.request_hash,
                 response_code = NULL,
                 response_body = NULL,
                 created_at = excluded.created_at,
                 expires_at = excluded.expires_at
             WHERE idempotency_keys.expires_at <= excluded.created_at",
            params![scope, key, request_hash, to_millis(now), to_millis(expires_at)],
        )?;
        Ok(n == 1)
    }

    fn store_response(
        &self,
        scope: &str,
        key: &str,
        request_hash: &str,
        code: u16,
        body: &[u8],
    ) -> Result<bool, StoreError> {
        let conn = self.store.lock();
        let n = conn.execute(
            "UPDATE idempotency_keys
             SET response_code = ?4, response_body = ?5
             WHERE scope = ?1 AND idempotency_key = ?2 AND request_hash = ?3
               AND (response_code IS NULL OR (response_code = ?4 AND response_body = ?5))",
            params![scope, key, request_hash, i64::from(code), body],
        )?;
        Ok(n == 1)
    }

    fn release(&self, scope: &str, key: &str, request_hash: &str) -> Result<bool, StoreError> {
        let conn = self.store.lock();
        let n = conn.execute(
            "DELETE FROM idempotency_keys
             WHERE scope = ?1 AND idempotency_key = ?2 AND request_hash = ?3
               AND response_code IS NULL",
            params![scope, key, request_hash],
        )?;
        Ok(n == 1)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.store.lock();
        let n = conn.execute(
            "DELETE FROM idempotency_keys WHERE expires_at <= ?1",
            params![to_millis(now)],
        )?;
        if n > 0 {
            tracing::info!(event = "idempotency_purged", rows = n);
        }
        Ok(n)
    }
}
