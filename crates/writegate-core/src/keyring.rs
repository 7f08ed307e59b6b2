//! Signing key resolution.
//!
//! Key material is stored as text: valid hex is decoded to raw bytes, any
//! other non-empty value is used as raw bytes unchanged.

use crate::clock::Clock;
use crate::error::{ErrorClass, StoreError};
use crate::store::{to_millis, Store};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("No current signing key")]
    NoCurrentKey,

    #[error("Current key material is empty")]
    EmptyKeyMaterial,

    #[error("Key id is required")]
    MissingKeyId,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl KeyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingKeyId => ErrorClass::Client,
            _ => ErrorClass::Infrastructure,
        }
    }
}

/// A resolved key version. `Debug` never prints the material.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub kid: String,
    pub material: Vec<u8>,
}

impl fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedKey")
            .field("kid", &self.kid)
            .field("material", &format_args!("<{} bytes>", self.material.len()))
            .finish()
    }
}

/// Resolves the key used to sign and the keys accepted when verifying.
pub trait KeyResolver: Send + Sync {
    /// The newest current, active, unexpired key version.
    fn current(&self) -> Result<ResolvedKey, KeyError>;

    /// Material for `kid` if it is known and not past `valid_until`.
    fn lookup(&self, kid: &str) -> Option<Vec<u8>>;
}

/// Keys in the `signing_keys` / `signing_key_versions` tables.
#[derive(Clone)]
pub struct SqliteKeyResolver {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl SqliteKeyResolver {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Install `kid` as the current version of `signing_key_id`, demoting any
    /// earlier current version of that key.
    pub fn install(
        &self,
        signing_key_id: &str,
        kid: &str,
        material: &str,
        valid_until: Option<DateTime<Utc>>,
    ) -> Result<(), KeyError> {
        let signing_key_id = signing_key_id.trim();
        let kid = kid.trim();
        if signing_key_id.is_empty() || kid.is_empty() {
            return Err(KeyError::MissingKeyId);
        }
        if decode_material(material).is_empty() {
            return Err(KeyError::EmptyKeyMaterial);
        }
        let now = to_millis(self.clock.now());

        self.store.immediate(|conn| {
            conn.execute(
                "INSERT INTO signing_keys (id, status) VALUES (?1, 'active')
                 ON CONFLICT(id) DO NOTHING",
                params![signing_key_id],
            )
            .map_err(StoreError::from)?;
            conn.execute(
                "UPDATE signing_key_versions SET is_current = 0 WHERE signing_key_id = ?1",
                params![signing_key_id],
            )
            .map_err(StoreError::from)?;
            conn.execute(
                "INSERT INTO signing_key_versions
                     (key_id, signing_key_id, key_material, is_current, valid_from, valid_until)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                params![kid, signing_key_id, material, now, valid_until.map(to_millis)],
            )
            .map_err(StoreError::from)?;
            Ok::<_, KeyError>(())
        })?;

        tracing::info!(event = "signing_key_installed", signing_key_id, kid);
        Ok(())
    }

    /// Set the parent key's status (e.g. `retired`). Versions of a non-active
    /// key are never current.
    pub fn set_status(&self, signing_key_id: &str, status: &str) -> Result<bool, KeyError> {
        let conn = self.store.lock();
        let n = conn
            .execute(
                "UPDATE signing_keys SET status = ?2 WHERE id = ?1",
                params![signing_key_id.trim(), status],
            )
            .map_err(StoreError::from)?;
        Ok(n == 1)
    }
}

impl KeyResolver for SqliteKeyResolver {
    fn current(&self) -> Result<ResolvedKey, KeyError> {
        let now = to_millis(self.clock.now());
        let conn = self.store.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT v.key_id, v.key_material
                 FROM signing_key_versions v
                 JOIN signing_keys k ON k.id = v.signing_key_id
                 WHERE v.is_current = 1
                   AND k.status = 'active'
                   AND (v.valid_until IS NULL OR v.valid_until > ?1)
                 ORDER BY v.valid_from DESC
                 LIMIT 1",
                params![now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::from)?;

        let (kid, stored) = row.ok_or(KeyError::NoCurrentKey)?;
        let material = decode_material(&stored);
        if material.is_empty() {
            return Err(KeyError::EmptyKeyMaterial);
        }
        Ok(ResolvedKey { kid, material })
    }

    fn lookup(&self, kid: &str) -> Option<Vec<u8>> {
        let kid = kid.trim();
        if kid.is_empty() {
            return None;
        }
        let now = to_millis(self.clock.now());
        let conn = self.store.lock();
        let stored = conn
            .query_row(
                "SELECT key_material FROM signing_key_versions
                 WHERE key_id = ?1 AND (valid_until IS NULL OR valid_until > ?2)",
                params![kid, now],
                |row| row.get::<_, String>(0),
            )
            .optional();

        match stored {
            Ok(Some(stored)) => Some(decode_material(&stored)).filter(|m| !m.is_empty()),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(event = "key_lookup_failed", error = %e);
                None
            }
        }
    }
}

/// Hex-decode stored material when possible, otherwise take it verbatim.
fn decode_material(stored: &str) -> Vec<u8> {
    let s = stored.trim();
    if s.is_empty() {
        return Vec::new();
    }
    match hex::decode(s) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        _ => s.as_bytes().to_vec(),
    }
}
