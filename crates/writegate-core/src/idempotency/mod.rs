//! Idempotency coordinator: reserve-or-replay for write endpoints.
//!
//! Provides at-most-one side effect per `(scope, key)` with:
//! - Replay of the stored response, byte for byte, once completed
//! - Conflict for duplicates racing an in-flight request
//! - Rejection of a key reused with a different request hash
//!
//! The durable uniqueness constraint on `(scope, key)` is the only
//! synchronisation point; no lock is held across calls.

mod sqlite;

pub use sqlite::SqliteIdempotencyStore;

use crate::clock::Clock;
use crate::error::{ErrorClass, StoreError};
use crate::fingerprint::log_label;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Retention used when the configured TTL is zero.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A previously computed response, returned verbatim on replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub code: u16,
    pub body: Vec<u8>,
}

/// Outcome of [`IdempotencyCoordinator::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The caller owns the key and must eventually call `complete`.
    Reserved,
    /// The key was already completed; write this response back unchanged.
    Replay(CachedResponse),
    /// Another request holds the key and has not completed yet.
    Conflict,
}

/// A live (non-expired) idempotency row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub request_hash: String,
    pub response: Option<CachedResponse>,
    pub expires_at: DateTime<Utc>,
}

/// Storage primitives the coordinator is built on.
pub trait IdempotencyStore: Send + Sync {
    /// Row for `(scope, key)` with `expires_at > now`, if any.
    fn load_active(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Delete the row for `(scope, key)` if it expired at or before `now`.
    fn delete_expired(&self, scope: &str, key: &str, now: DateTime<Utc>)
        -> Result<usize, StoreError>;

    /// Conditional insert. Returns true iff this call created (or superseded
    /// an expired) row; false when a live row already exists.
    fn insert_if_absent(
        &self,
        scope: &str,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Store the response on the row reserved with `request_hash`. Returns
    /// false when no open (or identically completed) row matched.
    fn store_response(
        &self,
        scope: &str,
        key: &str,
        request_hash: &str,
        code: u16,
        body: &[u8],
    ) -> Result<bool, StoreError>;

    /// Delete the row if it is still uncompleted and carries `request_hash`.
    fn release(&self, scope: &str, key: &str, request_hash: &str) -> Result<bool, StoreError>;

    /// Delete every row that expired at or before `now`.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Idempotency errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdempotencyError {
    #[error("Idempotency {field} is required")]
    MissingField { field: &'static str },

    #[error("Idempotency key reused with different payload")]
    KeyReusedWithDifferentPayload { scope: String },

    #[error("Invalid response code: {code}")]
    InvalidResponseCode { code: u16 },

    #[error("No open reservation in scope {scope} matches this request")]
    ReservationLost { scope: String },

    #[error("Conditional insert lost the race in scope {scope} but no live row was found")]
    ReservationVanished { scope: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IdempotencyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingField { .. } | Self::KeyReusedWithDifferentPayload { .. } => {
                ErrorClass::Client
            }
            Self::InvalidResponseCode { .. }
            | Self::ReservationLost { .. }
            | Self::ReservationVanished { .. }
            | Self::Store(_) => ErrorClass::Infrastructure,
        }
    }
}

/// Reserve-or-replay coordinator. Cheap to clone.
#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl IdempotencyCoordinator {
    /// Create a coordinator. A zero `ttl` falls back to [`DEFAULT_TTL`];
    /// anything shorter than one second is rounded up to one second.
    pub fn new(store: Arc<dyn IdempotencyStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
        Self {
            store,
            clock,
            ttl: chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Retention applied to new reservations.
    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Reserve `(scope, key)` for a request fingerprinted by `request_hash`.
    pub fn reserve(
        &self,
        scope: &str,
        key: &str,
        request_hash: &str,
    ) -> Result<Reservation, IdempotencyError> {
        let (scope, key, request_hash) = normalize(scope, key, request_hash)?;
        let now = self.clock.now();

        // Step 1: Existing live row decides on its own
        let existing = self.store.load_active(scope, key, now)?;
        if let Some(outcome) = decide(scope, existing, request_hash)? {
            self.log_outcome(scope, key, &outcome, false);
            return Ok(outcome);
        }

        // Step 2: Garbage-collect an expired row for this key (best-effort)
        if let Err(e) = self.store.delete_expired(scope, key, now) {
            tracing::warn!(event = "idempotency_gc_failed", scope, error = %e);
        }

        // Step 3: Conditional insert; the primary key arbitrates the race
        let expires_at = now + self.ttl;
        if self
            .store
            .insert_if_absent(scope, key, request_hash, now, expires_at)?
        {
            self.log_outcome(scope, key, &Reservation::Reserved, false);
            return Ok(Reservation::Reserved);
        }

        // Step 4: Lost the race. The winner's row exists now, so one reread
        // is deterministic.
        let winner = self.store.load_active(scope, key, now)?;
        match decide(scope, winner, request_hash)? {
            Some(outcome) => {
                self.log_outcome(scope, key, &outcome, true);
                Ok(outcome)
            }
            None => Err(IdempotencyError::ReservationVanished {
                scope: scope.to_string(),
            }),
        }
    }

    /// Record the response for a reservation. Calling it again with the same
    /// values is harmless.
    pub fn complete(
        &self,
        scope: &str,
        key: &str,
        request_hash: &str,
        code: u16,
        body: &[u8],
    ) -> Result<(), IdempotencyError> {
        let (scope, key, request_hash) = normalize(scope, key, request_hash)?;
        if !(100..=599).contains(&code) {
            return Err(IdempotencyError::InvalidResponseCode { code });
        }
        let body: &[u8] = if body.is_empty() { b"{}" } else { body };

        if !self
            .store
            .store_response(scope, key, request_hash, code, body)?
        {
            tracing::warn!(
                event = "idempotency_complete_unmatched",
                scope,
                key = %log_label(key)
            );
            return Err(IdempotencyError::ReservationLost {
                scope: scope.to_string(),
            });
        }

        tracing::debug!(event = "idempotency_completed", scope, key = %log_label(key), code);
        Ok(())
    }

    /// Drop an uncompleted reservation so the client may retry with the same
    /// key. Returns false when there was nothing to release.
    pub fn release(
        &self,
        scope: &str,
        key: &str,
        request_hash: &str,
    ) -> Result<bool, IdempotencyError> {
        let (scope, key, request_hash) = normalize(scope, key, request_hash)?;
        let released = self.store.release(scope, key, request_hash)?;
        tracing::debug!(event = "idempotency_released", scope, key = %log_label(key), released);
        Ok(released)
    }

    /// Remove every expired record. Only bounds storage growth.
    pub fn purge_expired(&self) -> Result<usize, IdempotencyError> {
        Ok(self.store.purge_expired(self.clock.now())?)
    }

    fn log_outcome(&self, scope: &str, key: &str, outcome: &Reservation, after_race: bool) {
        let outcome = match outcome {
            Reservation::Reserved => "reserved",
            Reservation::Replay(_) => "replay",
            Reservation::Conflict => "conflict",
        };
        tracing::debug!(
            event = "idempotency_reserve",
            scope,
            key = %log_label(key),
            outcome,
            after_race
        );
    }
}

/// The single read-and-decide step shared by the first read and the
/// post-race reread. `None` means no live row.
fn decide(
    scope: &str,
    record: Option<IdempotencyRecord>,
    request_hash: &str,
) -> Result<Option<Reservation>, IdempotencyError> {
    let Some(record) = record else {
        return Ok(None);
    };
    if record.request_hash != request_hash {
        return Err(IdempotencyError::KeyReusedWithDifferentPayload {
            scope: scope.to_string(),
        });
    }
    Ok(Some(match record.response {
        Some(cached) => Reservation::Replay(cached),
        None => Reservation::Conflict,
    }))
}

fn normalize<'a>(
    scope: &'a str,
    key: &'a str,
    request_hash: &'a str,
) -> Result<(&'a str, &'a str, &'a str), IdempotencyError> {
    let scope = scope.trim();
    let key = key.trim();
    let request_hash = request_hash.trim();
    if scope.is_empty() {
        return Err(IdempotencyError::MissingField { field: "scope" });
    }
    if key.is_empty() {
        return Err(IdempotencyError::MissingField { field: "key" });
    }
    if request_hash.is_empty() {
        return Err(IdempotencyError::MissingField {
            field: "request hash",
        });
    }
    Ok((scope, key, request_hash))
}
