//! Token and session revocation.
//!
//! A subject is revoked as of `now` iff a row exists with `expires_at > now`.
//! Revoking again never shortens a ban: the stored expiry is the maximum of
//! the old and the new one.

use crate::clock::Clock;
use crate::error::{ErrorClass, StoreError};
use crate::store::{to_millis, Store};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// What a revoked identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    Token,
    Session,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = RevocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token" => Ok(Self::Token),
            "session" => Ok(Self::Session),
            other => Err(RevocationError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RevocationError {
    #[error("Revocation subject is required")]
    MissingSubject,

    #[error("Unknown revocation kind: {0} (expected token or session)")]
    UnknownKind(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RevocationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingSubject | Self::UnknownKind(_) => ErrorClass::Client,
            Self::Store(_) => ErrorClass::Infrastructure,
        }
    }
}

/// Storage interface for revocations.
pub trait RevocationStore: Send + Sync {
    /// Upsert a ban; the stored expiry becomes `MAX(existing, until)`.
    fn revoke(
        &self,
        subject: &str,
        kind: SubjectKind,
        until: DateTime<Utc>,
        revoked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn is_revoked(
        &self,
        subject: &str,
        kind: SubjectKind,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete rows with `expires_at <= now`; returns the number removed.
    fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Revocations in the `revocations` table.
#[derive(Clone)]
pub struct SqliteRevocationStore {
    store: Store,
}

impl SqliteRevocationStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl RevocationStore for SqliteRevocationStore {
    fn revoke(
        &self,
        subject: &str,
        kind: SubjectKind,
        until: DateTime<Utc>,
        revoked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.store.lock();
        conn.execute(
            "INSERT INTO revocations (subject_id, kind, expires_at, revoked_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(subject_id, kind) DO UPDATE SET
                 expires_at = MAX(revocations.expires_at, excluded.expires_at),
                 revoked_at = excluded.revoked_at",
            params![subject, kind.as_str(), to_millis(until), to_millis(revoked_at)],
        )?;
        Ok(())
    }

    fn is_revoked(
        &self,
        subject: &str,
        kind: SubjectKind,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.store.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM revocations
                 WHERE subject_id = ?1 AND kind = ?2 AND expires_at > ?3",
                params![subject, kind.as_str(), to_millis(now)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.store.lock();
        let n = conn.execute(
            "DELETE FROM revocations WHERE expires_at <= ?1",
            params![to_millis(now)],
        )?;
        Ok(n)
    }
}

/// Revocation checks and updates for tokens and sessions.
#[derive(Clone)]
pub struct RevocationGuard {
    store: Arc<dyn RevocationStore>,
    clock: Arc<dyn Clock>,
}

impl RevocationGuard {
    pub fn new(store: Arc<dyn RevocationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Ban `subject` until `until`. An existing longer ban is kept.
    pub fn revoke(
        &self,
        subject: &str,
        kind: SubjectKind,
        until: DateTime<Utc>,
    ) -> Result<(), RevocationError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(RevocationError::MissingSubject);
        }
        self.store.revoke(subject, kind, until, self.clock.now())?;
        tracing::info!(event = "subject_revoked", kind = kind.as_str(), until = %until);
        Ok(())
    }

    /// Whether `subject` is banned as of `now`. A blank subject never is.
    pub fn is_revoked(
        &self,
        subject: &str,
        kind: SubjectKind,
        now: DateTime<Utc>,
    ) -> Result<bool, RevocationError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Ok(false);
        }
        Ok(self.store.is_revoked(subject, kind, now)?)
    }

    pub fn revoke_token(&self, token_id: &str, until: DateTime<Utc>) -> Result<(), RevocationError> {
        self.revoke(token_id, SubjectKind::Token, until)
    }

    pub fn revoke_session(
        &self,
        session_id: &str,
        until: DateTime<Utc>,
    ) -> Result<(), RevocationError> {
        self.revoke(session_id, SubjectKind::Session, until)
    }

    pub fn is_token_revoked(
        &self,
        token_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RevocationError> {
        self.is_revoked(token_id, SubjectKind::Token, now)
    }

    pub fn is_session_revoked(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RevocationError> {
        self.is_revoked(session_id, SubjectKind::Session, now)
    }

    /// Remove bans that have run out as of `now`.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, RevocationError> {
        let removed = self.store.cleanup_expired(now)?;
        if removed > 0 {
            tracing::info!(event = "revocations_cleaned", rows = removed);
        }
        Ok(removed)
    }

    /// Current time of the guard's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn setup() -> (RevocationGuard, Arc<ManualClock>, Store) {
        let store = Store::memory().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap(),
        ));
        let guard = RevocationGuard::new(
            Arc::new(SqliteRevocationStore::new(store.clone())),
            clock.clone(),
        );
        (guard, clock, store)
    }

    #[test]
    fn test_revoked_until_expiry() {
        let (guard, clock, _) = setup();
        let now = clock.now();

        guard.revoke_token("tok-1", now + Duration::minutes(10)).unwrap();

        assert!(guard.is_token_revoked("tok-1", now).unwrap());
        assert!(guard
            .is_token_revoked("tok-1", now + Duration::minutes(9))
            .unwrap());
        // expires_at == now is no longer revoked
        assert!(!guard
            .is_token_revoked("tok-1", now + Duration::minutes(10))
            .unwrap());
    }

    #[test]
    fn test_revocation_keeps_longest_expiry() {
        let (guard, clock, _) = setup();
        let now = clock.now();

        guard.revoke_session("sess-1", now + Duration::hours(2)).unwrap();
        guard.revoke_session("sess-1", now + Duration::minutes(5)).unwrap();

        assert!(guard
            .is_session_revoked("sess-1", now + Duration::hours(1))
            .unwrap());
    }

    #[test]
    fn test_revocation_refreshes_revoked_at() {
        let (guard, clock, store) = setup();
        let now = clock.now();

        guard.revoke_token("tok-1", now + Duration::hours(1)).unwrap();
        clock.advance(Duration::minutes(3));
        guard.revoke_token("tok-1", now + Duration::minutes(30)).unwrap();

        let revoked_at: i64 = store
            .lock()
            .query_row(
                "SELECT revoked_at FROM revocations WHERE subject_id = 'tok-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(revoked_at, to_millis(clock.now()));
    }

    #[test]
    fn test_kinds_are_independent() {
        let (guard, clock, _) = setup();
        let now = clock.now();

        guard.revoke_token("shared-id", now + Duration::hours(1)).unwrap();

        assert!(guard.is_token_revoked("shared-id", now).unwrap());
        assert!(!guard.is_session_revoked("shared-id", now).unwrap());
    }

    #[test]
    fn test_subject_is_trimmed() {
        let (guard, clock, _) = setup();
        let now = clock.now();

        guard.revoke_token("  tok-2 ", now + Duration::hours(1)).unwrap();
        assert!(guard.is_token_revoked("tok-2", now).unwrap());
    }

    #[test]
    fn test_blank_subject() {
        let (guard, clock, _) = setup();
        let now = clock.now();

        let err = guard.revoke_token("   ", now + Duration::hours(1)).unwrap_err();
        assert_eq!(err, RevocationError::MissingSubject);
        assert_eq!(err.class(), ErrorClass::Client);

        assert!(!guard.is_token_revoked("", now).unwrap());
    }

    #[test]
    fn test_cleanup_expired_removes_only_elapsed_bans() {
        let (guard, clock, _) = setup();
        let now = clock.now();

        guard.revoke_token("short", now + Duration::minutes(1)).unwrap();
        guard.revoke_token("long", now + Duration::hours(1)).unwrap();

        let removed = guard.cleanup_expired(now + Duration::minutes(1)).unwrap();
        assert_eq!(removed, 1);
        assert!(guard
            .is_token_revoked("long", now + Duration::minutes(2))
            .unwrap());
    }

    #[test]
    fn test_subject_kind_parsing() {
        assert_eq!("token".parse::<SubjectKind>().unwrap(), SubjectKind::Token);
        assert_eq!(
            " Session ".parse::<SubjectKind>().unwrap(),
            SubjectKind::Session
        );
        assert!(matches!(
            "cookie".parse::<SubjectKind>(),
            Err(RevocationError::UnknownKind(k)) if k == "cookie"
        ));
        assert_eq!(SubjectKind::Session.to_string(), "session");
    }
}
