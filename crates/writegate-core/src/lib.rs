//! Exactly-once write coordination for decision and telemetry ingestion.
//!
//! This crate sits between an unreliable network and a durable SQLite store
//! and provides:
//!
//! - an idempotency coordinator (reserve-or-replay for write endpoints)
//! - a crash-safe nonce watermark allocator
//! - a revocation guard for tokens and sessions
//! - a process-local fixed-window rate limiter
//! - signing key resolution
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          WriteGate                               │
//! │  ┌────────────┐   ┌─────────────┐   ┌───────────┐   ┌──────────┐ │
//! │  │  Headers   │──▶│ RateLimiter │──▶│ Reserve   │──▶│ Business │ │
//! │  └────────────┘   └─────────────┘   └─────┬─────┘   │    op    │ │
//! │                                           │         └────┬─────┘ │
//! │                                   ┌───────▼───────┐      │       │
//! │                                   │     Store     │◀─────┘       │
//! │                                   │   (SQLite)    │  Complete    │
//! │                                   └───────────────┘              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`NonceAllocator`], [`RevocationGuard`] and [`KeyResolver`] share the
//! same [`Store`] but are consulted independently of the write path.

pub mod clock;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod gate;
pub mod idempotency;
pub mod keyring;
pub mod nonce;
pub mod rate_limit;
pub mod revocation;
pub mod runtime;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{ErrorClass, StoreError};
pub use fingerprint::request_hash;
pub use gate::{
    client_address, AdmittedWrite, OperationError, WriteError, WriteGate, WriteRequest,
    WriteResponse, IDEMPOTENCY_KEY_HEADER, REQUEST_ID_HEADER,
};
pub use idempotency::{
    CachedResponse, IdempotencyCoordinator, IdempotencyError, IdempotencyRecord,
    IdempotencyStore, Reservation, SqliteIdempotencyStore,
};
pub use keyring::{KeyError, KeyResolver, ResolvedKey, SqliteKeyResolver};
pub use nonce::{NonceAllocator, NonceError, SqliteWatermarkStore, WatermarkStore};
pub use rate_limit::RateLimiter;
pub use revocation::{
    RevocationError, RevocationGuard, RevocationStore, SqliteRevocationStore, SubjectKind,
};
pub use runtime::{CleanupReport, RuntimeError, SecurityRuntime};
pub use store::{Store, SCHEMA};
