//! Security runtime: every coordinator built from one config and one store.

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, RuntimeConfig};
use crate::error::StoreError;
use crate::gate::{self, WriteGate};
use crate::idempotency::{IdempotencyCoordinator, IdempotencyError, SqliteIdempotencyStore};
use crate::keyring::SqliteKeyResolver;
use crate::nonce::{NonceAllocator, NonceError, SqliteWatermarkStore};
use crate::rate_limit::RateLimiter;
use crate::revocation::{RevocationError, RevocationGuard, SqliteRevocationStore};
use crate::store::Store;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Nonce(#[from] NonceError),

    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    #[error(transparent)]
    Revocation(#[from] RevocationError),
}

/// Rows removed by [`SecurityRuntime::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub revocations: usize,
    pub idempotency_records: usize,
    pub rate_counters: usize,
}

/// The wired runtime. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SecurityRuntime {
    config: RuntimeConfig,
    store: Store,
    clock: Arc<dyn Clock>,
    idempotency: IdempotencyCoordinator,
    nonces: NonceAllocator,
    revocations: RevocationGuard,
    keys: SqliteKeyResolver,
    rate_limiter: RateLimiter,
}

impl SecurityRuntime {
    /// Open the configured database and build the runtime on the system clock.
    pub fn open(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let store = Store::open_with_timeout(&config.db_path, config.busy_timeout())?;
        Self::build(config, store)
    }

    pub fn build(config: RuntimeConfig, store: Store) -> Result<Self, RuntimeError> {
        Self::build_with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn build_with_clock(
        mut config: RuntimeConfig,
        store: Store,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RuntimeError> {
        config.normalize();
        config.validate()?;

        let idempotency = IdempotencyCoordinator::new(
            Arc::new(SqliteIdempotencyStore::new(store.clone())),
            clock.clone(),
            config.idempotency_ttl(),
        );

        let watermark = SqliteWatermarkStore::new(
            store.clone(),
            clock.clone(),
            &config.node_name,
            &config.nonce_scope,
            config.nonce_window,
        )?;
        let nonces = NonceAllocator::start(Arc::new(watermark), config.nonce_window)?;

        let revocations = RevocationGuard::new(
            Arc::new(SqliteRevocationStore::new(store.clone())),
            clock.clone(),
        );
        let keys = SqliteKeyResolver::new(store.clone(), clock.clone());
        let rate_limiter = RateLimiter::per_minute(config.rate_limit_per_minute, clock.clone());

        tracing::info!(
            event = "runtime_built",
            node = %config.node_name,
            nonce_scope = %config.nonce_scope,
            nonce_window = config.nonce_window,
            reserved_high = nonces.reserved_high()
        );

        Ok(Self {
            config,
            store,
            clock,
            idempotency,
            nonces,
            revocations,
            keys,
            rate_limiter,
        })
    }

    /// The write gate over this runtime's coordinator and limiter.
    pub fn gate(&self) -> WriteGate {
        WriteGate::new(
            self.idempotency.clone(),
            self.rate_limiter.clone(),
            self.config.rate_limit_burst,
            self.config.write_timeout(),
        )
    }

    /// Rate-limit key for a request, honouring `trust_proxy_headers`.
    pub fn client_address(&self, headers: &[(String, String)], remote_addr: &str) -> String {
        gate::client_address(headers, remote_addr, self.config.trust_proxy_headers)
    }

    /// Database connectivity and schema presence.
    pub fn health_check(&self) -> Result<(), StoreError> {
        self.store.health_check()
    }

    /// Purge expired revocations, idempotency records and rate counters.
    pub fn cleanup(&self) -> Result<CleanupReport, RuntimeError> {
        let revocations = self.revocations.cleanup_expired(self.clock.now())?;
        let idempotency_records = self.idempotency.purge_expired()?;
        let rate_counters = self.rate_limiter.purge_stale();
        Ok(CleanupReport {
            revocations,
            idempotency_records,
            rate_counters,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn idempotency(&self) -> &IdempotencyCoordinator {
        &self.idempotency
    }

    pub fn nonces(&self) -> &NonceAllocator {
        &self.nonces
    }

    pub fn revocations(&self) -> &RevocationGuard {
        &self.revocations
    }

    pub fn keys(&self) -> &SqliteKeyResolver {
        &self.keys
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}
