//! Crash-safe nonce allocation with a durable watermark.
//!
//! The allocator reserves nonces in windows. Only the upper bound of each
//! window (`reserved_high`) is written to the store; values inside the window
//! are handed out from memory. After a crash the allocator resumes above the
//! last durable ceiling, so a value is never issued twice and at most one
//! window of values is skipped.
//!
//! ```text
//!   issued ──────▶ cursor     ceiling = reserved_high (durable)
//!   ┌──────────────────┬─────────┐
//!   │ 1 2 3 ... 1000   │ ... 2000│  next window claimed when cursor == ceiling
//!   └──────────────────┴─────────┘
//! ```
//!
//! A window is claimed by advancing the stored watermark by `window_size` in
//! one statement and issuing from `(returned - window_size, returned]`. Two
//! allocators on the same `(node, scope)` therefore always hold disjoint
//! windows. When the claimed window does not start at the local ceiling,
//! another writer advanced in between; the gap is skipped and logged.

use crate::clock::Clock;
use crate::error::{ErrorClass, StoreError};
use crate::store::{to_millis, Store};
use rusqlite::{params, OptionalExtension};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Scope used when none (or a blank one) is configured.
pub const DEFAULT_NONCE_SCOPE: &str = "default";

/// Durable storage for one `(node, scope)` watermark.
pub trait WatermarkStore: Send + Sync {
    /// Last durable ceiling; 0 when no row exists yet.
    fn load_reserved(&self) -> Result<u64, StoreError>;

    /// Raise the ceiling to at least `value` (max-merge) and return the
    /// durable value after the merge.
    fn persist_reserved(&self, value: u64) -> Result<u64, StoreError>;

    /// Atomically advance the ceiling by `size` and return the new ceiling.
    /// The caller owns `(returned - size, returned]`. `None` when the
    /// advance would leave the storable range.
    fn claim_window(&self, size: u64) -> Result<Option<u64>, StoreError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NonceError {
    #[error("Nonce window must be greater than zero")]
    InvalidWindow,

    #[error("Nonce node name is required")]
    MissingNode,

    #[error("Nonce space exhausted at {ceiling}")]
    Exhausted { ceiling: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl NonceError {
    /// Nonce failures are never the caller's fault.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Infrastructure
    }
}

/// In-memory window: values in `(cursor, ceiling]` are reserved but unissued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    cursor: u64,
    ceiling: u64,
}

/// Issues strictly increasing nonces for one `(node, scope)`.
#[derive(Clone)]
pub struct NonceAllocator {
    store: Arc<dyn WatermarkStore>,
    window_size: u64,
    state: Arc<Mutex<Window>>,
}

impl NonceAllocator {
    /// Load the durable ceiling and resume above it.
    pub fn start(store: Arc<dyn WatermarkStore>, window_size: u64) -> Result<Self, NonceError> {
        if window_size == 0 || window_size > i64::MAX as u64 {
            return Err(NonceError::InvalidWindow);
        }

        let reserved = store.load_reserved()?;
        // Write the row back so it exists before the first window is taken
        let durable = store.persist_reserved(reserved)?;

        tracing::info!(event = "nonce_allocator_started", reserved_high = durable, window_size);

        Ok(Self {
            store,
            window_size,
            state: Arc::new(Mutex::new(Window {
                cursor: durable,
                ceiling: durable,
            })),
        })
    }

    /// Next nonce. Touches the store only when the current window is used up.
    pub fn next(&self) -> Result<u64, NonceError> {
        let mut window = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if window.cursor < window.ceiling {
            window.cursor += 1;
            return Ok(window.cursor);
        }

        let claimed = self
            .store
            .claim_window(self.window_size)?
            .ok_or(NonceError::Exhausted {
                ceiling: window.ceiling,
            })?;
        let floor = claimed
            .checked_sub(self.window_size)
            .ok_or_else(|| StoreError::Corrupt(format!("watermark below window: {claimed}")))?;

        if floor < window.ceiling {
            return Err(StoreError::Corrupt(format!(
                "watermark moved backwards: claimed {claimed}, held {}",
                window.ceiling
            ))
            .into());
        }
        if floor > window.ceiling {
            tracing::warn!(
                event = "nonce_concurrent_advance",
                expected = window.ceiling,
                floor,
                reserved_high = claimed
            );
        } else {
            tracing::debug!(event = "nonce_window_reserved", reserved_high = claimed);
        }

        let issued = floor + 1;
        *window = Window {
            cursor: issued,
            ceiling: claimed,
        };
        Ok(issued)
    }

    /// Highest value durably reserved by this allocator.
    pub fn reserved_high(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).ceiling
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }
}

/// Watermark row in the `nonce_watermarks` table.
#[derive(Clone)]
pub struct SqliteWatermarkStore {
    store: Store,
    clock: Arc<dyn Clock>,
    node: String,
    scope: String,
    window_size: i64,
}

impl SqliteWatermarkStore {
    /// A blank scope maps to [`DEFAULT_NONCE_SCOPE`].
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        node: &str,
        scope: &str,
        window_size: u64,
    ) -> Result<Self, NonceError> {
        let node = node.trim();
        if node.is_empty() {
            return Err(NonceError::MissingNode);
        }
        let scope = match scope.trim() {
            "" => DEFAULT_NONCE_SCOPE,
            s => s,
        };
        let window_size = i64::try_from(window_size)
            .ok()
            .filter(|w| *w > 0)
            .ok_or(NonceError::InvalidWindow)?;

        Ok(Self {
            store,
            clock,
            node: node.to_string(),
            scope: scope.to_string(),
            window_size,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl WatermarkStore for SqliteWatermarkStore {
    fn load_reserved(&self) -> Result<u64, StoreError> {
        let conn = self.store.lock();
        let value: Option<i64> = conn
            .query_row(
                "SELECT reserved_high FROM nonce_watermarks
                 WHERE node_name = ?1 AND nonce_scope = ?2",
                params![self.node, self.scope],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            None => Ok(0),
            Some(v) => u64::try_from(v)
                .map_err(|_| StoreError::Corrupt(format!("negative watermark: {v}"))),
        }
    }

    fn persist_reserved(&self, value: u64) -> Result<u64, StoreError> {
        let value = i64::try_from(value)
            .map_err(|_| StoreError::Corrupt(format!("watermark out of range: {value}")))?;
        let now = to_millis(self.clock.now());

        let conn = self.store.lock();
        let durable: i64 = conn.query_row(
            "INSERT INTO nonce_watermarks (node_name, nonce_scope, reserved_high, window_size, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(node_name, nonce_scope) DO UPDATE SET
                 reserved_high = MAX(nonce_watermarks.reserved_high, excluded.reserved_high),
                 window_size = excluded.window_size,
                 updated_at = excluded.updated_at
             RETURNING reserved_high",
            params![self.node, self.scope, value, self.window_size, now],
            |row| row.get(0),
        )?;

        u64::try_from(durable)
            .map_err(|_| StoreError::Corrupt(format!("negative watermark: {durable}")))
    }

    fn claim_window(&self, size: u64) -> Result<Option<u64>, StoreError> {
        let size = i64::try_from(size)
            .map_err(|_| StoreError::Corrupt(format!("window out of range: {size}")))?;
        let now = to_millis(self.clock.now());

        let conn = self.store.lock();
        let claimed: Option<i64> = conn
            .query_row(
                "INSERT INTO nonce_watermarks (node_name, nonce_scope, reserved_high, window_size, updated_at)
                 VALUES (?1, ?2, ?3, ?3, ?4)
                 ON CONFLICT(node_name, nonce_scope) DO UPDATE SET
                     reserved_high = nonce_watermarks.reserved_high + excluded.window_size,
                     window_size = excluded.window_size,
                     updated_at = excluded.updated_at
                 WHERE nonce_watermarks.reserved_high <= ?5
                 RETURNING reserved_high",
                params![self.node, self.scope, size, now, i64::MAX - size],
                |row| row.get(0),
            )
            .optional()?;

        claimed
            .map(|v| {
                u64::try_from(v).map_err(|_| StoreError::Corrupt(format!("negative watermark: {v}")))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory watermark with an optional failure switch.
    #[derive(Default)]
    struct MemoryWatermark {
        value: Mutex<u64>,
        fail: AtomicBool,
        persists: Mutex<Vec<u64>>,
        claims: Mutex<Vec<u64>>,
    }

    impl MemoryWatermark {
        fn at(value: u64) -> Self {
            Self {
                value: Mutex::new(value),
                ..Default::default()
            }
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Database("disk I/O error".to_string()));
            }
            Ok(())
        }
    }

    impl WatermarkStore for MemoryWatermark {
        fn load_reserved(&self) -> Result<u64, StoreError> {
            Ok(*self.value.lock().unwrap())
        }

        fn persist_reserved(&self, value: u64) -> Result<u64, StoreError> {
            self.check()?;
            self.persists.lock().unwrap().push(value);
            let mut current = self.value.lock().unwrap();
            *current = (*current).max(value);
            Ok(*current)
        }

        fn claim_window(&self, size: u64) -> Result<Option<u64>, StoreError> {
            self.check()?;
            let mut current = self.value.lock().unwrap();
            if *current > i64::MAX as u64 - size {
                return Ok(None);
            }
            *current += size;
            self.claims.lock().unwrap().push(*current);
            Ok(Some(*current))
        }
    }

    fn sqlite(store: &Store, window: u64) -> Arc<SqliteWatermarkStore> {
        Arc::new(
            SqliteWatermarkStore::new(store.clone(), Arc::new(SystemClock), "node-a", "", window)
                .unwrap(),
        )
    }

    // === A) Allocation ===

    #[test]
    fn test_fresh_allocator_starts_at_one() {
        let store = Arc::new(MemoryWatermark::default());
        let alloc = NonceAllocator::start(store.clone(), 10).unwrap();

        let issued: Vec<u64> = (0..3).map(|_| alloc.next().unwrap()).collect();
        assert_eq!(issued, vec![1, 2, 3]);
        assert_eq!(alloc.reserved_high(), 10);
    }

    #[test]
    fn test_store_touched_once_per_window() {
        let store = Arc::new(MemoryWatermark::default());
        let alloc = NonceAllocator::start(store.clone(), 5).unwrap();

        for expected in 1..=12 {
            assert_eq!(alloc.next().unwrap(), expected);
        }
        assert_eq!(*store.persists.lock().unwrap(), vec![0]);
        assert_eq!(*store.claims.lock().unwrap(), vec![5, 10, 15]);
    }

    #[test]
    fn test_zero_window_rejected() {
        let store = Arc::new(MemoryWatermark::default());
        let err = NonceAllocator::start(store, 0).err().unwrap();
        assert_eq!(err, NonceError::InvalidWindow);
    }

    #[test]
    fn test_restart_resumes_above_ceiling() {
        let store = Arc::new(MemoryWatermark::default());
        let first = NonceAllocator::start(store.clone(), 100).unwrap();
        for _ in 0..3 {
            first.next().unwrap();
        }
        drop(first);

        let second = NonceAllocator::start(store, 100).unwrap();
        assert_eq!(second.next().unwrap(), 101);
    }

    // === B) Failure handling ===

    #[test]
    fn test_store_failure_issues_nothing() {
        let store = Arc::new(MemoryWatermark::default());
        let alloc = NonceAllocator::start(store.clone(), 2).unwrap();
        assert_eq!(alloc.next().unwrap(), 1);
        assert_eq!(alloc.next().unwrap(), 2);

        store.fail.store(true, Ordering::SeqCst);
        let err = alloc.next().unwrap_err();
        assert!(matches!(err, NonceError::Store(_)));
        assert_eq!(err.class(), ErrorClass::Infrastructure);
        assert_eq!(alloc.reserved_high(), 2);

        // Recovers once the store does, without gaps in the issued sequence
        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(alloc.next().unwrap(), 3);
    }

    #[test]
    fn test_foreign_window_is_skipped() {
        let store = Arc::new(MemoryWatermark::default());
        let alloc = NonceAllocator::start(store.clone(), 10).unwrap();
        for _ in 0..10 {
            alloc.next().unwrap();
        }

        // Another writer claims (10, 110] in between
        assert_eq!(store.claim_window(100).unwrap(), Some(110));

        assert_eq!(alloc.next().unwrap(), 111);
        assert_eq!(alloc.reserved_high(), 120);
    }

    #[test]
    fn test_watermark_moving_backwards_is_corruption() {
        let store = Arc::new(MemoryWatermark::default());
        let alloc = NonceAllocator::start(store.clone(), 10).unwrap();
        assert_eq!(alloc.next().unwrap(), 1);
        for _ in 0..9 {
            alloc.next().unwrap();
        }

        // Row reset behind the allocator's back
        *store.value.lock().unwrap() = 0;

        let err = alloc.next().unwrap_err();
        assert!(matches!(err, NonceError::Store(StoreError::Corrupt(_))));
        assert_eq!(alloc.reserved_high(), 10);
    }

    #[test]
    fn test_exhausted_above_storable_range() {
        let store = Arc::new(MemoryWatermark::at(i64::MAX as u64 - 1));
        let alloc = NonceAllocator::start(store, 5).unwrap();

        let err = alloc.next().unwrap_err();
        assert!(matches!(err, NonceError::Exhausted { .. }));
    }

    // === C) SQLite watermark ===

    #[test]
    fn test_sqlite_watermark_is_max_merged() {
        let store = Store::memory().unwrap();
        let wm = sqlite(&store, 10);

        assert_eq!(wm.load_reserved().unwrap(), 0);
        assert_eq!(wm.persist_reserved(50).unwrap(), 50);
        assert_eq!(wm.persist_reserved(20).unwrap(), 50);
        assert_eq!(wm.load_reserved().unwrap(), 50);
    }

    #[test]
    fn test_sqlite_claims_are_disjoint() {
        let store = Store::memory().unwrap();
        let wm = sqlite(&store, 10);

        assert_eq!(wm.claim_window(10).unwrap(), Some(10));
        assert_eq!(wm.claim_window(10).unwrap(), Some(20));
        assert_eq!(wm.claim_window(5).unwrap(), Some(25));
        assert_eq!(wm.load_reserved().unwrap(), 25);
    }

    #[test]
    fn test_sqlite_claim_refuses_to_overflow() {
        let store = Store::memory().unwrap();
        let wm = sqlite(&store, 10);
        wm.persist_reserved(i64::MAX as u64 - 3).unwrap();

        assert_eq!(wm.claim_window(10).unwrap(), None);
        assert_eq!(wm.load_reserved().unwrap(), i64::MAX as u64 - 3);
    }

    #[test]
    fn test_sqlite_start_creates_row() {
        let store = Store::memory().unwrap();
        NonceAllocator::start(sqlite(&store, 10), 10).unwrap();

        let (scope, high): (String, i64) = store
            .lock()
            .query_row(
                "SELECT nonce_scope, reserved_high FROM nonce_watermarks WHERE node_name = 'node-a'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(scope, DEFAULT_NONCE_SCOPE);
        assert_eq!(high, 0);
    }

    #[test]
    fn test_sqlite_scopes_are_independent() {
        let store = Store::memory().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let a = SqliteWatermarkStore::new(store.clone(), clock.clone(), "node-a", "orders", 10)
            .unwrap();
        let b = SqliteWatermarkStore::new(store.clone(), clock, "node-a", "events", 10).unwrap();

        a.persist_reserved(30).unwrap();
        assert_eq!(b.load_reserved().unwrap(), 0);
    }

    #[test]
    fn test_sqlite_store_rejects_bad_identity() {
        let store = Store::memory().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let err = SqliteWatermarkStore::new(store.clone(), clock.clone(), "  ", "s", 10)
            .err()
            .unwrap();
        assert_eq!(err, NonceError::MissingNode);

        let err = SqliteWatermarkStore::new(store, clock, "node", "s", 0)
            .err()
            .unwrap();
        assert_eq!(err, NonceError::InvalidWindow);
    }
}
