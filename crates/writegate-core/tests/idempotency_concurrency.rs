//! Multi-connection concurrency tests for the idempotency coordinator.
//!
//! Every thread gets its own connection to the same file-backed DB, so the
//! primary key on `(scope, idempotency_key)` is the only arbiter.

use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;
use writegate_core::{
    IdempotencyCoordinator, IdempotencyError, Reservation, SqliteIdempotencyStore, Store,
    SystemClock,
};

const RACERS: usize = 8;

fn coordinator(path: &Path) -> IdempotencyCoordinator {
    let store = Store::open(path).unwrap();
    IdempotencyCoordinator::new(
        Arc::new(SqliteIdempotencyStore::new(store)),
        Arc::new(SystemClock),
        Duration::from_secs(3600),
    )
}

/// Open all connections up front so schema bootstrap never races.
fn coordinators(path: &Path) -> Vec<IdempotencyCoordinator> {
    (0..RACERS).map(|_| coordinator(path)).collect()
}

fn race<F, T>(coords: Vec<IdempotencyCoordinator>, f: F) -> Vec<T>
where
    F: Fn(usize, &IdempotencyCoordinator) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let barrier = Arc::new(Barrier::new(coords.len()));
    let f = Arc::new(f);
    let handles: Vec<_> = coords
        .into_iter()
        .enumerate()
        .map(|(i, coord)| {
            let barrier = barrier.clone();
            let f = f.clone();
            thread::spawn(move || {
                barrier.wait();
                f(i, &coord)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// N connections reserve the same key with the same payload → exactly one wins.
#[test]
fn test_exactly_one_reserver_wins() {
    let tmp = NamedTempFile::new().unwrap();
    let coords = coordinators(tmp.path());

    let results = race(coords, |_, c| c.reserve("v1/decisions", "key-1", "hash-1"));

    let reserved = results
        .iter()
        .filter(|r| matches!(r, Ok(Reservation::Reserved)))
        .count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Ok(Reservation::Conflict)))
        .count();

    assert_eq!(reserved, 1, "exactly one reservation: {results:?}");
    assert_eq!(conflicts, RACERS - 1, "all others conflict: {results:?}");
}

/// After completion every connection replays the identical response.
#[test]
fn test_all_connections_replay_after_completion() {
    let tmp = NamedTempFile::new().unwrap();
    let owner = coordinator(tmp.path());
    let body = br#"{"decision_id":"d-1","status":"accepted"}"#.to_vec();

    assert_eq!(
        owner.reserve("v1/decisions", "key-1", "hash-1").unwrap(),
        Reservation::Reserved
    );
    owner
        .complete("v1/decisions", "key-1", "hash-1", 202, &body)
        .unwrap();

    let coords = coordinators(tmp.path());
    let results = race(coords, |_, c| c.reserve("v1/decisions", "key-1", "hash-1"));

    for r in results {
        match r.unwrap() {
            Reservation::Replay(cached) => {
                assert_eq!(cached.code, 202);
                assert_eq!(cached.body, body);
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }
}

/// Racers with different payloads: one wins, the rest are rejected.
#[test]
fn test_racing_different_payloads_rejected() {
    let tmp = NamedTempFile::new().unwrap();
    let coords = coordinators(tmp.path());

    let results = race(coords, |i, c| {
        c.reserve("v1/telemetry/events", "key-2", &format!("hash-{i}"))
    });

    let reserved = results
        .iter()
        .filter(|r| matches!(r, Ok(Reservation::Reserved)))
        .count();
    let rejected = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(IdempotencyError::KeyReusedWithDifferentPayload { .. })
            )
        })
        .count();

    assert_eq!(reserved, 1);
    assert_eq!(rejected, RACERS - 1);
}

/// Distinct keys never interfere.
#[test]
fn test_distinct_keys_all_reserve() {
    let tmp = NamedTempFile::new().unwrap();
    let coords = coordinators(tmp.path());

    let results = race(coords, |i, c| {
        c.reserve("v1/decisions", &format!("key-{i}"), "hash")
    });

    assert!(results
        .iter()
        .all(|r| matches!(r, Ok(Reservation::Reserved))));
}
