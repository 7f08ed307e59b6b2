//! SQLite schema for the write-coordination runtime.
//!
//! Tables:
//! - `idempotency_keys`: reserve-or-replay records per (scope, key)
//! - `nonce_watermarks`: durable nonce ceilings per (node, scope)
//! - `revocations`: token/session bans with max-merged expiry
//! - `signing_keys` / `signing_key_versions`: key resolution
//!
//! All instants are stored as INTEGER Unix milliseconds (UTC) so that expiry
//! comparisons are numeric rather than string comparisons.

/// DDL for all runtime tables.
///
/// Schema version: 1
pub const SCHEMA: &str = r#"
-- Idempotency records (request_hash immutable while the row is live)
CREATE TABLE IF NOT EXISTS idempotency_keys (
    scope            TEXT NOT NULL,
    idempotency_key  TEXT NOT NULL,
    request_hash     TEXT NOT NULL,
    response_code    INTEGER,
    response_body    BLOB,
    created_at       INTEGER NOT NULL,
    expires_at       INTEGER NOT NULL,
    PRIMARY KEY (scope, idempotency_key)
);

-- Nonce watermarks (reserved_high never decreases)
CREATE TABLE IF NOT EXISTS nonce_watermarks (
    node_name        TEXT NOT NULL,
    nonce_scope      TEXT NOT NULL,
    reserved_high    INTEGER NOT NULL CHECK (reserved_high >= 0),
    window_size      INTEGER NOT NULL CHECK (window_size > 0),
    updated_at       INTEGER NOT NULL,
    PRIMARY KEY (node_name, nonce_scope)
);

-- Token/session revocations (expires_at only ever extended)
CREATE TABLE IF NOT EXISTS revocations (
    subject_id       TEXT NOT NULL,
    kind             TEXT NOT NULL CHECK (kind IN ('token', 'session')),
    expires_at       INTEGER NOT NULL,
    revoked_at       INTEGER NOT NULL,
    PRIMARY KEY (subject_id, kind)
);

-- Signing keys and their versions
CREATE TABLE IF NOT EXISTS signing_keys (
    id               TEXT PRIMARY KEY,
    status           TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS signing_key_versions (
    key_id           TEXT PRIMARY KEY,
    signing_key_id   TEXT NOT NULL REFERENCES signing_keys(id),
    key_material     TEXT NOT NULL,
    is_current       INTEGER NOT NULL DEFAULT 0,
    valid_from       INTEGER NOT NULL,
    valid_until      INTEGER
);

-- Indexes for expiry sweeps and key resolution
CREATE INDEX IF NOT EXISTS idx_idempotency_keys_expires_at
    ON idempotency_keys(expires_at);
CREATE INDEX IF NOT EXISTS idx_revocations_expires_at
    ON revocations(expires_at);
CREATE INDEX IF NOT EXISTS idx_signing_key_versions_current
    ON signing_key_versions(is_current, valid_from);
"#;
