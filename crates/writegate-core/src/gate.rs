//! Write gate: the exactly-once contract at the transport boundary.
//!
//! The gate is framework-neutral. An adapter turns an incoming HTTP request
//! into a [`WriteRequest`], calls [`WriteGate::handle`] with the business
//! operation, and writes the returned [`WriteResponse`] back unchanged.
//!
//! Flow:
//!
//! ```text
//! headers/body ─▶ rate limit ─▶ reserve ─┬─ Replay ──▶ stored status + bytes
//!                                        ├─ Conflict ─▶ 409
//!                                        └─ Reserved ─▶ op ─┬─ Ok  ─▶ complete ─▶ 202
//!                                                           └─ Err ─▶ release ─▶ 400/500
//! ```
//!
//! Every store call runs on the blocking pool under one per-request deadline.

use crate::error::ErrorClass;
use crate::fingerprint::{log_label, request_hash};
use crate::idempotency::{IdempotencyCoordinator, IdempotencyError, Reservation};
use crate::rate_limit::RateLimiter;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";
const REAL_IP_HEADER: &str = "X-Real-IP";

/// A write as seen by the gate.
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    /// Logical endpoint, e.g. `v1/decisions`. Also the fingerprint domain.
    pub scope: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Rate-limit key, usually from [`client_address`].
    pub client: String,
}

impl WriteRequest {
    pub fn new(scope: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            scope: scope.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    /// Trimmed, non-empty value of the first header named `name` (any case).
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

/// A write that passed admission and owns its idempotency key.
#[derive(Debug, Clone)]
pub struct AdmittedWrite {
    pub request_id: String,
    pub idempotency_key: String,
    pub scope: String,
    pub request_hash: String,
    pub body: Vec<u8>,
}

/// The response to write back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// True when the body was served from a previous completion.
    pub replayed: bool,
}

/// Failure reported by the business operation. Both variants release the
/// reservation so the client may retry with the same key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// The payload is unacceptable; retrying it unchanged will fail again.
    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("{0} header is required")]
    MissingHeader(&'static str),

    #[error("request body is required")]
    EmptyBody,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("Idempotency-Key reused with different payload")]
    KeyReused,

    #[error("request is already in progress")]
    InProgress,

    #[error("{0}")]
    Rejected(String),

    #[error("write failed: {0}")]
    OperationFailed(String),

    #[error("idempotency store failure: {0}")]
    Idempotency(IdempotencyError),

    #[error("write deadline exceeded")]
    DeadlineExceeded,

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<IdempotencyError> for WriteError {
    fn from(e: IdempotencyError) -> Self {
        match e {
            IdempotencyError::KeyReusedWithDifferentPayload { .. } => Self::KeyReused,
            other => Self::Idempotency(other),
        }
    }
}

impl From<OperationError> for WriteError {
    fn from(e: OperationError) -> Self {
        match e {
            OperationError::Rejected(msg) => Self::Rejected(msg),
            OperationError::Failed(msg) => Self::OperationFailed(msg),
        }
    }
}

impl WriteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingHeader(_)
            | Self::EmptyBody
            | Self::RateLimited
            | Self::KeyReused
            | Self::Rejected(_) => ErrorClass::Client,
            Self::InProgress => ErrorClass::Contention,
            Self::Idempotency(e) => e.class(),
            Self::OperationFailed(_) | Self::DeadlineExceeded | Self::Task(_) => {
                ErrorClass::Infrastructure
            }
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingHeader(_) | Self::EmptyBody | Self::Rejected(_) => 400,
            Self::RateLimited => 429,
            Self::KeyReused => 422,
            Self::InProgress => 409,
            Self::DeadlineExceeded => 504,
            Self::Idempotency(e) if e.class() == ErrorClass::Client => 400,
            Self::Idempotency(_) | Self::OperationFailed(_) | Self::Task(_) => 500,
        }
    }

    /// Whether the same request (same key) may succeed later.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Contention || matches!(self, Self::DeadlineExceeded)
    }

    /// The error as a JSON response.
    pub fn to_response(&self) -> WriteResponse {
        WriteResponse {
            status: self.status_code(),
            body: error_body(&self.to_string()),
            replayed: false,
        }
    }
}

/// `{"error": "<message>"}`
pub fn error_body(message: &str) -> Vec<u8> {
    serde_json::json!({ "error": message }).to_string().into_bytes()
}

/// Admission, reservation and completion for idempotent writes.
#[derive(Clone)]
pub struct WriteGate {
    idempotency: IdempotencyCoordinator,
    limiter: RateLimiter,
    burst: u32,
    write_timeout: Duration,
}

impl WriteGate {
    pub fn new(
        idempotency: IdempotencyCoordinator,
        limiter: RateLimiter,
        burst: u32,
        write_timeout: Duration,
    ) -> Self {
        Self {
            idempotency,
            limiter,
            burst,
            write_timeout,
        }
    }

    /// Run `op` at most once per idempotency key and map every outcome,
    /// including errors, to a response.
    pub async fn handle<F, Fut>(&self, request: WriteRequest, op: F) -> WriteResponse
    where
        F: FnOnce(AdmittedWrite) -> Fut,
        Fut: Future<Output = Result<Vec<u8>, OperationError>>,
    {
        let scope = request.scope.clone();
        match self.try_handle(request, op).await {
            Ok(response) => response,
            Err(e) => {
                match e.class() {
                    ErrorClass::Infrastructure => {
                        tracing::error!(event = "write_failed", scope = %scope, error = %e)
                    }
                    _ => tracing::debug!(event = "write_refused", scope = %scope, error = %e),
                }
                e.to_response()
            }
        }
    }

    /// Like [`handle`](Self::handle) but surfaces the typed error.
    pub async fn try_handle<F, Fut>(
        &self,
        request: WriteRequest,
        op: F,
    ) -> Result<WriteResponse, WriteError>
    where
        F: FnOnce(AdmittedWrite) -> Fut,
        Fut: Future<Output = Result<Vec<u8>, OperationError>>,
    {
        let deadline = Instant::now() + self.write_timeout;

        // Admission: nothing below touches the store
        let request_id = request
            .header(REQUEST_ID_HEADER)
            .ok_or(WriteError::MissingHeader(REQUEST_ID_HEADER))?
            .to_string();
        let idempotency_key = request
            .header(IDEMPOTENCY_KEY_HEADER)
            .ok_or(WriteError::MissingHeader(IDEMPOTENCY_KEY_HEADER))?
            .to_string();
        if request.body.is_empty() {
            return Err(WriteError::EmptyBody);
        }
        if !self.limiter.allow(&request.client, self.burst) {
            tracing::warn!(event = "write_rate_limited", scope = %request.scope);
            return Err(WriteError::RateLimited);
        }

        let scope = request.scope;
        let hash = request_hash(&scope, &request.body);

        match self
            .reserve(deadline, &scope, &idempotency_key, &hash)
            .await?
        {
            Reservation::Replay(cached) => {
                tracing::info!(
                    event = "write_replayed",
                    scope = %scope,
                    request_id = %request_id,
                    key = %log_label(&idempotency_key),
                    status = cached.code
                );
                return Ok(WriteResponse {
                    status: cached.code,
                    body: cached.body,
                    replayed: true,
                });
            }
            Reservation::Conflict => return Err(WriteError::InProgress),
            Reservation::Reserved => {}
        }

        let admitted = AdmittedWrite {
            request_id: request_id.clone(),
            idempotency_key: idempotency_key.clone(),
            scope: scope.clone(),
            request_hash: hash.clone(),
            body: request.body,
        };

        // A deadline here keeps the reservation: the operation may still commit
        let outcome = timeout_at(deadline, op(admitted))
            .await
            .map_err(|_| WriteError::DeadlineExceeded)?;

        let body = match outcome {
            Ok(body) => body,
            Err(e) => {
                self.release(deadline, &scope, &idempotency_key, &hash).await;
                return Err(e.into());
            }
        };

        self.complete(deadline, &scope, &idempotency_key, &hash, 202, &body)
            .await?;

        tracing::info!(
            event = "write_accepted",
            scope = %scope,
            request_id = %request_id,
            key = %log_label(&idempotency_key)
        );
        let body = if body.is_empty() { b"{}".to_vec() } else { body };
        Ok(WriteResponse {
            status: 202,
            body,
            replayed: false,
        })
    }

    async fn reserve(
        &self,
        deadline: Instant,
        scope: &str,
        key: &str,
        hash: &str,
    ) -> Result<Reservation, WriteError> {
        let coordinator = self.idempotency.clone();
        let (s, k, h) = (scope.to_string(), key.to_string(), hash.to_string());
        let mut task = tokio::task::spawn_blocking(move || coordinator.reserve(&s, &k, &h));

        let waited = timeout_at(deadline, &mut task).await;
        match waited {
            Ok(joined) => Ok(joined.map_err(|e| WriteError::Task(e.to_string()))??),
            Err(_) => {
                // The reservation may still land; undo it when it does
                let coordinator = self.idempotency.clone();
                let (s, k, h) = (scope.to_string(), key.to_string(), hash.to_string());
                tokio::spawn(async move {
                    if let Ok(Ok(Reservation::Reserved)) = task.await {
                        let label = s.clone();
                        let released =
                            tokio::task::spawn_blocking(move || coordinator.release(&s, &k, &h))
                                .await;
                        if matches!(released, Ok(Ok(_))) {
                            tracing::debug!(event = "late_reservation_released", scope = %label);
                        } else {
                            tracing::warn!(event = "late_reservation_not_released", scope = %label);
                        }
                    }
                });
                Err(WriteError::DeadlineExceeded)
            }
        }
    }

    async fn complete(
        &self,
        deadline: Instant,
        scope: &str,
        key: &str,
        hash: &str,
        code: u16,
        body: &[u8],
    ) -> Result<(), WriteError> {
        let coordinator = self.idempotency.clone();
        let (s, k, h, b) = (
            scope.to_string(),
            key.to_string(),
            hash.to_string(),
            body.to_vec(),
        );
        let task = tokio::task::spawn_blocking(move || coordinator.complete(&s, &k, &h, code, &b));
        let joined = timeout_at(deadline, task)
            .await
            .map_err(|_| WriteError::DeadlineExceeded)?;
        Ok(joined.map_err(|e| WriteError::Task(e.to_string()))??)
    }

    /// Best-effort: a failed release leaves the key blocked until its TTL.
    async fn release(&self, deadline: Instant, scope: &str, key: &str, hash: &str) {
        let coordinator = self.idempotency.clone();
        let (s, k, h) = (scope.to_string(), key.to_string(), hash.to_string());
        let task = tokio::task::spawn_blocking(move || coordinator.release(&s, &k, &h));

        match timeout_at(deadline, task).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => {
                tracing::warn!(event = "reservation_release_failed", scope, error = %e)
            }
            Ok(Err(e)) => {
                tracing::warn!(event = "reservation_release_failed", scope, error = %e)
            }
            // The blocking task keeps running and still releases
            Err(_) => tracing::debug!(event = "reservation_release_detached", scope),
        }
    }
}

/// Trimmed, non-empty value of the first header named `name` (any case).
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

/// Rate-limit key for a request.
///
/// With `trust_proxy`, the first `X-Forwarded-For` entry wins, then
/// `X-Real-IP`. Otherwise (or when neither is usable) the host part of
/// `remote_addr` is used; `"unknown"` when that is empty.
pub fn client_address(headers: &[(String, String)], remote_addr: &str, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(first) = header_value(headers, FORWARDED_FOR_HEADER)
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return first.to_string();
        }
        if let Some(real_ip) = header_value(headers, REAL_IP_HEADER) {
            return real_ip.to_string();
        }
    }

    let remote = remote_addr.trim();
    if remote.is_empty() {
        return "unknown".to_string();
    }
    match remote.parse::<SocketAddr>() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => remote.to_string(),
    }
}
