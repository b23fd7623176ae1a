//! HTTP fetch, retry policy, and fingerprint store backends for the app ranker.

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ranker_core::ScrapedRecord;
use reqwest::StatusCode;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "ranker-storage";

/// Staging table the pipeline appends to.
pub const STAGING_TABLE: &str = "stg_shopify_apps";

const KNOWN_FINGERPRINTS_SQL: &str = r#"
    SELECT sha256_surrogate_key FROM stg_shopify_apps
    WHERE sha256_surrogate_key = ANY($1)
"#;

const INSERT_PREFIX_SQL: &str = "INSERT INTO stg_shopify_apps (app_name, app_url, ranking, average_rating, total_reviews, is_ad, sha256_surrogate_key) ";

/// Postgres caps a statement at 65535 bind parameters; seven per row.
const INSERT_CHUNK_ROWS: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Transient {
    fn disposition(&self) -> RetryDisposition;
}

/// Fixed-delay retry: `max_retries` additional attempts, `delay` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts. `op` receives the zero-based attempt index.
pub async fn retry_with_policy<T, E, F, Fut>(policy: &RetryPolicy, stage: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable && attempt < policy.max_retries =>
            {
                warn!(
                    stage,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts(),
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %err,
                    "transient failure; retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl Transient for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Single GET; retries belong to the caller's [`RetryPolicy`].
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await?;
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("fingerprint already stored: {0}")]
    DuplicateFingerprint(String),
    #[error("rank {0} does not fit the ranking column")]
    RankOutOfRange(u32),
    /// Outage injected into [`MemoryFingerprintStore`]. Postgres outages arrive
    /// as `Database`.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Mid-batch failure injected into [`MemoryFingerprintStore`]; nothing was kept.
    #[error("in-memory write interrupted after {written} of {total} rows")]
    Interrupted { written: usize, total: usize },
}

impl Transient for StoreError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Database(err) => classify_sqlx_error(err),
            StoreError::Unavailable(_) | StoreError::Interrupted { .. } => RetryDisposition::Retryable,
            StoreError::DuplicateFingerprint(_) | StoreError::RankOutOfRange(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

/// Read/append access to the persisted set of record fingerprints.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Which of `fingerprints` are already stored, answered in one query.
    async fn known_fingerprints(&self, fingerprints: &[String]) -> Result<HashSet<String>, StoreError>;

    /// Insert every record or none of them. Returns rows written.
    async fn insert_batch(&self, records: &[ScrapedRecord]) -> Result<u64, StoreError>;
}

/// Postgres-backed store over [`STAGING_TABLE`].
///
/// Each call checks a connection out of the pool and returns it when done, so
/// no connection outlives a pipeline stage.
#[derive(Debug, Clone)]
pub struct PgFingerprintStore {
    pool: PgPool,
}

impl PgFingerprintStore {
    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)
            .context("configuring postgres pool")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_insert_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::DuplicateFingerprint(db.message().to_string());
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl FingerprintStore for PgFingerprintStore {
    async fn known_fingerprints(&self, fingerprints: &[String]) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<String> = sqlx::query_scalar(KNOWN_FINGERPRINTS_SQL)
            .bind(fingerprints)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn insert_batch(&self, records: &[ScrapedRecord]) -> Result<u64, StoreError> {
        let ranks = records
            .iter()
            .map(|r| i32::try_from(r.rank).map_err(|_| StoreError::RankOutOfRange(r.rank)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for (chunk, chunk_ranks) in records
            .chunks(INSERT_CHUNK_ROWS)
            .zip(ranks.chunks(INSERT_CHUNK_ROWS))
        {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(INSERT_PREFIX_SQL);
            builder.push_values(chunk.iter().zip(chunk_ranks), |mut row, (record, rank)| {
                row.push_bind(&record.name)
                    .push_bind(&record.url)
                    .push_bind(*rank)
                    .push_bind(record.average_rating)
                    .push_bind(&record.total_reviews)
                    .push_bind(record.is_ad)
                    .push_bind(&record.fingerprint);
            });
            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(map_insert_error)?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        info!(table = STAGING_TABLE, rows = written, "bulk insert committed");
        Ok(written)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<ScrapedRecord>,
    lookup_calls: usize,
    insert_calls: usize,
    interrupt_after: Option<usize>,
    unavailable_failures: usize,
}

/// In-process store with the same all-or-nothing and uniqueness rules as the
/// Postgres table. Counts calls so callers can assert what was queried.
#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    state: Mutex<MemoryState>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<ScrapedRecord>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                rows,
                ..Default::default()
            }),
        }
    }

    pub async fn rows(&self) -> Vec<ScrapedRecord> {
        self.state.lock().await.rows.clone()
    }

    pub async fn lookup_calls(&self) -> usize {
        self.state.lock().await.lookup_calls
    }

    pub async fn insert_calls(&self) -> usize {
        self.state.lock().await.insert_calls
    }

    /// Make the next insert fail after staging `rows` rows.
    pub async fn interrupt_next_insert_after(&self, rows: usize) {
        self.state.lock().await.interrupt_after = Some(rows);
    }

    /// Make the next `count` calls (lookups or inserts) fail as unavailable.
    pub async fn fail_next_calls(&self, count: usize) {
        self.state.lock().await.unavailable_failures = count;
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn known_fingerprints(&self, fingerprints: &[String]) -> Result<HashSet<String>, StoreError> {
        let mut state = self.state.lock().await;
        state.lookup_calls += 1;
        if state.unavailable_failures > 0 {
            state.unavailable_failures -= 1;
            return Err(StoreError::Unavailable("memory store: injected lookup outage".to_string()));
        }
        let wanted: HashSet<&str> = fingerprints.iter().map(String::as_str).collect();
        Ok(state
            .rows
            .iter()
            .filter(|r| wanted.contains(r.fingerprint.as_str()))
            .map(|r| r.fingerprint.clone())
            .collect())
    }

    async fn insert_batch(&self, records: &[ScrapedRecord]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.insert_calls += 1;
        if state.unavailable_failures > 0 {
            state.unavailable_failures -= 1;
            return Err(StoreError::Unavailable("memory store: injected insert outage".to_string()));
        }

        let interrupt_after = state.interrupt_after.take();
        let mut staged = state.rows.clone();
        let mut seen: HashSet<String> = staged.iter().map(|r| r.fingerprint.clone()).collect();
        for (written, record) in records.iter().enumerate() {
            if interrupt_after == Some(written) {
                return Err(StoreError::Interrupted {
                    written,
                    total: records.len(),
                });
            }
            if !seen.insert(record.fingerprint.clone()) {
                return Err(StoreError::DuplicateFingerprint(record.fingerprint.clone()));
            }
            staged.push(record.clone());
        }
        state.rows = staged;
        Ok(records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranker_core::ListingFields;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(name: &str, rank: u32) -> ScrapedRecord {
        ScrapedRecord::from_fields(ListingFields {
            name: name.to_string(),
            url: format!("https://apps.shopify.com/{}", name.to_ascii_lowercase()),
            rank,
            average_rating: Some(4.2),
            total_reviews: "10 total reviews".to_string(),
            is_ad: false,
        })
        .unwrap()
    }

    #[test]
    fn status_classification_retries_server_errors_only() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn store_errors_classify_constraint_violations_as_fatal() {
        assert_eq!(
            StoreError::DuplicateFingerprint("x".into()).disposition(),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            StoreError::Database(sqlx::Error::PoolTimedOut).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            StoreError::Database(sqlx::Error::RowNotFound).disposition(),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let result: Result<(), StoreError> = retry_with_policy(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Unavailable("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_non_retryable_errors() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let result: Result<(), StoreError> = retry_with_policy(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::DuplicateFingerprint("abc".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::DuplicateFingerprint(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_the_fixed_delay_between_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_secs(30));
        let started = tokio::time::Instant::now();
        let value = retry_with_policy(&policy, "test", |attempt| async move {
            if attempt < 2 {
                Err(StoreError::Unavailable("down".into()))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn memory_store_interrupted_insert_leaves_rows_unchanged() {
        let existing = record("Existing", 1);
        let store = MemoryFingerprintStore::with_rows(vec![existing.clone()]);
        store.interrupt_next_insert_after(1).await;

        let batch = vec![record("Alpha", 1), record("Beta", 2)];
        let err = store.insert_batch(&batch).await.unwrap_err();
        assert!(matches!(err, StoreError::Interrupted { written: 1, total: 2 }));
        assert_eq!(store.rows().await, vec![existing]);

        assert_eq!(store.insert_batch(&batch).await.unwrap(), 2);
        assert_eq!(store.rows().await.len(), 3);
    }

    #[tokio::test]
    async fn memory_store_injected_outages_name_the_double() {
        let store = MemoryFingerprintStore::new();
        store.fail_next_calls(2).await;

        let lookup = store.known_fingerprints(&[]).await.unwrap_err();
        assert_eq!(lookup.to_string(), "store unavailable: memory store: injected lookup outage");
        let insert = store.insert_batch(&[record("Alpha", 1)]).await.unwrap_err();
        assert_eq!(insert.to_string(), "store unavailable: memory store: injected insert outage");
        assert_eq!(insert.disposition(), RetryDisposition::Retryable);
        assert!(store.rows().await.is_empty());
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_fingerprints_atomically() {
        let alpha = record("Alpha", 1);
        let store = MemoryFingerprintStore::with_rows(vec![alpha.clone()]);
        let err = store
            .insert_batch(&[record("Beta", 2), alpha])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateFingerprint(_)));
        assert_eq!(store.rows().await.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_answers_membership_in_one_call() {
        let alpha = record("Alpha", 1);
        let beta = record("Beta", 2);
        let store = MemoryFingerprintStore::with_rows(vec![alpha.clone()]);
        let known = store
            .known_fingerprints(&[alpha.fingerprint.clone(), beta.fingerprint.clone()])
            .await
            .unwrap();
        assert_eq!(known, HashSet::from([alpha.fingerprint]));
        assert_eq!(store.lookup_calls().await, 1);
    }
}
