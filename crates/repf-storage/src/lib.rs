//! HTTP fetch utilities (bounded retry + backoff) and the Postgres upsert
//! writer for REPF.

use std::time::Duration;

use anyhow::Context;
use repf_core::{CleanRecord, DomainSpec};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info_span};

pub const CRATE_NAME: &str = "repf-storage";

/// Upsert batches are chunked to stay well under Postgres's bind limit.
const UPSERT_CHUNK_ROWS: usize = 500;

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Retrying GET client shared by the API-backed source readers.
///
/// Constructed once per pipeline run and passed into each reader; there is no
/// cached module-level session.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
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
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET with query parameters, retrying transient failures with
    /// exponential backoff until the retry budget is exhausted.
    pub async fn get_bytes(
        &self,
        source: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", source, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).query(query).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, %status, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retryable request error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("migration failure: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Postgres-backed store with a merge-by-date write path.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Upserts cleaned records into the domain table, keyed on `date`.
    ///
    /// An existing row for a date is replaced in place; a new date is
    /// inserted; no duplicate date rows are ever created. An empty batch is
    /// a no-op returning 0.
    pub async fn upsert(
        &self,
        spec: &DomainSpec,
        records: &[CleanRecord],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut written = 0u64;
        for chunk in records.chunks(UPSERT_CHUNK_ROWS) {
            let sql = upsert_sql(spec, chunk.len());
            let mut query = sqlx::query(&sql);
            for record in chunk {
                query = query.bind(record.date).bind(record.target);
                for metric in spec.metrics {
                    query = query.bind(record.metric(metric.name));
                }
            }
            let result = query.execute(&self.pool).await?;
            written += result.rows_affected();
        }
        Ok(written)
    }
}

/// Builds the multi-row `INSERT ... ON CONFLICT (date) DO UPDATE` statement
/// for a domain table. Pure so the conflict-resolution shape is testable
/// without a live store.
pub fn upsert_sql(spec: &DomainSpec, row_count: usize) -> String {
    let mut columns = vec!["date".to_string(), quote_ident(spec.target_column)];
    columns.extend(spec.metrics.iter().map(|m| quote_ident(m.name)));

    let width = columns.len();
    let mut rows = Vec::with_capacity(row_count);
    for row in 0..row_count {
        let placeholders = (0..width)
            .map(|col| format!("${}", row * width + col + 1))
            .collect::<Vec<_>>()
            .join(", ");
        rows.push(format!("({placeholders})"));
    }

    let updates = columns
        .iter()
        .skip(1)
        .map(|col| format!("{col} = EXCLUDED.{col}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT (date) DO UPDATE SET {}",
        spec.table,
        columns.join(", "),
        rows.join(", "),
        updates
    )
}

// Metric names like QmnJ are mixed-case Postgres identifiers.
fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use repf_core::EnergyDomain;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn default_backoff_matches_retry_budget() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn hydro_upsert_sql_replaces_by_date() {
        let sql = upsert_sql(EnergyDomain::Hydro.spec(), 2);
        assert!(sql.starts_with(
            "INSERT INTO hydro_data (date, \"prod_hydro\", \"QmnJ\", \"HIXnJ\") VALUES"
        ));
        assert!(sql.contains("($1, $2, $3, $4), ($5, $6, $7, $8)"));
        assert!(sql.contains("ON CONFLICT (date) DO UPDATE SET"));
        assert!(sql.contains("\"prod_hydro\" = EXCLUDED.\"prod_hydro\""));
        assert!(sql.contains("\"QmnJ\" = EXCLUDED.\"QmnJ\""));
        // The conflict key itself is never rewritten.
        assert!(!sql.contains("date = EXCLUDED.date"));
    }

    #[test]
    fn wind_upsert_sql_lists_all_weather_columns() {
        let sql = upsert_sql(EnergyDomain::Wind.spec(), 1);
        assert!(sql.contains("\"wind_speed_10m_mean\""));
        assert!(sql.contains("\"pressure_msl_mean\""));
        assert!(sql.contains("\"temperature_2m_mean\""));
    }
}
