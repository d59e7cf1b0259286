//! Postgres record store + HTTP fetch utilities for voidscan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;
use voidscan_core::{CompetitionLevel, Difficulty, OpportunityRecord, RecordStatus};

pub const CRATE_NAME: &str = "voidscan-storage";

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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
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
    pub global_concurrency: usize,
    pub per_service_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_service_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared outbound HTTP client. External lookups (market data, funded-project
/// registry) go through this so retries and concurrency caps apply uniformly.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_service_limit: usize,
    per_service: Mutex<HashMap<String, Arc<Semaphore>>>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_service_limit: config.per_service_concurrency.max(1),
            per_service: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_service_semaphore(&self, service: &str) -> Arc<Semaphore> {
        let mut map = self.per_service.lock().await;
        map.entry(service.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_service_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        service: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_service = self.per_service_semaphore(service).await;
        let _service = per_service.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, service, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("row for {stable_id} carries invalid {field}: {value}")]
    InvalidEnum {
        stable_id: String,
        field: &'static str,
        value: String,
    },
}

/// Persisted category together with its projects, as stored between runs.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCategory {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub strategic: bool,
    pub strategic_multiplier: f64,
    pub projects: Vec<StoredProject>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredProject {
    pub name: String,
    pub description: String,
    pub value_locked: f64,
    pub stars: i64,
    pub forks: i64,
    pub last_commit: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Write seam the reconciliation stage drives. Kept behind a trait so the
/// upsert/sweep logic is testable against an in-memory double.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_by_stable_id(
        &self,
        stable_id: &str,
    ) -> Result<Option<OpportunityRecord>, StoreError>;

    async fn insert_record(&self, record: &OpportunityRecord) -> Result<(), StoreError>;

    async fn update_record(&self, record: &OpportunityRecord) -> Result<(), StoreError>;

    /// Bulk-transition active records whose stable id is absent from `seen`
    /// to filling. Returns the number of demoted rows.
    async fn demote_missing(&self, seen: &[String]) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgOpportunityStore {
    pool: PgPool,
}

impl PgOpportunityStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub async fn load_categories(&self) -> Result<Vec<StoredCategory>, StoreError> {
        let category_rows = sqlx::query(
            r#"
            SELECT id, name, slug, strategic, strategic_multiplier
              FROM categories
             ORDER BY slug
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut categories = Vec::with_capacity(category_rows.len());
        for row in category_rows {
            let id: Uuid = row.try_get("id")?;
            let project_rows = sqlx::query(
                r#"
                SELECT name, description, value_locked, stars, forks, last_commit, active
                  FROM projects
                 WHERE category_id = $1
                 ORDER BY name
                "#,
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

            let mut projects = Vec::with_capacity(project_rows.len());
            for p in project_rows {
                projects.push(StoredProject {
                    name: p.try_get("name")?,
                    description: p.try_get("description")?,
                    value_locked: p.try_get("value_locked")?,
                    stars: p.try_get("stars")?,
                    forks: p.try_get("forks")?,
                    last_commit: p.try_get("last_commit")?,
                    active: p.try_get("active")?,
                });
            }

            categories.push(StoredCategory {
                id,
                name: row.try_get("name")?,
                slug: row.try_get("slug")?,
                strategic: row.try_get("strategic")?,
                strategic_multiplier: row.try_get("strategic_multiplier")?,
                projects,
            });
        }
        Ok(categories)
    }
}

fn parse_difficulty(stable_id: &str, value: &str) -> Result<Difficulty, StoreError> {
    match value {
        "beginner" => Ok(Difficulty::Beginner),
        "intermediate" => Ok(Difficulty::Intermediate),
        "advanced" => Ok(Difficulty::Advanced),
        other => Err(StoreError::InvalidEnum {
            stable_id: stable_id.to_string(),
            field: "difficulty",
            value: other.to_string(),
        }),
    }
}

fn parse_competition(stable_id: &str, value: &str) -> Result<CompetitionLevel, StoreError> {
    match value {
        "low" => Ok(CompetitionLevel::Low),
        "medium" => Ok(CompetitionLevel::Medium),
        "high" => Ok(CompetitionLevel::High),
        other => Err(StoreError::InvalidEnum {
            stable_id: stable_id.to_string(),
            field: "competition_level",
            value: other.to_string(),
        }),
    }
}

fn parse_status(stable_id: &str, value: &str) -> Result<RecordStatus, StoreError> {
    match value {
        "active" => Ok(RecordStatus::Active),
        "filling" => Ok(RecordStatus::Filling),
        other => Err(StoreError::InvalidEnum {
            stable_id: stable_id.to_string(),
            field: "status",
            value: other.to_string(),
        }),
    }
}

fn string_list(value: serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<OpportunityRecord, StoreError> {
    let stable_id: String = row.try_get("stable_id")?;
    let difficulty: String = row.try_get("difficulty")?;
    let competition: String = row.try_get("competition_level")?;
    let status: String = row.try_get("status")?;
    let suggested: serde_json::Value = row.try_get("suggested_features")?;
    let evidence: serde_json::Value = row.try_get("evidence_projects")?;
    let void_confidence: i32 = row.try_get("void_confidence")?;

    Ok(OpportunityRecord {
        difficulty: parse_difficulty(&stable_id, &difficulty)?,
        competition_level: parse_competition(&stable_id, &competition)?,
        status: parse_status(&stable_id, &status)?,
        category_id: row.try_get("category_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        gap_score: row.try_get("gap_score")?,
        demand_score: row.try_get("demand_score")?,
        reasoning: row.try_get("reasoning")?,
        suggested_features: string_list(suggested),
        evidence_projects: string_list(evidence),
        void_confidence: void_confidence.clamp(1, 10) as u8,
        updated_at: row.try_get("updated_at")?,
        stable_id,
    })
}

#[async_trait]
impl RecordStore for PgOpportunityStore {
    async fn find_by_stable_id(
        &self,
        stable_id: &str,
    ) -> Result<Option<OpportunityRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT stable_id, category_id, title, description, gap_score, demand_score,
                   competition_level, reasoning, suggested_features, difficulty,
                   evidence_projects, void_confidence, status, updated_at
              FROM opportunities
             WHERE stable_id = $1
            "#,
        )
        .bind(stable_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert_record(&self, record: &OpportunityRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO opportunities
                   (stable_id, category_id, title, description, gap_score, demand_score,
                    competition_level, reasoning, suggested_features, difficulty,
                    evidence_projects, void_confidence, status, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&record.stable_id)
        .bind(record.category_id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(record.gap_score)
        .bind(record.demand_score)
        .bind(serde_json::json!(record.competition_level).as_str().unwrap_or("medium").to_string())
        .bind(&record.reasoning)
        .bind(serde_json::json!(record.suggested_features))
        .bind(serde_json::json!(record.difficulty).as_str().unwrap_or("intermediate").to_string())
        .bind(serde_json::json!(record.evidence_projects))
        .bind(record.void_confidence as i32)
        .bind(record.status.as_str())
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_record(&self, record: &OpportunityRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE opportunities
               SET category_id = $2,
                   title = $3,
                   description = $4,
                   gap_score = $5,
                   demand_score = $6,
                   competition_level = $7,
                   reasoning = $8,
                   suggested_features = $9,
                   difficulty = $10,
                   evidence_projects = $11,
                   void_confidence = $12,
                   status = $13,
                   updated_at = $14
             WHERE stable_id = $1
            "#,
        )
        .bind(&record.stable_id)
        .bind(record.category_id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(record.gap_score)
        .bind(record.demand_score)
        .bind(serde_json::json!(record.competition_level).as_str().unwrap_or("medium").to_string())
        .bind(&record.reasoning)
        .bind(serde_json::json!(record.suggested_features))
        .bind(serde_json::json!(record.difficulty).as_str().unwrap_or("intermediate").to_string())
        .bind(serde_json::json!(record.evidence_projects))
        .bind(record.void_confidence as i32)
        .bind(record.status.as_str())
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn demote_missing(&self, seen: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE opportunities
               SET status = 'filling',
                   updated_at = NOW()
             WHERE status = 'active'
               AND NOT (stable_id = ANY($1))
            "#,
        )
        .bind(seen)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn enum_parsers_reject_unknown_values() {
        assert!(parse_difficulty("abc", "beginner").is_ok());
        assert!(parse_difficulty("abc", "expert").is_err());
        assert!(parse_competition("abc", "high").is_ok());
        assert!(parse_competition("abc", "none").is_err());
        assert!(parse_status("abc", "filling").is_ok());
        assert!(parse_status("abc", "archived").is_err());
    }

    #[test]
    fn string_list_tolerates_non_array_json() {
        assert_eq!(
            string_list(serde_json::json!(["a", "b"])),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(string_list(serde_json::json!({"not": "an array"})).is_empty());
    }
}
