//! PostgreSQL decision ledger for production use.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)
//!
//! ## Schema
//!
//! See [`LEDGER_TABLE_SCHEMA`]. The `request_id` unique constraint is what
//! makes `record` idempotent under concurrent retries: the insert uses
//! `ON CONFLICT (request_id) DO NOTHING` and reads back the winner.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

use super::{DecisionLedger, LedgerEntry, LedgerError, RecordRequest};
use crate::types::{LedgerEntryId, SessionId, StudentId, VerificationVerdict};

/// DDL for the ledger table. Applied out-of-band by migrations.
pub const LEDGER_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS attendance_ledger (
    id            UUID PRIMARY KEY,
    request_id    UUID NOT NULL UNIQUE,
    student_id    UUID NOT NULL,
    session_id    UUID NOT NULL,
    course_id     UUID NOT NULL,
    verdict       JSONB NOT NULL,
    decision      TEXT NOT NULL,
    evidence_ref  TEXT,
    recorded_at   TIMESTAMPTZ NOT NULL,
    seq           BIGSERIAL,
    supersedes    UUID REFERENCES attendance_ledger(id)
);
CREATE INDEX IF NOT EXISTS idx_ledger_student_session
    ON attendance_ledger (student_id, session_id, seq);
CREATE INDEX IF NOT EXISTS idx_ledger_course_review
    ON attendance_ledger (course_id, recorded_at, decision);
"#;

/// Configuration for PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum connections in pool (default: 10).
    pub max_connections: u32,
    /// Minimum idle connections to keep warm (default: 2).
    pub min_connections: u32,
    /// Connection acquire timeout in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds (default: 300 = 5 min).
    pub idle_timeout_secs: u64,
    /// Maximum connection lifetime in seconds (default: 1800 = 30 min).
    pub max_lifetime_secs: u64,
}

impl PostgresConfig {
    /// Load configuration from environment variables with production defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/attendance".to_string()),
            max_connections: env_parse("DB_MAX_CONNECTIONS", 10),
            min_connections: env_parse("DB_MIN_CONNECTIONS", 2),
            connect_timeout_secs: env_parse("DB_CONNECT_TIMEOUT_SECS", 10),
            idle_timeout_secs: env_parse("DB_IDLE_TIMEOUT_SECS", 300),
            max_lifetime_secs: env_parse("DB_MAX_LIFETIME_SECS", 1800),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Error type for the PostgreSQL ledger.
#[derive(Debug, thiserror::Error)]
pub enum PostgresLedgerError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Verdict JSON (de)serialization error.
    #[error("verdict serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Ledger-level invariant violation.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// PostgreSQL-backed decision ledger.
///
/// Uses connection pooling with production-tuned settings.
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Create a new ledger with the given configuration.
    pub async fn new(config: PostgresConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            idle_timeout_secs = config.idle_timeout_secs,
            max_lifetime_secs = config.max_lifetime_secs,
            "initializing PostgreSQL connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Create a ledger from environment variables.
    pub async fn from_env() -> Result<Self, sqlx::Error> {
        Self::new(PostgresConfig::from_env()).await
    }

    /// Get the connection pool for health checks.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    fn parse_entry_row(row: &PgRow) -> Result<LedgerEntry, PostgresLedgerError> {
        let verdict_json: serde_json::Value = row.try_get("verdict")?;
        let verdict: VerificationVerdict = serde_json::from_value(verdict_json)?;
        let seq: i64 = row.try_get("seq")?;
        let supersedes: Option<Uuid> = row.try_get("supersedes")?;

        Ok(LedgerEntry {
            id: LedgerEntryId::new(row.try_get("id")?),
            request_id: row.try_get("request_id")?,
            student_id: StudentId::new(row.try_get("student_id")?),
            session_id: SessionId::new(row.try_get("session_id")?),
            course_id: crate::types::CourseId::new(row.try_get("course_id")?),
            verdict,
            evidence_ref: row.try_get("evidence_ref")?,
            recorded_at: row.try_get("recorded_at")?,
            seq: seq as u64,
            supersedes: supersedes.map(LedgerEntryId::new),
        })
    }

    async fn fetch_by_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<LedgerEntry>, PostgresLedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, request_id, student_id, session_id, course_id, verdict,
                   evidence_ref, recorded_at, seq, supersedes
            FROM attendance_ledger
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_entry_row).transpose()
    }
}

#[async_trait]
impl DecisionLedger for PostgresLedger {
    type Error = PostgresLedgerError;

    async fn record(&self, request: RecordRequest) -> Result<LedgerEntry, Self::Error> {
        if let Some(superseded) = &request.supersedes {
            let exists = sqlx::query("SELECT 1 FROM attendance_ledger WHERE id = $1")
                .bind(superseded.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(LedgerError::SupersededEntryNotFound(*superseded).into());
            }
        }

        let entry_id = LedgerEntryId::generate();
        let verdict_json = serde_json::to_value(&request.verdict)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO attendance_ledger
                (id, request_id, student_id, session_id, course_id, verdict,
                 decision, evidence_ref, recorded_at, supersedes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (request_id) DO NOTHING
            RETURNING id, request_id, student_id, session_id, course_id, verdict,
                      evidence_ref, recorded_at, seq, supersedes
            "#,
        )
        .bind(entry_id.as_uuid())
        .bind(request.request_id)
        .bind(request.verdict.student_id.as_uuid())
        .bind(request.verdict.session_id.as_uuid())
        .bind(request.course_id.as_uuid())
        .bind(&verdict_json)
        .bind(request.verdict.decision.to_string())
        .bind(&request.evidence_ref)
        .bind(request.recorded_at)
        .bind(request.supersedes.map(|s| s.as_uuid()))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref row) = inserted {
            let entry = Self::parse_entry_row(row)?;
            tracing::debug!(
                entry_id = %entry.id,
                student_id = %entry.student_id,
                session_id = %entry.session_id,
                decision = %entry.verdict.decision,
                seq = entry.seq,
                "ledger entry recorded"
            );
            return Ok(entry);
        }

        // A concurrent or earlier write with this request_id won; return it
        // if the payload matches.
        let existing = self.fetch_by_request(request.request_id).await?.ok_or(
            // Insert conflicted but the row vanished; surface as conflict.
            LedgerError::RequestConflict {
                request_id: request.request_id,
            },
        )?;

        if existing.verdict.fingerprint != request.verdict.fingerprint {
            return Err(LedgerError::RequestConflict {
                request_id: request.request_id,
            }
            .into());
        }
        tracing::debug!(
            request_id = %request.request_id,
            entry_id = %existing.id,
            "duplicate record request; returning original entry"
        );
        Ok(existing)
    }

    async fn entries_for(
        &self,
        student_id: &StudentId,
        session_id: &SessionId,
    ) -> Result<Vec<LedgerEntry>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, request_id, student_id, session_id, course_id, verdict,
                   evidence_ref, recorded_at, seq, supersedes
            FROM attendance_ledger
            WHERE student_id = $1 AND session_id = $2
            ORDER BY seq
            "#,
        )
        .bind(student_id.as_uuid())
        .bind(session_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_entry_row).collect()
    }

    async fn flagged(
        &self,
        course_id: &crate::types::CourseId,
        from: chrono::DateTime<chrono::Utc>,
        to: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<LedgerEntry>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, request_id, student_id, session_id, course_id, verdict,
                   evidence_ref, recorded_at, seq, supersedes
            FROM attendance_ledger
            WHERE course_id = $1
              AND recorded_at >= $2 AND recorded_at < $3
              AND decision IN ('FLAG', 'REJECT')
            ORDER BY seq
            "#,
        )
        .bind(course_id.as_uuid())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_entry_row).collect()
    }
}
