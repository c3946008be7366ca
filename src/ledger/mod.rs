//! Decision ledger: the append-only record of verification verdicts.
//!
//! ## Append-Only Invariant
//!
//! Entries are never updated or deleted. A correction (appeal outcome,
//! manual override) is a new entry whose `supersedes` field points at the
//! entry it replaces; both remain queryable, so a dispute can always be
//! reconstructed as it unfolded.
//!
//! ## Idempotency
//!
//! Every record call carries a caller-supplied `request_id`. Retrying a
//! write with a request_id the ledger has already seen returns the
//! original entry unchanged; a retry carrying a *different* verdict for a
//! known request_id is a conflict, not a silent overwrite.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CourseId, LedgerEntryId, SessionId, StudentId, VerificationVerdict};

pub use memory::InMemoryLedger;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresLedger};

/// A persisted verdict with its ledger bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Ledger-assigned entry id.
    pub id: LedgerEntryId,
    /// Caller-supplied idempotency key for this record attempt.
    pub request_id: Uuid,
    /// Student the verdict concerns.
    pub student_id: StudentId,
    /// Session the verdict concerns.
    pub session_id: SessionId,
    /// Course the session belongs to.
    pub course_id: CourseId,
    /// The full verdict, scores and reasons included.
    pub verdict: VerificationVerdict,
    /// Opaque pointer to the raw evidence held by external storage.
    pub evidence_ref: Option<String>,
    /// When the ledger accepted the entry.
    pub recorded_at: DateTime<Utc>,
    /// Monotone per-ledger sequence number; defines chronological order.
    pub seq: u64,
    /// Entry this one corrects, if any.
    pub supersedes: Option<LedgerEntryId>,
}

/// Input to [`DecisionLedger::record`]; the ledger assigns `id` and `seq`.
#[derive(Debug, Clone)]
pub struct RecordRequest {
    /// Idempotency key; retries must reuse the original value.
    pub request_id: Uuid,
    /// Course the session belongs to.
    pub course_id: CourseId,
    /// The verdict to persist.
    pub verdict: VerificationVerdict,
    /// Opaque pointer to the raw evidence, if retained.
    pub evidence_ref: Option<String>,
    /// When the verdict was produced.
    pub recorded_at: DateTime<Utc>,
    /// Entry this record corrects, if any.
    pub supersedes: Option<LedgerEntryId>,
}

/// Errors common to ledger backends.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A known request_id arrived carrying a different verdict.
    #[error("request {request_id} already recorded with a different verdict")]
    RequestConflict {
        /// The conflicting idempotency key.
        request_id: Uuid,
    },
    /// The referenced `supersedes` entry does not exist.
    #[error("superseded entry {0} not found")]
    SupersededEntryNotFound(LedgerEntryId),
}

/// Trait for decision ledger backends.
///
/// Implementations must guarantee chronological (`seq`) ordering of query
/// results. All methods are async to support async database access.
#[async_trait]
pub trait DecisionLedger: Send + Sync {
    /// Error type for ledger operations.
    type Error: std::error::Error + Send + Sync;

    /// Append a verdict, idempotently by `request_id`.
    ///
    /// Returns the persisted entry; for a retried request_id this is the
    /// original entry, not a duplicate.
    async fn record(&self, request: RecordRequest) -> Result<LedgerEntry, Self::Error>;

    /// All entries for one student in one session, oldest first.
    async fn entries_for(
        &self,
        student_id: &StudentId,
        session_id: &SessionId,
    ) -> Result<Vec<LedgerEntry>, Self::Error>;

    /// All FLAG and REJECT entries for a course within `[from, to)`,
    /// oldest first.
    ///
    /// The instructor review queue.
    async fn flagged(
        &self,
        course_id: &CourseId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, Self::Error>;
}
