//! In-memory decision ledger for tests and single-process deployments.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{DecisionLedger, LedgerEntry, LedgerError, RecordRequest};
use crate::types::{CourseId, Decision, LedgerEntryId, SessionId, StudentId};

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<LedgerEntry>,
    by_request: HashMap<Uuid, usize>,
    next_seq: u64,
}

/// Append-only ledger backed by a process-local vector.
///
/// A single write lock serializes appends, which is what makes `seq`
/// assignment atomic with the idempotency check.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    inner: RwLock<Inner>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries recorded.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

#[async_trait]
impl DecisionLedger for InMemoryLedger {
    type Error = LedgerError;

    async fn record(&self, request: RecordRequest) -> Result<LedgerEntry, Self::Error> {
        let mut inner = self.inner.write();

        if let Some(&index) = inner.by_request.get(&request.request_id) {
            let existing = &inner.entries[index];
            if existing.verdict.fingerprint != request.verdict.fingerprint {
                return Err(LedgerError::RequestConflict {
                    request_id: request.request_id,
                });
            }
            tracing::debug!(
                request_id = %request.request_id,
                entry_id = %existing.id,
                "duplicate record request; returning original entry"
            );
            return Ok(existing.clone());
        }

        if let Some(superseded) = &request.supersedes {
            if !inner.entries.iter().any(|e| &e.id == superseded) {
                return Err(LedgerError::SupersededEntryNotFound(*superseded));
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let entry = LedgerEntry {
            id: LedgerEntryId::generate(),
            request_id: request.request_id,
            student_id: request.verdict.student_id,
            session_id: request.verdict.session_id,
            course_id: request.course_id,
            verdict: request.verdict,
            evidence_ref: request.evidence_ref,
            recorded_at: request.recorded_at,
            seq,
            supersedes: request.supersedes,
        };

        let index = inner.entries.len();
        inner.entries.push(entry.clone());
        inner.by_request.insert(entry.request_id, index);

        tracing::debug!(
            entry_id = %entry.id,
            student_id = %entry.student_id,
            session_id = %entry.session_id,
            decision = %entry.verdict.decision,
            seq = entry.seq,
            "ledger entry recorded"
        );

        Ok(entry)
    }

    async fn entries_for(
        &self,
        student_id: &StudentId,
        session_id: &SessionId,
    ) -> Result<Vec<LedgerEntry>, Self::Error> {
        let inner = self.inner.read();
        // Entries are stored in seq order already.
        Ok(inner
            .entries
            .iter()
            .filter(|e| &e.student_id == student_id && &e.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn flagged(
        &self,
        course_id: &CourseId,
        from: chrono::DateTime<chrono::Utc>,
        to: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<LedgerEntry>, Self::Error> {
        let inner = self.inner.read();
        Ok(inner
            .entries
            .iter()
            .filter(|e| {
                &e.course_id == course_id
                    && e.recorded_at >= from
                    && e.recorded_at < to
                    && matches!(e.verdict.decision, Decision::Flag | Decision::Reject)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckChannel, CourseId, Reason, ReasonCode, VerificationVerdict};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn verdict(
        student_id: StudentId,
        session_id: SessionId,
        decision: Decision,
        risk: f64,
    ) -> VerificationVerdict {
        let mut scores = BTreeMap::new();
        scores.insert(CheckChannel::Device, risk);
        let reasons = if risk > 0.0 {
            vec![Reason::new(ReasonCode::NewDevice)]
        } else {
            Vec::new()
        };
        VerificationVerdict::new(
            student_id,
            session_id,
            scores,
            risk,
            decision,
            reasons,
            "verification_policy_v1".to_string(),
            "params".to_string(),
            "1.0.0".to_string(),
        )
    }

    fn request(verdict: VerificationVerdict) -> RecordRequest {
        RecordRequest {
            request_id: Uuid::new_v4(),
            course_id: CourseId::generate(),
            verdict,
            evidence_ref: None,
            recorded_at: Utc::now(),
            supersedes: None,
        }
    }

    #[tokio::test]
    async fn test_record_and_query() {
        let ledger = InMemoryLedger::new();
        let student = StudentId::generate();
        let session = SessionId::generate();

        let entry = ledger
            .record(request(verdict(student, session, Decision::Accept, 0.0)))
            .await
            .unwrap();
        assert_eq!(entry.seq, 0);

        let entries = ledger.entries_for(&student, &session).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, entry.id);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_returns_original() {
        let ledger = InMemoryLedger::new();
        let student = StudentId::generate();
        let session = SessionId::generate();

        let mut req = request(verdict(student, session, Decision::Accept, 0.0));
        req.request_id = Uuid::from_u128(42);
        let first = ledger.record(req.clone()).await.unwrap();
        let second = ledger.record(req).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_retry_is_rejected() {
        let ledger = InMemoryLedger::new();
        let student = StudentId::generate();
        let session = SessionId::generate();

        let mut req = request(verdict(student, session, Decision::Accept, 0.0));
        req.request_id = Uuid::from_u128(7);
        ledger.record(req.clone()).await.unwrap();

        // Same request_id, different verdict content.
        req.verdict = verdict(student, session, Decision::Flag, 50.0);
        let err = ledger.record(req).await.unwrap_err();
        assert!(matches!(err, LedgerError::RequestConflict { .. }));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_flagged_queue_excludes_accepts() {
        let ledger = InMemoryLedger::new();
        let course = CourseId::generate();
        let session = SessionId::generate();
        let now = Utc::now();

        for (decision, risk) in [
            (Decision::Accept, 0.0),
            (Decision::Flag, 50.0),
            (Decision::Reject, 90.0),
        ] {
            let mut req = request(verdict(StudentId::generate(), session, decision, risk));
            req.course_id = course;
            ledger.record(req).await.unwrap();
        }

        let queue = ledger
            .flagged(&course, now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(queue.len(), 2);
        assert!(queue[0].seq < queue[1].seq);

        // Outside the date range nothing matches.
        let empty = ledger
            .flagged(&course, now + chrono::Duration::hours(2), now + chrono::Duration::hours(3))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_supersedes_chain() {
        let ledger = InMemoryLedger::new();
        let student = StudentId::generate();
        let session = SessionId::generate();

        let original = ledger
            .record(request(verdict(student, session, Decision::Flag, 50.0)))
            .await
            .unwrap();

        let mut correction = request(verdict(student, session, Decision::Accept, 0.0));
        correction.supersedes = Some(original.id);
        let corrected = ledger.record(correction).await.unwrap();
        assert_eq!(corrected.supersedes, Some(original.id));

        // Both the original and the correction stay queryable.
        let entries = ledger.entries_for(&student, &session).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, original.id);
        assert_eq!(entries[1].id, corrected.id);
    }

    #[tokio::test]
    async fn test_unknown_supersedes_rejected() {
        let ledger = InMemoryLedger::new();
        let mut req = request(verdict(
            StudentId::generate(),
            SessionId::generate(),
            Decision::Accept,
            0.0,
        ));
        req.supersedes = Some(LedgerEntryId::generate());

        let err = ledger.record(req).await.unwrap_err();
        assert!(matches!(err, LedgerError::SupersededEntryNotFound(_)));
    }
}
