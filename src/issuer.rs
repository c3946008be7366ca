//! Session token issuer: mints and rotates check-in tokens, and owns the
//! atomic redemption contract.
//!
//! ## Rotation
//!
//! Tokens carry a TTL shorter than the QR surface's refresh interval, so a
//! screenshotted code expires before it can be meaningfully reused
//! remotely. Rotation is continuous: each `issue_token` call invalidates
//! the session's previous token. If rotation is delayed, the current
//! token's effective window is extended (bounded by a grace period) rather
//! than queueing rotations.
//!
//! ## Redemption Contract
//!
//! Marking a token consumed is a single atomic check-and-set under the
//! session's redemption lock, never read-then-write. Two concurrent
//! redemptions of one token yield exactly one success and one
//! `TokenAlreadyConsumed`.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::history::RedemptionAttempts;
use crate::types::{
    AttendanceSession, CheckChannel, CheckInToken, CourseId, Geofence, SessionId, SessionStatus,
    StudentId,
};

/// Default token TTL.
const DEFAULT_TOKEN_TTL_SECS: i64 = 45;

/// How long redemption attempts are retained for the temporal channel.
const ATTEMPT_RETENTION_SECS: i64 = 600;

/// Errors from session and token operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IssuerError {
    /// Session window is empty or inverted.
    #[error("invalid session window: valid_from must precede valid_to")]
    InvalidWindow,
    /// The course demands verification but no checks were requested.
    #[error("session policy requires at least one evidence check")]
    EmptyPolicy,
    /// Unknown session.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    /// Session exists but its window has not opened.
    #[error("session not active: {0}")]
    SessionNotActive(SessionId),
    /// Session window is over; terminal.
    #[error("session closed: {0}")]
    SessionClosed(SessionId),
    /// Presented token's TTL (plus rotation grace) has elapsed, or the
    /// token was rotated out.
    #[error("token expired")]
    TokenExpired,
    /// Token was already redeemed. `by_other` distinguishes QR-sharing
    /// (someone else got there first) from a double-tap by the same student.
    #[error("token already consumed (by another student: {by_other})")]
    TokenAlreadyConsumed {
        /// True when a different student consumed the token first.
        by_other: bool,
    },
    /// This student already holds a redemption for the session.
    #[error("student already redeemed a token for this session")]
    StudentAlreadyRedeemed,
    /// Value was never issued by this kernel (bad structure or signature).
    #[error("invalid token")]
    InvalidToken,
}

impl IssuerError {
    /// Generic, non-revealing message for the student-facing surface.
    ///
    /// Full detail stays in structured logs for instructors/security.
    pub fn student_message(&self) -> &'static str {
        match self {
            Self::SessionNotActive(_) | Self::SessionClosed(_) => {
                "Check-in is not open for this session."
            }
            Self::TokenExpired | Self::InvalidToken | Self::TokenAlreadyConsumed { .. } => {
                "This check-in code is no longer valid. Scan the code currently displayed."
            }
            Self::StudentAlreadyRedeemed => "You have already checked in for this session.",
            Self::InvalidWindow | Self::EmptyPolicy | Self::SessionNotFound(_) => {
                "Check-in is unavailable for this session."
            }
        }
    }
}

#[derive(Debug)]
struct TokenState {
    token: CheckInToken,
    consumed_by: Option<StudentId>,
}

#[derive(Debug, Default)]
struct RedemptionState {
    current: Option<TokenState>,
    redeemed_students: HashSet<StudentId>,
}

#[derive(Debug)]
struct SessionSlot {
    session: RwLock<AttendanceSession>,
    redemption: Mutex<RedemptionState>,
}

/// Mints sessions and tokens; arbitrates redemption.
pub struct SessionTokenIssuer {
    /// HMAC secret for signing token values. Issuer-internal only.
    secret: Vec<u8>,
    token_ttl: Duration,
    rotation_grace: Duration,
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    attempts: Arc<RedemptionAttempts>,
}

impl SessionTokenIssuer {
    /// Create an issuer with the default token TTL (45 s) and a rotation
    /// grace of one TTL.
    pub fn new(secret: Vec<u8>) -> Self {
        let ttl = Duration::seconds(DEFAULT_TOKEN_TTL_SECS);
        Self {
            secret,
            token_ttl: ttl,
            rotation_grace: ttl,
            sessions: RwLock::new(HashMap::new()),
            attempts: Arc::new(RedemptionAttempts::new()),
        }
    }

    /// Override the token TTL (rotation grace follows it).
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self.rotation_grace = ttl;
        self
    }

    /// Shared redemption-attempt window, for wiring into the engine.
    pub fn attempts(&self) -> Arc<RedemptionAttempts> {
        Arc::clone(&self.attempts)
    }

    /// Create a PENDING session for one course meeting.
    ///
    /// `Temporal` is stripped from `required_checks` if present; it is
    /// always evaluated and never a course-configurable requirement.
    pub fn create_session(
        &self,
        course_id: CourseId,
        valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
        mut required_checks: BTreeSet<CheckChannel>,
        geofence: Option<Geofence>,
    ) -> Result<AttendanceSession, IssuerError> {
        if valid_from >= valid_to {
            return Err(IssuerError::InvalidWindow);
        }
        required_checks.remove(&CheckChannel::Temporal);
        if required_checks.is_empty() {
            return Err(IssuerError::EmptyPolicy);
        }

        let session = AttendanceSession {
            id: SessionId::generate(),
            course_id,
            valid_from,
            valid_to,
            required_checks,
            geofence,
            status: SessionStatus::Pending,
        };

        tracing::info!(
            session_id = %session.id,
            course_id = %course_id,
            valid_from = %valid_from,
            valid_to = %valid_to,
            "attendance session created"
        );

        let slot = Arc::new(SessionSlot {
            session: RwLock::new(session.clone()),
            redemption: Mutex::new(RedemptionState::default()),
        });
        self.sessions.write().insert(session.id, slot);

        Ok(session)
    }

    fn slot(&self, session_id: &SessionId) -> Result<Arc<SessionSlot>, IssuerError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or(IssuerError::SessionNotFound(*session_id))
    }

    /// Current snapshot of a session, for the admin layer.
    pub fn session(&self, session_id: &SessionId) -> Result<AttendanceSession, IssuerError> {
        Ok(self.slot(session_id)?.session.read().clone())
    }

    /// Apply window-driven lifecycle transitions for one slot.
    fn sync_status(slot: &SessionSlot, now: DateTime<Utc>) -> SessionStatus {
        let mut session = slot.session.write();
        match session.status {
            SessionStatus::Pending if now >= session.valid_to => {
                session.status = SessionStatus::Closed;
            }
            SessionStatus::Pending if now >= session.valid_from => {
                session.status = SessionStatus::Active;
                tracing::info!(session_id = %session.id, "session activated");
            }
            SessionStatus::Active if now >= session.valid_to => {
                session.status = SessionStatus::Closed;
                tracing::info!(session_id = %session.id, "session closed at window end");
            }
            _ => {}
        }
        session.status
    }

    /// Apply window-driven transitions across all sessions.
    pub fn tick(&self, now: DateTime<Utc>) {
        let slots: Vec<Arc<SessionSlot>> = self.sessions.read().values().cloned().collect();
        for slot in slots {
            Self::sync_status(&slot, now);
        }
    }

    /// Manually activate a PENDING session (instructor opened early).
    pub fn activate(&self, session_id: &SessionId) -> Result<(), IssuerError> {
        let slot = self.slot(session_id)?;
        let mut session = slot.session.write();
        match session.status {
            SessionStatus::Closed => Err(IssuerError::SessionClosed(*session_id)),
            SessionStatus::Active => Ok(()),
            SessionStatus::Pending => {
                session.status = SessionStatus::Active;
                tracing::info!(session_id = %session_id, "session activated manually");
                Ok(())
            }
        }
    }

    /// Manually close a session. Idempotent; CLOSED is terminal.
    pub fn close(&self, session_id: &SessionId) -> Result<(), IssuerError> {
        let slot = self.slot(session_id)?;
        let mut session = slot.session.write();
        if session.status != SessionStatus::Closed {
            session.status = SessionStatus::Closed;
            tracing::info!(session_id = %session_id, "session closed manually");
        }
        Ok(())
    }

    /// Mint a fresh token for an ACTIVE session, rotating out the previous
    /// one.
    pub fn issue_token(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<CheckInToken, IssuerError> {
        let slot = self.slot(session_id)?;
        match Self::sync_status(&slot, now) {
            SessionStatus::Pending => return Err(IssuerError::SessionNotActive(*session_id)),
            SessionStatus::Closed => return Err(IssuerError::SessionClosed(*session_id)),
            SessionStatus::Active => {}
        }

        let token = CheckInToken::issue(&self.secret, *session_id, now, now + self.token_ttl);

        let mut redemption = slot.redemption.lock();
        redemption.current = Some(TokenState {
            token: token.clone(),
            consumed_by: None,
        });

        tracing::debug!(
            session_id = %session_id,
            expires_at = %token.expires_at,
            "token rotated"
        );

        Ok(token)
    }

    /// Redeem a presented token value for a student.
    ///
    /// On success the token is atomically marked consumed-by this student
    /// and the bound session id is returned. Every attempt, successful or
    /// not, feeds the temporal channel's attempt window.
    pub fn redeem_token(
        &self,
        value: &str,
        student_id: StudentId,
        now: DateTime<Utc>,
    ) -> Result<SessionId, IssuerError> {
        self.attempts.record(student_id, now, ATTEMPT_RETENTION_SECS);

        let result = self.redeem_inner(value, student_id, now);
        match &result {
            Ok(session_id) => {
                tracing::info!(session_id = %session_id, student_id = %student_id, "token redeemed");
            }
            Err(err) => {
                tracing::warn!(student_id = %student_id, error = %err, "token redemption refused");
            }
        }
        result
    }

    fn redeem_inner(
        &self,
        value: &str,
        student_id: StudentId,
        now: DateTime<Utc>,
    ) -> Result<SessionId, IssuerError> {
        let presented = CheckInToken::parse_and_verify(&self.secret, value)
            .ok_or(IssuerError::InvalidToken)?;
        let session_id = presented.session_id;

        let slot = self.slot(&session_id)?;
        match Self::sync_status(&slot, now) {
            SessionStatus::Pending => return Err(IssuerError::SessionNotActive(session_id)),
            SessionStatus::Closed => return Err(IssuerError::SessionClosed(session_id)),
            SessionStatus::Active => {}
        }

        // Single atomic check-and-set under the session's redemption lock.
        let mut redemption = slot.redemption.lock();
        let RedemptionState {
            current,
            redeemed_students,
        } = &mut *redemption;

        let state = match current.as_mut() {
            Some(state) if state.token.value == value => state,
            // Signature was valid, so this was a real token that has since
            // been rotated out.
            _ => {
                if redeemed_students.contains(&student_id) {
                    return Err(IssuerError::StudentAlreadyRedeemed);
                }
                return Err(IssuerError::TokenExpired);
            }
        };

        if now > state.token.expires_at + self.rotation_grace {
            return Err(IssuerError::TokenExpired);
        }
        if now > state.token.expires_at {
            // Rotation fell behind; the current token's window is extended
            // instead of queueing rotations.
            tracing::debug!(session_id = %session_id, "rotation delayed; honoring current token");
        }

        match state.consumed_by {
            Some(consumer) => Err(IssuerError::TokenAlreadyConsumed {
                by_other: consumer != student_id,
            }),
            None if redeemed_students.contains(&student_id) => {
                // Exactly-once per student per session, across rotations.
                Err(IssuerError::StudentAlreadyRedeemed)
            }
            None => {
                state.consumed_by = Some(student_id);
                redeemed_students.insert(student_id);
                Ok(session_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test_issuer_secret_32_bytes_min!";

    fn default_checks() -> BTreeSet<CheckChannel> {
        [CheckChannel::Location, CheckChannel::Device]
            .into_iter()
            .collect()
    }

    fn issuer() -> SessionTokenIssuer {
        SessionTokenIssuer::new(SECRET.to_vec())
    }

    fn open_session(issuer: &SessionTokenIssuer, now: DateTime<Utc>) -> AttendanceSession {
        let session = issuer
            .create_session(
                CourseId::generate(),
                now - Duration::minutes(1),
                now + Duration::minutes(59),
                default_checks(),
                None,
            )
            .unwrap();
        issuer.activate(&session.id).unwrap();
        session
    }

    #[test]
    fn test_create_session_validates_window() {
        let issuer = issuer();
        let now = Utc::now();
        let err = issuer
            .create_session(CourseId::generate(), now, now, default_checks(), None)
            .unwrap_err();
        assert_eq!(err, IssuerError::InvalidWindow);
    }

    #[test]
    fn test_create_session_rejects_empty_policy() {
        let issuer = issuer();
        let now = Utc::now();
        let err = issuer
            .create_session(
                CourseId::generate(),
                now,
                now + Duration::hours(1),
                BTreeSet::new(),
                None,
            )
            .unwrap_err();
        assert_eq!(err, IssuerError::EmptyPolicy);

        // Temporal alone does not satisfy the policy either.
        let err = issuer
            .create_session(
                CourseId::generate(),
                now,
                now + Duration::hours(1),
                [CheckChannel::Temporal].into_iter().collect(),
                None,
            )
            .unwrap_err();
        assert_eq!(err, IssuerError::EmptyPolicy);
    }

    #[test]
    fn test_issue_before_window_fails_not_active() {
        let issuer = issuer();
        let now = Utc::now();
        let session = issuer
            .create_session(
                CourseId::generate(),
                now + Duration::minutes(10),
                now + Duration::minutes(70),
                default_checks(),
                None,
            )
            .unwrap();

        let err = issuer.issue_token(&session.id, now).unwrap_err();
        assert_eq!(err, IssuerError::SessionNotActive(session.id));
    }

    #[test]
    fn test_issue_after_window_fails_closed() {
        let issuer = issuer();
        let now = Utc::now();
        let session = issuer
            .create_session(
                CourseId::generate(),
                now - Duration::hours(2),
                now - Duration::hours(1),
                default_checks(),
                None,
            )
            .unwrap();

        let err = issuer.issue_token(&session.id, now).unwrap_err();
        assert_eq!(err, IssuerError::SessionClosed(session.id));
    }

    #[test]
    fn test_auto_activation_at_valid_from() {
        let issuer = issuer();
        let now = Utc::now();
        let session = issuer
            .create_session(
                CourseId::generate(),
                now - Duration::seconds(1),
                now + Duration::hours(1),
                default_checks(),
                None,
            )
            .unwrap();
        assert_eq!(session.status, SessionStatus::Pending);

        // Window has opened; issuance succeeds and the state reflects it.
        assert!(issuer.issue_token(&session.id, now).is_ok());
        assert_eq!(
            issuer.session(&session.id).unwrap().status,
            SessionStatus::Active
        );
    }

    #[test]
    fn test_redeem_happy_path() {
        let issuer = issuer();
        let now = Utc::now();
        let session = open_session(&issuer, now);
        let token = issuer.issue_token(&session.id, now).unwrap();

        let redeemed = issuer
            .redeem_token(&token.value, StudentId::generate(), now)
            .unwrap();
        assert_eq!(redeemed, session.id);
    }

    #[test]
    fn test_second_student_gets_already_consumed() {
        let issuer = issuer();
        let now = Utc::now();
        let session = open_session(&issuer, now);
        let token = issuer.issue_token(&session.id, now).unwrap();

        issuer
            .redeem_token(&token.value, StudentId::generate(), now)
            .unwrap();
        let err = issuer
            .redeem_token(&token.value, StudentId::generate(), now)
            .unwrap_err();
        assert_eq!(err, IssuerError::TokenAlreadyConsumed { by_other: true });
    }

    #[test]
    fn test_same_student_double_tap() {
        let issuer = issuer();
        let now = Utc::now();
        let session = open_session(&issuer, now);
        let token = issuer.issue_token(&session.id, now).unwrap();
        let student = StudentId::generate();

        issuer.redeem_token(&token.value, student, now).unwrap();
        let err = issuer.redeem_token(&token.value, student, now).unwrap_err();
        // A double-tap on the same token is distinguishable from sharing.
        assert_eq!(err, IssuerError::TokenAlreadyConsumed { by_other: false });
    }

    #[test]
    fn test_student_cannot_redeem_two_rotations() {
        let issuer = issuer();
        let now = Utc::now();
        let session = open_session(&issuer, now);
        let student = StudentId::generate();

        let first = issuer.issue_token(&session.id, now).unwrap();
        issuer.redeem_token(&first.value, student, now).unwrap();

        let second = issuer.issue_token(&session.id, now).unwrap();
        let err = issuer.redeem_token(&second.value, student, now).unwrap_err();
        assert_eq!(err, IssuerError::StudentAlreadyRedeemed);
    }

    #[test]
    fn test_rotation_invalidates_previous_token() {
        let issuer = issuer();
        let now = Utc::now();
        let session = open_session(&issuer, now);

        let first = issuer.issue_token(&session.id, now).unwrap();
        let _second = issuer.issue_token(&session.id, now).unwrap();

        let err = issuer
            .redeem_token(&first.value, StudentId::generate(), now)
            .unwrap_err();
        assert_eq!(err, IssuerError::TokenExpired);
    }

    #[test]
    fn test_delayed_rotation_extends_current_token() {
        let issuer = issuer();
        let now = Utc::now();
        let session = open_session(&issuer, now);
        let token = issuer.issue_token(&session.id, now).unwrap();

        // Past nominal expiry but within the rotation grace.
        let late = token.expires_at + Duration::seconds(10);
        assert!(issuer
            .redeem_token(&token.value, StudentId::generate(), late)
            .is_ok());
    }

    #[test]
    fn test_token_expired_beyond_grace() {
        let issuer = issuer();
        let now = Utc::now();
        let session = open_session(&issuer, now);
        let token = issuer.issue_token(&session.id, now).unwrap();

        let too_late = token.expires_at + Duration::seconds(DEFAULT_TOKEN_TTL_SECS + 1);
        let err = issuer
            .redeem_token(&token.value, StudentId::generate(), too_late)
            .unwrap_err();
        assert_eq!(err, IssuerError::TokenExpired);
    }

    #[test]
    fn test_redeem_after_close_fails_closed() {
        let issuer = issuer();
        let now = Utc::now();
        let session = open_session(&issuer, now);
        let token = issuer.issue_token(&session.id, now).unwrap();

        issuer.close(&session.id).unwrap();
        let err = issuer
            .redeem_token(&token.value, StudentId::generate(), now)
            .unwrap_err();
        assert_eq!(err, IssuerError::SessionClosed(session.id));
    }

    #[test]
    fn test_garbage_value_is_invalid_token() {
        let issuer = issuer();
        let err = issuer
            .redeem_token("atk1.nope", StudentId::generate(), Utc::now())
            .unwrap_err();
        assert_eq!(err, IssuerError::InvalidToken);
    }

    #[test]
    fn test_concurrent_redemption_exactly_one_success() {
        let issuer = Arc::new(issuer());
        let now = Utc::now();
        let session = open_session(&issuer, now);
        let token = issuer.issue_token(&session.id, now).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let issuer = Arc::clone(&issuer);
            let value = token.value.clone();
            handles.push(std::thread::spawn(move || {
                issuer.redeem_token(&value, StudentId::generate(), now)
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let consumed = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(IssuerError::TokenAlreadyConsumed { by_other: true })
                )
            })
            .count();

        assert_eq!(successes, 1, "exactly one redemption may succeed");
        assert_eq!(consumed, 7, "all others must observe TokenAlreadyConsumed");
    }

    #[test]
    fn test_closed_is_terminal() {
        let issuer = issuer();
        let now = Utc::now();
        let session = open_session(&issuer, now);
        issuer.close(&session.id).unwrap();

        let err = issuer.activate(&session.id).unwrap_err();
        assert_eq!(err, IssuerError::SessionClosed(session.id));
    }

    #[test]
    fn test_student_messages_do_not_leak_detail() {
        let msg = IssuerError::TokenAlreadyConsumed { by_other: true }.student_message();
        assert!(!msg.contains("student"));
        assert!(!msg.to_lowercase().contains("consumed"));
    }
}
