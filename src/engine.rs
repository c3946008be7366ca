//! Verification engine: turns a redeemed token's evidence bundle into a
//! `VerificationVerdict`.
//!
//! ## Algorithm
//!
//! 1. Validate the bundle's shape (`MalformedEvidence` aborts the attempt)
//! 2. Score each channel the session policy enables
//! 3. Combine scores with renormalized weights over the enabled subset
//! 4. Map overall risk to ACCEPT / FLAG / REJECT via policy thresholds
//! 5. Append every triggered rule to `reasons`
//! 6. On ACCEPT/FLAG, record the device sighting into history
//!
//! ## Degradation
//!
//! If the external photo-confidence call fails or exceeds its bound, the
//! photo channel is excluded from scoring (weights renormalize) and a
//! degradation reason is recorded so auditors know the verdict was
//! computed with reduced evidence. Channel unavailability never fails the
//! whole verification.
//!
//! ## Determinism
//!
//! All windows are computed against the bundle's `submitted_at`, never
//! wall-clock. `evaluate` is side-effect free: replaying it with identical
//! bundle, session and history state yields an identical verdict,
//! fingerprint included.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::history::{DeviceContext, DeviceHistoryStore, RedemptionAttempts};
use crate::policy::{self, VerificationPolicyV1};
use crate::types::{
    AttendanceSession, CheckChannel, Decision, EvidenceBundle, EvidenceError, PhotoRef, Reason,
    ReasonCode, VerificationVerdict,
};
use crate::ATTENDANCE_SCHEMA_VERSION;

/// Errors terminal to a verification attempt.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Submission rejected outright; it never reaches scoring.
    #[error("malformed evidence: {0}")]
    MalformedEvidence(#[from] EvidenceError),
}

/// Failure from the external photo-confidence collaborator.
///
/// Never terminal: the engine degrades instead.
#[derive(Debug, thiserror::Error)]
pub enum PhotoAnalyzerError {
    /// Service unreachable or returned an error.
    #[error("photo analyzer unavailable: {0}")]
    Unavailable(String),
}

/// External liveness/replay analyzer.
///
/// The concrete computer-vision logic lives outside the kernel; the engine
/// only consumes a confidence value in [0, 100].
#[async_trait]
pub trait PhotoAnalyzer: Send + Sync {
    /// Confidence that the photo shows a live subject (not a replay).
    async fn liveness_confidence(&self, photo: &PhotoRef) -> Result<f64, PhotoAnalyzerError>;
}

/// The verification engine.
///
/// Stateless per request aside from shared reads of device history and the
/// attempt window; verifications run fully in parallel across requests.
pub struct VerificationEngine {
    policy: VerificationPolicyV1,
    history: Arc<DeviceHistoryStore>,
    attempts: Arc<RedemptionAttempts>,
    photo_analyzer: Option<Arc<dyn PhotoAnalyzer>>,
}

impl VerificationEngine {
    /// Create an engine without a photo analyzer (photo channel degrades
    /// whenever a session requires it).
    pub fn new(
        policy: VerificationPolicyV1,
        history: Arc<DeviceHistoryStore>,
        attempts: Arc<RedemptionAttempts>,
    ) -> Self {
        Self {
            policy,
            history,
            attempts,
            photo_analyzer: None,
        }
    }

    /// Attach the external photo-confidence collaborator.
    pub fn with_photo_analyzer(mut self, analyzer: Arc<dyn PhotoAnalyzer>) -> Self {
        self.photo_analyzer = Some(analyzer);
        self
    }

    /// The active policy.
    pub fn policy(&self) -> &VerificationPolicyV1 {
        &self.policy
    }

    /// Verify a check-in attempt: evaluate, then apply history side effects.
    ///
    /// This is the production entry point, called after a successful token
    /// redemption.
    pub async fn verify(
        &self,
        session: &AttendanceSession,
        bundle: &EvidenceBundle,
    ) -> Result<VerificationVerdict, EngineError> {
        let verdict = self.evaluate(session, bundle).await?;

        // History updates happen after the verdict so evaluation itself
        // stays replayable. Sightings are only trusted on ACCEPT/FLAG.
        if matches!(verdict.decision, Decision::Accept | Decision::Flag) {
            if let Some(fingerprint) = &bundle.device_fingerprint {
                self.history.record_sighting(
                    bundle.student_id,
                    fingerprint.clone(),
                    session.course_id,
                    bundle.submitted_at,
                    &self.policy,
                );
            }
        }
        self.history.record_outcome(bundle.student_id, verdict.decision);

        tracing::info!(
            student_id = %bundle.student_id,
            session_id = %session.id,
            decision = %verdict.decision,
            overall_risk = verdict.overall_risk,
            reasons = verdict.reasons.len(),
            fingerprint = %verdict.fingerprint,
            "verification verdict"
        );

        Ok(verdict)
    }

    /// Score an attempt without mutating history.
    ///
    /// Used for appeal re-evaluation: replaying against unchanged history
    /// must reproduce the original verdict exactly.
    pub async fn evaluate(
        &self,
        session: &AttendanceSession,
        bundle: &EvidenceBundle,
    ) -> Result<VerificationVerdict, EngineError> {
        bundle.validate()?;
        if bundle.session_id != session.id {
            return Err(EngineError::MalformedEvidence(
                EvidenceError::SessionMismatch {
                    submitted: bundle.session_id,
                    expected: session.id,
                },
            ));
        }

        let at = bundle.submitted_at;
        let device_context = match &bundle.device_fingerprint {
            Some(fingerprint) => self.history.device_context(
                &bundle.student_id,
                fingerprint,
                &session.course_id,
                at,
                &self.policy,
            ),
            None => DeviceContext::default(),
        };

        let mut channel_scores: BTreeMap<CheckChannel, f64> = BTreeMap::new();
        let mut reasons: Vec<Reason> = Vec::new();

        for channel in session.enabled_channels() {
            let outcome = match channel {
                CheckChannel::Location => Some(policy::score_location(
                    bundle.location.as_ref(),
                    session.geofence.as_ref(),
                    &self.policy,
                )),
                CheckChannel::Device => Some(policy::score_device(
                    bundle.device_fingerprint.as_ref(),
                    &device_context,
                    &self.policy,
                )),
                CheckChannel::Photo => self.score_photo_channel(bundle, &mut reasons).await,
                CheckChannel::Temporal => {
                    let recent_attempts = self.attempts.attempts_within(
                        &bundle.student_id,
                        at,
                        self.policy.burst_window_secs,
                    );
                    Some(policy::score_temporal(
                        at,
                        session.valid_from,
                        &device_context,
                        recent_attempts,
                        &self.policy,
                    ))
                }
            };

            if let Some(outcome) = outcome {
                channel_scores.insert(channel, outcome.score);
                reasons.extend(outcome.reasons);
            }
        }

        let overall_risk = policy::combine(&channel_scores, &self.policy);
        let decision = policy::decide(overall_risk, &self.policy);

        let verdict = VerificationVerdict::new(
            bundle.student_id,
            session.id,
            channel_scores,
            overall_risk,
            decision,
            reasons,
            self.policy.policy_id().to_string(),
            self.policy.params_hash(),
            ATTENDANCE_SCHEMA_VERSION.to_string(),
        );

        if !verdict.is_explained() {
            tracing::error!(
                fingerprint = %verdict.fingerprint,
                overall_risk = verdict.overall_risk,
                "verdict carries risk without reasons"
            );
        }
        debug_assert!(verdict.is_explained());

        Ok(verdict)
    }

    /// Score the photo channel, or exclude it (returning `None`) when the
    /// analyzer is unavailable. Degradation is recorded into `reasons`.
    async fn score_photo_channel(
        &self,
        bundle: &EvidenceBundle,
        reasons: &mut Vec<Reason>,
    ) -> Option<policy::ChannelOutcome> {
        let Some(photo) = &bundle.photo else {
            return Some(policy::ChannelOutcome {
                score: 100.0,
                reasons: vec![Reason::new(ReasonCode::MissingPhoto)],
            });
        };

        let Some(analyzer) = &self.photo_analyzer else {
            tracing::warn!(
                student_id = %bundle.student_id,
                "photo required but no analyzer configured; degrading"
            );
            reasons.push(Reason::new(ReasonCode::ChannelDegraded {
                channel: CheckChannel::Photo,
            }));
            return None;
        };

        let bound = Duration::from_millis(self.policy.photo_timeout_ms);
        match tokio::time::timeout(bound, analyzer.liveness_confidence(photo)).await {
            Ok(Ok(confidence)) => Some(policy::score_photo(confidence)),
            Ok(Err(err)) => {
                tracing::warn!(
                    student_id = %bundle.student_id,
                    error = %err,
                    "photo analyzer failed; degrading"
                );
                reasons.push(Reason::new(ReasonCode::ChannelDegraded {
                    channel: CheckChannel::Photo,
                }));
                None
            }
            Err(_elapsed) => {
                tracing::warn!(
                    student_id = %bundle.student_id,
                    timeout_ms = self.policy.photo_timeout_ms,
                    "photo analyzer timed out; degrading"
                );
                reasons.push(Reason::new(ReasonCode::ChannelDegraded {
                    channel: CheckChannel::Photo,
                }));
                None
            }
        }
    }
}
