//! Verification verdicts: the engine's output for one evidence bundle.
//!
//! ## Determinism Invariant
//!
//! A verdict is a pure function of (evidence bundle, session policy,
//! historical context at evaluation time). Re-running verification on
//! identical inputs must yield an identical verdict, including the
//! `fingerprint` field, so appeals can replay a decision bit-for-bit.
//!
//! ## Explainability Invariant
//!
//! Every non-zero risk contribution appends a [`Reason`]. A verdict with
//! `overall_risk > 0` and no reasons is a defect.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ids::{SessionId, StudentId};
use super::session::CheckChannel;
use crate::canonical::canonical_hash_hex;

/// Categorical outcome of one check-in attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Attendance recorded.
    Accept,
    /// Attendance recorded provisionally; instructor review requested.
    Flag,
    /// Attendance not recorded; student receives remediation steps.
    Reject,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "ACCEPT"),
            Self::Flag => write!(f, "FLAG"),
            Self::Reject => write!(f, "REJECT"),
        }
    }
}

/// Severity attached to a triggered rule.
///
/// Produced by the engine; presentation (colors, ordering) is entirely the
/// consuming surface's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational; no action expected.
    Low,
    /// Worth a look during routine review.
    Medium,
    /// Likely fraud signal; review soon.
    High,
    /// Strong fraud signal; immediate attention.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Machine-readable rule that contributed risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ReasonCode {
    /// Submitted location lies outside the session geofence.
    OutsideGeofence {
        /// Meters beyond the fence radius.
        distance_beyond_m: f64,
    },
    /// Reading accuracy too poor to trust at face value.
    LowAccuracy {
        /// Reported accuracy radius in meters.
        accuracy_m: f64,
    },
    /// Location required by policy but absent from the bundle.
    MissingLocation,
    /// Fingerprint recently seen on other students' accounts.
    DeviceShared {
        /// Distinct other students the fingerprint appeared for.
        other_students: usize,
    },
    /// One device fingerprint across many students in a short window.
    DeviceFarm {
        /// Distinct students within the window (same course).
        student_count: usize,
        /// Detection window in seconds.
        window_secs: i64,
    },
    /// First sighting of this fingerprint for this student.
    NewDevice,
    /// Fingerprint required by policy but absent from the bundle.
    MissingFingerprint,
    /// Photo liveness confidence below trust.
    PhotoLowConfidence {
        /// Analyzer confidence in [0, 100].
        confidence: f64,
    },
    /// Photo required by policy but absent from the bundle.
    MissingPhoto,
    /// An evidence channel was unreachable; verdict computed without it.
    ChannelDegraded {
        /// The excluded channel.
        channel: CheckChannel,
    },
    /// Submission implausibly close to session start given prior no-show history.
    ImplausibleArrival {
        /// Seconds between session start and submission.
        seconds_after_start: i64,
    },
    /// Burst of redemption attempts suggesting scripted behavior.
    RapidAttempts {
        /// Attempts observed within the window.
        attempts: usize,
        /// Window in seconds.
        window_secs: i64,
    },
}

impl ReasonCode {
    /// Severity of this rule.
    pub fn severity(&self) -> Severity {
        match self {
            Self::OutsideGeofence { distance_beyond_m } if *distance_beyond_m > 1_000.0 => {
                Severity::Critical
            }
            Self::OutsideGeofence { .. } => Severity::High,
            Self::LowAccuracy { .. } => Severity::Medium,
            Self::MissingLocation => Severity::High,
            Self::DeviceShared { .. } => Severity::High,
            Self::DeviceFarm { .. } => Severity::Critical,
            Self::NewDevice => Severity::Low,
            Self::MissingFingerprint => Severity::High,
            Self::PhotoLowConfidence { .. } => Severity::High,
            Self::MissingPhoto => Severity::High,
            Self::ChannelDegraded { .. } => Severity::Medium,
            Self::ImplausibleArrival { .. } => Severity::Low,
            Self::RapidAttempts { .. } => Severity::Medium,
        }
    }

    /// Instructor-facing description carrying the measured facts.
    pub fn describe(&self) -> String {
        match self {
            Self::OutsideGeofence { distance_beyond_m } => {
                if *distance_beyond_m >= 1_000.0 {
                    format!("outside geofence by {:.1} km", distance_beyond_m / 1_000.0)
                } else {
                    format!("outside geofence by {distance_beyond_m:.0} m")
                }
            }
            Self::LowAccuracy { accuracy_m } => {
                format!("location accuracy {accuracy_m:.0} m exceeds trust threshold")
            }
            Self::MissingLocation => "location required but not submitted".to_string(),
            Self::DeviceShared { other_students } => {
                format!("device recently seen on {other_students} other account(s)")
            }
            Self::DeviceFarm {
                student_count,
                window_secs,
            } => format!(
                "device used by {student_count} distinct students within {window_secs} s"
            ),
            Self::NewDevice => "first sighting of this device for this student".to_string(),
            Self::MissingFingerprint => "device fingerprint required but not submitted".to_string(),
            Self::PhotoLowConfidence { confidence } => {
                format!("photo liveness confidence {confidence:.0}/100")
            }
            Self::MissingPhoto => "photo required but not submitted".to_string(),
            Self::ChannelDegraded { channel } => {
                format!("{channel} channel unavailable; verdict computed with reduced evidence")
            }
            Self::ImplausibleArrival {
                seconds_after_start,
            } => format!(
                "submitted {seconds_after_start} s after session start despite prior no-show history"
            ),
            Self::RapidAttempts {
                attempts,
                window_secs,
            } => format!("{attempts} redemption attempts within {window_secs} s"),
        }
    }
}

/// A triggered rule recorded on a verdict, in trigger order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    /// Machine-readable rule and its measured facts.
    pub code: ReasonCode,
    /// Severity derived from the rule.
    pub severity: Severity,
    /// Captured instructor-facing text.
    pub detail: String,
}

impl Reason {
    /// Build a reason from a rule code.
    pub fn new(code: ReasonCode) -> Self {
        let severity = code.severity();
        let detail = code.describe();
        Self {
            code,
            severity,
            detail,
        }
    }
}

/// Content-derived fingerprint of a verdict for audit replay comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerdictFingerprint(String);

impl VerdictFingerprint {
    /// Get the fingerprint as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VerdictFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Quantization factor for scores in the fingerprint input.
/// Two decimal places survive; float serialization noise does not.
const SCORE_QUANTIZATION_FACTOR: f64 = 100.0;

fn quantize_score(score: f64) -> i64 {
    (score * SCORE_QUANTIZATION_FACTOR).round() as i64
}

/// The engine's output for one evidence bundle.
///
/// Constructed transiently by the engine; owned by the decision ledger
/// once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationVerdict {
    /// Student under verification.
    pub student_id: StudentId,
    /// Session under verification.
    pub session_id: SessionId,
    /// Per-channel suspicion scores in [0, 100]; only scored channels appear.
    pub channel_scores: BTreeMap<CheckChannel, f64>,
    /// Weighted combined risk in [0, 100].
    pub overall_risk: f64,
    /// Categorical outcome.
    pub decision: Decision,
    /// Triggered rules, in trigger order.
    pub reasons: Vec<Reason>,
    /// Policy identifier the verdict was computed under.
    pub policy_id: String,
    /// Hash of the policy parameters (quantized, not float-dependent).
    pub policy_params_hash: String,
    /// Kernel schema version.
    pub schema_version: String,
    /// Content-derived fingerprint for replay comparison.
    pub fingerprint: VerdictFingerprint,
}

impl VerificationVerdict {
    /// Assemble a verdict and compute its fingerprint.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        student_id: StudentId,
        session_id: SessionId,
        channel_scores: BTreeMap<CheckChannel, f64>,
        overall_risk: f64,
        decision: Decision,
        reasons: Vec<Reason>,
        policy_id: String,
        policy_params_hash: String,
        schema_version: String,
    ) -> Self {
        let fingerprint = Self::compute_fingerprint(
            &student_id,
            &session_id,
            &channel_scores,
            overall_risk,
            decision,
            &reasons,
            &policy_id,
            &policy_params_hash,
            &schema_version,
        );

        Self {
            student_id,
            session_id,
            channel_scores,
            overall_risk,
            decision,
            reasons,
            policy_id,
            policy_params_hash,
            schema_version,
            fingerprint,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compute_fingerprint(
        student_id: &StudentId,
        session_id: &SessionId,
        channel_scores: &BTreeMap<CheckChannel, f64>,
        overall_risk: f64,
        decision: Decision,
        reasons: &[Reason],
        policy_id: &str,
        policy_params_hash: &str,
        schema_version: &str,
    ) -> VerdictFingerprint {
        // Quantize scores so the hash is stable across float formatting.
        let quantized_scores: Vec<(CheckChannel, i64)> = channel_scores
            .iter()
            .map(|(channel, score)| (*channel, quantize_score(*score)))
            .collect();
        let reason_codes: Vec<&ReasonCode> = reasons.iter().map(|r| &r.code).collect();

        let canonical = (
            student_id,
            session_id,
            &quantized_scores,
            quantize_score(overall_risk),
            decision,
            &reason_codes,
            policy_id,
            policy_params_hash,
            schema_version,
        );

        VerdictFingerprint(canonical_hash_hex(&canonical))
    }

    /// Overall severity for escalation routing.
    ///
    /// The maximum reason severity, floored by the decision: a Reject is
    /// never below High, a Flag never below Medium.
    pub fn severity(&self) -> Severity {
        let reason_max = self
            .reasons
            .iter()
            .map(|r| r.severity)
            .max()
            .unwrap_or(Severity::Low);
        let floor = match self.decision {
            Decision::Accept => Severity::Low,
            Decision::Flag => Severity::Medium,
            Decision::Reject => Severity::High,
        };
        reason_max.max(floor)
    }

    /// Explainability check: non-zero risk must carry at least one reason.
    pub fn is_explained(&self) -> bool {
        self.overall_risk <= 0.0 || !self.reasons.is_empty()
    }
}
