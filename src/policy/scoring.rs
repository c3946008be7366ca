//! Per-channel suspicion scoring and weighted combination.
//!
//! Each scorer is a pure function of the submitted evidence, the session
//! policy and a historical-context snapshot, returning a score in
//! [0, 100] (higher = more suspicious) plus the rules it triggered. The
//! engine composes these into a verdict; nothing here performs I/O.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::v1::VerificationPolicyV1;
use crate::history::DeviceContext;
use crate::types::{
    CheckChannel, Decision, DeviceFingerprint, GeoPoint, Geofence, Reason, ReasonCode,
};

/// One channel's scoring result.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOutcome {
    /// Suspicion score in [0, 100].
    pub score: f64,
    /// Rules triggered by this channel, in trigger order.
    pub reasons: Vec<Reason>,
}

impl ChannelOutcome {
    fn clean() -> Self {
        Self {
            score: 0.0,
            reasons: Vec::new(),
        }
    }

    fn triggered(score: f64, code: ReasonCode) -> Self {
        Self {
            score: score.clamp(0.0, 100.0),
            reasons: vec![Reason::new(code)],
        }
    }
}

/// Score the location channel.
///
/// Inside the fence with trustworthy accuracy scores 0; the score scales
/// linearly with distance beyond the fence, saturating at
/// `full_score_distance_m`. Readings with accuracy worse than
/// `max_accuracy_m` are scored moderately suspicious rather than trusted.
/// A session without a geofence has nothing to compare against and scores
/// clean.
pub fn score_location(
    location: Option<&GeoPoint>,
    geofence: Option<&Geofence>,
    policy: &VerificationPolicyV1,
) -> ChannelOutcome {
    let Some(location) = location else {
        return ChannelOutcome::triggered(100.0, ReasonCode::MissingLocation);
    };
    let Some(fence) = geofence else {
        return ChannelOutcome::clean();
    };

    let mut score: f64 = 0.0;
    let mut reasons = Vec::new();

    let distance = fence.distance_m(location.lat, location.lon);
    if distance > fence.radius_m {
        let beyond = distance - fence.radius_m;
        score = (beyond / policy.full_score_distance_m * 100.0).clamp(0.0, 100.0);
        reasons.push(Reason::new(ReasonCode::OutsideGeofence {
            distance_beyond_m: beyond,
        }));
    }

    if location.accuracy_m > policy.max_accuracy_m {
        // An untrustworthy reading floors the score even if it claims to be
        // inside the fence.
        score = score.max(policy.low_accuracy_score);
        reasons.push(Reason::new(ReasonCode::LowAccuracy {
            accuracy_m: location.accuracy_m,
        }));
    }

    ChannelOutcome { score, reasons }
}

/// Score the device channel against the student's device history.
pub fn score_device(
    fingerprint: Option<&DeviceFingerprint>,
    context: &DeviceContext,
    policy: &VerificationPolicyV1,
) -> ChannelOutcome {
    if fingerprint.is_none() {
        return ChannelOutcome::triggered(100.0, ReasonCode::MissingFingerprint);
    }

    // Counting the current submission, one fingerprint across the threshold
    // number of students in the farm window is the strongest signal.
    let farm_students = context.farm_other_students + 1;
    if farm_students >= policy.farm_student_threshold {
        return ChannelOutcome::triggered(
            100.0,
            ReasonCode::DeviceFarm {
                student_count: farm_students,
                window_secs: policy.farm_window_secs,
            },
        );
    }

    if !context.known_to_student && context.other_students_recent > 0 {
        return ChannelOutcome::triggered(
            policy.sharing_score,
            ReasonCode::DeviceShared {
                other_students: context.other_students_recent,
            },
        );
    }

    if !context.known_to_student {
        return ChannelOutcome::triggered(policy.new_device_score, ReasonCode::NewDevice);
    }

    ChannelOutcome::clean()
}

/// Score the photo channel from an analyzer confidence in [0, 100].
///
/// The concrete computer-vision logic is an external collaborator; the
/// engine only consumes its liveness/replay confidence. Score is the
/// inverse of confidence.
pub fn score_photo(confidence: f64) -> ChannelOutcome {
    let confidence = confidence.clamp(0.0, 100.0);
    let score = 100.0 - confidence;
    if score > 0.0 {
        ChannelOutcome::triggered(score, ReasonCode::PhotoLowConfidence { confidence })
    } else {
        ChannelOutcome::clean()
    }
}

/// Score the temporal/behavioral channel.
///
/// Soft signals: a submission implausibly close to session start from a
/// student with prior flagged history, and bursts of redemption attempts.
pub fn score_temporal(
    submitted_at: DateTime<Utc>,
    session_start: DateTime<Utc>,
    context: &DeviceContext,
    recent_attempts: usize,
    policy: &VerificationPolicyV1,
) -> ChannelOutcome {
    let mut score: f64 = 0.0;
    let mut reasons = Vec::new();

    let seconds_after_start = (submitted_at - session_start).num_seconds();
    if context.prior_flagged > 0
        && (0..policy.plausible_arrival_secs).contains(&seconds_after_start)
    {
        score += policy.early_arrival_score;
        reasons.push(Reason::new(ReasonCode::ImplausibleArrival {
            seconds_after_start,
        }));
    }

    if recent_attempts >= policy.burst_threshold {
        score += policy.burst_score;
        reasons.push(Reason::new(ReasonCode::RapidAttempts {
            attempts: recent_attempts,
            window_secs: policy.burst_window_secs,
        }));
    }

    ChannelOutcome {
        score: score.clamp(0.0, 100.0),
        reasons,
    }
}

/// Combine channel scores into overall risk.
///
/// Weighted mean over the channels actually scored; weights are
/// renormalized over that subset, so disabling or degrading a channel
/// never pushes the result outside [0, 100]. An empty set scores 0.
pub fn combine(scores: &BTreeMap<CheckChannel, f64>, policy: &VerificationPolicyV1) -> f64 {
    let total_weight: f64 = scores.keys().map(|c| policy.weights.get(*c)).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }

    let weighted: f64 = scores
        .iter()
        .map(|(channel, score)| policy.weights.get(*channel) * score)
        .sum();

    (weighted / total_weight).clamp(0.0, 100.0)
}

/// Map overall risk to a decision using the policy thresholds.
pub fn decide(overall_risk: f64, policy: &VerificationPolicyV1) -> Decision {
    if overall_risk < policy.accept_below {
        Decision::Accept
    } else if overall_risk > policy.reject_above {
        Decision::Reject
    } else {
        Decision::Flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fence_50m() -> Geofence {
        Geofence::new(40.0, -74.0, 50.0)
    }

    #[test]
    fn test_location_inside_fence_scores_zero() {
        let policy = VerificationPolicyV1::default();
        let reading = GeoPoint::new(40.0, -74.0, 10.0);
        let outcome = score_location(Some(&reading), Some(&fence_50m()), &policy);
        assert_eq!(outcome.score, 0.0);
        assert!(outcome.reasons.is_empty());
    }

    #[test]
    fn test_location_far_outside_saturates() {
        let policy = VerificationPolicyV1::default();
        // ~5 km north of the fence center, accuracy 10 m.
        let reading = GeoPoint::new(40.045, -74.0, 10.0);
        let outcome = score_location(Some(&reading), Some(&fence_50m()), &policy);
        assert_eq!(outcome.score, 100.0);
        assert!(matches!(
            outcome.reasons[0].code,
            ReasonCode::OutsideGeofence { distance_beyond_m } if distance_beyond_m > 4_000.0
        ));
    }

    #[test]
    fn test_location_low_accuracy_floors_score() {
        let policy = VerificationPolicyV1::default();
        // Claims to be at the fence center, but with a 2 km accuracy radius.
        let reading = GeoPoint::new(40.0, -74.0, 2_000.0);
        let outcome = score_location(Some(&reading), Some(&fence_50m()), &policy);
        assert_eq!(outcome.score, policy.low_accuracy_score);
        assert!(matches!(
            outcome.reasons[0].code,
            ReasonCode::LowAccuracy { .. }
        ));
    }

    #[test]
    fn test_location_missing_scores_max() {
        let policy = VerificationPolicyV1::default();
        let outcome = score_location(None, Some(&fence_50m()), &policy);
        assert_eq!(outcome.score, 100.0);
    }

    #[test]
    fn test_location_no_fence_scores_clean() {
        let policy = VerificationPolicyV1::default();
        let reading = GeoPoint::new(40.0, -74.0, 10.0);
        let outcome = score_location(Some(&reading), None, &policy);
        assert_eq!(outcome.score, 0.0);
    }

    #[test]
    fn test_device_farm_dominates() {
        let policy = VerificationPolicyV1::default();
        let fp = DeviceFingerprint::new("ab12cd34ef56ab78").unwrap();
        let context = DeviceContext {
            known_to_student: true,
            other_students_recent: 4,
            farm_other_students: 4,
            prior_flagged: 0,
        };
        let outcome = score_device(Some(&fp), &context, &policy);
        assert_eq!(outcome.score, 100.0);
        assert!(matches!(
            outcome.reasons[0].code,
            ReasonCode::DeviceFarm { student_count: 5, .. }
        ));
    }

    #[test]
    fn test_device_sharing_signal() {
        let policy = VerificationPolicyV1::default();
        let fp = DeviceFingerprint::new("ab12cd34ef56ab78").unwrap();
        let context = DeviceContext {
            known_to_student: false,
            other_students_recent: 1,
            farm_other_students: 1,
            prior_flagged: 0,
        };
        let outcome = score_device(Some(&fp), &context, &policy);
        assert_eq!(outcome.score, policy.sharing_score);
    }

    #[test]
    fn test_device_known_scores_zero() {
        let policy = VerificationPolicyV1::default();
        let fp = DeviceFingerprint::new("ab12cd34ef56ab78").unwrap();
        let context = DeviceContext {
            known_to_student: true,
            ..Default::default()
        };
        let outcome = score_device(Some(&fp), &context, &policy);
        assert_eq!(outcome.score, 0.0);
    }

    #[test]
    fn test_photo_score_is_inverse_confidence() {
        assert_eq!(score_photo(100.0).score, 0.0);
        assert_eq!(score_photo(30.0).score, 70.0);
        assert!(score_photo(30.0)
            .reasons
            .iter()
            .any(|r| matches!(r.code, ReasonCode::PhotoLowConfidence { .. })));
    }

    #[test]
    fn test_temporal_burst() {
        let policy = VerificationPolicyV1::default();
        let now = Utc::now();
        let outcome = score_temporal(now, now - chrono::Duration::seconds(300), &DeviceContext::default(), 5, &policy);
        assert_eq!(outcome.score, policy.burst_score);
    }

    #[test]
    fn test_temporal_early_arrival_needs_prior_history() {
        let policy = VerificationPolicyV1::default();
        let start = Utc::now();
        let submitted = start + chrono::Duration::seconds(5);

        let clean = score_temporal(submitted, start, &DeviceContext::default(), 0, &policy);
        assert_eq!(clean.score, 0.0);

        let context = DeviceContext {
            prior_flagged: 2,
            ..Default::default()
        };
        let flagged = score_temporal(submitted, start, &context, 0, &policy);
        assert_eq!(flagged.score, policy.early_arrival_score);
    }

    #[test]
    fn test_combine_renormalizes() {
        let policy = VerificationPolicyV1::default();
        let mut scores = BTreeMap::new();
        scores.insert(CheckChannel::Location, 100.0);
        // Only one channel enabled: its score must pass through unchanged.
        assert_eq!(combine(&scores, &policy), 100.0);

        scores.insert(CheckChannel::Device, 0.0);
        let blended = combine(&scores, &policy);
        assert!(blended > 0.0 && blended < 100.0);
    }

    #[test]
    fn test_combine_empty_is_zero() {
        let policy = VerificationPolicyV1::default();
        assert_eq!(combine(&BTreeMap::new(), &policy), 0.0);
    }

    #[test]
    fn test_decide_thresholds() {
        let policy = VerificationPolicyV1::default();
        assert_eq!(decide(0.0, &policy), Decision::Accept);
        assert_eq!(decide(39.9, &policy), Decision::Accept);
        assert_eq!(decide(40.0, &policy), Decision::Flag);
        assert_eq!(decide(75.0, &policy), Decision::Flag);
        assert_eq!(decide(75.1, &policy), Decision::Reject);
    }

    proptest! {
        /// Overall risk stays in [0, 100] for every channel subset and any
        /// in-range channel scores.
        #[test]
        fn prop_combine_bounded(
            use_location in any::<bool>(),
            use_device in any::<bool>(),
            use_photo in any::<bool>(),
            s_location in 0.0f64..=100.0,
            s_device in 0.0f64..=100.0,
            s_photo in 0.0f64..=100.0,
            s_temporal in 0.0f64..=100.0,
        ) {
            let policy = VerificationPolicyV1::default();
            let mut scores = BTreeMap::new();
            if use_location {
                scores.insert(CheckChannel::Location, s_location);
            }
            if use_device {
                scores.insert(CheckChannel::Device, s_device);
            }
            if use_photo {
                scores.insert(CheckChannel::Photo, s_photo);
            }
            scores.insert(CheckChannel::Temporal, s_temporal);

            let risk = combine(&scores, &policy);
            prop_assert!((0.0..=100.0).contains(&risk));
        }
    }
}
