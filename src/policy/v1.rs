//! VerificationPolicy v1: channel weights, decision thresholds and
//! per-channel tuning knobs.
//!
//! ## Float Normalization for Deterministic Hashing
//!
//! Floats are quantized to integers before hashing (multiply by 1e6 and
//! round to i64) so `params_hash` is identical across platforms and
//! serialization settings. A verdict records the hash of the policy it was
//! computed under; appeals replay against the same parameters.
//!
//! Thresholds here are starting-policy defaults, configurable per course.
//! They are not fixed constants of the system.

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_hash_hex;
use crate::types::CheckChannel;
use crate::DEFAULT_POLICY_VERSION;

/// Quantization factor for float normalization.
const FLOAT_QUANTIZATION_FACTOR: f64 = 1_000_000.0;

fn quantize_float(value: f64) -> i64 {
    (value * FLOAT_QUANTIZATION_FACTOR).round() as i64
}

/// Relative channel weights before renormalization.
///
/// Only channels enabled for a session contribute; weights are
/// renormalized over the enabled subset so overall risk stays in [0, 100]
/// regardless of which checks a course turns on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelWeights {
    /// Weight for the location channel.
    pub location: f64,
    /// Weight for the device channel.
    pub device: f64,
    /// Weight for the photo channel.
    pub photo: f64,
    /// Weight for the temporal channel (soft signal, low weight).
    pub temporal: f64,
}

impl ChannelWeights {
    /// Get the weight for a channel.
    pub fn get(&self, channel: CheckChannel) -> f64 {
        match channel {
            CheckChannel::Location => self.location,
            CheckChannel::Device => self.device,
            CheckChannel::Photo => self.photo,
            CheckChannel::Temporal => self.temporal,
        }
    }

    fn to_quantized(&self) -> QuantizedChannelWeights {
        QuantizedChannelWeights {
            location: quantize_float(self.location),
            device: quantize_float(self.device),
            photo: quantize_float(self.photo),
            temporal: quantize_float(self.temporal),
        }
    }
}

impl Default for ChannelWeights {
    fn default() -> Self {
        Self {
            location: 0.35,
            device: 0.30,
            photo: 0.25,
            temporal: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuantizedChannelWeights {
    location: i64,
    device: i64,
    photo: i64,
    temporal: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuantizedPolicyParams {
    version: String,
    weights: QuantizedChannelWeights,
    accept_below: i64,
    reject_above: i64,
    max_accuracy_m: i64,
    low_accuracy_score: i64,
    full_score_distance_m: i64,
    sharing_window_secs: i64,
    sharing_score: i64,
    new_device_score: i64,
    farm_student_threshold: usize,
    farm_window_secs: i64,
    photo_timeout_ms: u64,
    plausible_arrival_secs: i64,
    early_arrival_score: i64,
    burst_threshold: usize,
    burst_window_secs: i64,
    burst_score: i64,
    history_max_fingerprints: usize,
    history_retention_days: i64,
}

/// Verification policy, version 1.
///
/// Controls channel weighting, decision thresholds and the tuning knobs of
/// each scoring channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationPolicyV1 {
    /// Policy version identifier.
    pub version: String,
    /// Relative channel weights.
    pub weights: ChannelWeights,
    /// Risk strictly below this accepts (default 40).
    pub accept_below: f64,
    /// Risk strictly above this rejects (default 75); between is a flag.
    pub reject_above: f64,

    /// Accuracy radius beyond which a reading is untrustworthy (meters).
    pub max_accuracy_m: f64,
    /// Score assigned to untrustworthy readings (moderately suspicious,
    /// never accepted at face value).
    pub low_accuracy_score: f64,
    /// Distance beyond the fence at which the location score saturates at 100.
    pub full_score_distance_m: f64,

    /// Window within which a fingerprint sighting on another account counts
    /// as a sharing signal (seconds).
    pub sharing_window_secs: i64,
    /// Score for a fingerprint recently seen on other accounts.
    pub sharing_score: f64,
    /// Score for a brand-new device with no sharing signal.
    pub new_device_score: f64,
    /// Distinct students on one fingerprint that trigger the device-farm rule.
    pub farm_student_threshold: usize,
    /// Device-farm detection window (seconds).
    pub farm_window_secs: i64,

    /// Bound on the external photo-confidence call (milliseconds).
    pub photo_timeout_ms: u64,

    /// Submissions within this many seconds of session start are implausibly
    /// early for students with prior no-show history.
    pub plausible_arrival_secs: i64,
    /// Score contribution of the implausible-arrival rule.
    pub early_arrival_score: f64,
    /// Redemption attempts within the burst window that trigger the
    /// rapid-attempts rule.
    pub burst_threshold: usize,
    /// Rapid-attempt detection window (seconds).
    pub burst_window_secs: i64,
    /// Score contribution of the rapid-attempts rule.
    pub burst_score: f64,

    /// Device history bound: distinct fingerprints retained per student.
    pub history_max_fingerprints: usize,
    /// Device history bound: retention window in days.
    pub history_retention_days: i64,
}

impl VerificationPolicyV1 {
    /// Get the policy ID.
    pub fn policy_id(&self) -> &str {
        &self.version
    }

    /// Compute a hash of the policy parameters.
    ///
    /// Uses quantized float representation for cross-platform consistency.
    pub fn params_hash(&self) -> String {
        canonical_hash_hex(&self.to_quantized())
    }

    fn to_quantized(&self) -> QuantizedPolicyParams {
        QuantizedPolicyParams {
            version: self.version.clone(),
            weights: self.weights.to_quantized(),
            accept_below: quantize_float(self.accept_below),
            reject_above: quantize_float(self.reject_above),
            max_accuracy_m: quantize_float(self.max_accuracy_m),
            low_accuracy_score: quantize_float(self.low_accuracy_score),
            full_score_distance_m: quantize_float(self.full_score_distance_m),
            sharing_window_secs: self.sharing_window_secs,
            sharing_score: quantize_float(self.sharing_score),
            new_device_score: quantize_float(self.new_device_score),
            farm_student_threshold: self.farm_student_threshold,
            farm_window_secs: self.farm_window_secs,
            photo_timeout_ms: self.photo_timeout_ms,
            plausible_arrival_secs: self.plausible_arrival_secs,
            early_arrival_score: quantize_float(self.early_arrival_score),
            burst_threshold: self.burst_threshold,
            burst_window_secs: self.burst_window_secs,
            burst_score: quantize_float(self.burst_score),
            history_max_fingerprints: self.history_max_fingerprints,
            history_retention_days: self.history_retention_days,
        }
    }
}

impl Default for VerificationPolicyV1 {
    fn default() -> Self {
        Self {
            version: DEFAULT_POLICY_VERSION.to_string(),
            weights: ChannelWeights::default(),
            accept_below: 40.0,
            reject_above: 75.0,
            max_accuracy_m: 150.0,
            low_accuracy_score: 55.0,
            full_score_distance_m: 500.0,
            sharing_window_secs: 3_600,
            sharing_score: 70.0,
            new_device_score: 25.0,
            farm_student_threshold: 3,
            farm_window_secs: 600,
            photo_timeout_ms: 2_000,
            plausible_arrival_secs: 30,
            early_arrival_score: 30.0,
            burst_threshold: 3,
            burst_window_secs: 60,
            burst_score: 60.0,
            history_max_fingerprints: 8,
            history_retention_days: 90,
        }
    }
}
