//! Evidence bundles submitted at check-in time.
//!
//! A bundle is created once per check-in attempt and is immutable
//! thereafter. Evidence is never mutated, only re-scored if re-evaluation
//! is triggered, so the same bundle can be replayed through the engine for
//! appeals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use super::ids::{SessionId, StudentId};

/// Validation errors for submitted evidence.
///
/// Malformed evidence rejects the submission outright; it never reaches
/// scoring.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvidenceError {
    /// Latitude/longitude outside the valid range.
    #[error("coordinates out of range: lat={lat}, lon={lon}")]
    CoordinatesOutOfRange {
        /// Submitted latitude.
        lat: f64,
        /// Submitted longitude.
        lon: f64,
    },
    /// Coordinate or accuracy is NaN/infinite.
    #[error("non-finite geolocation value")]
    NonFiniteLocation,
    /// Reported accuracy is negative.
    #[error("negative accuracy: {0} m")]
    NegativeAccuracy(f64),
    /// Fingerprint does not match the expected stable-hash format.
    #[error("device fingerprint has invalid format")]
    BadFingerprintFormat,
    /// Submission references a session other than the one being verified.
    #[error("evidence bound to session {submitted}, expected {expected}")]
    SessionMismatch {
        /// Session the bundle claims.
        submitted: SessionId,
        /// Session under verification.
        expected: SessionId,
    },
}

/// A geolocation reading from the client device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees, [-90, 90].
    pub lat: f64,
    /// Longitude in degrees, [-180, 180].
    pub lon: f64,
    /// Reported horizontal accuracy radius in meters.
    pub accuracy_m: f64,
}

impl GeoPoint {
    /// Create a new reading.
    pub fn new(lat: f64, lon: f64, accuracy_m: f64) -> Self {
        Self {
            lat,
            lon,
            accuracy_m,
        }
    }

    fn validate(&self) -> Result<(), EvidenceError> {
        if !self.lat.is_finite() || !self.lon.is_finite() || !self.accuracy_m.is_finite() {
            return Err(EvidenceError::NonFiniteLocation);
        }
        if !(-90.0..=90.0).contains(&self.lat) || !(-180.0..=180.0).contains(&self.lon) {
            return Err(EvidenceError::CoordinatesOutOfRange {
                lat: self.lat,
                lon: self.lon,
            });
        }
        if self.accuracy_m < 0.0 {
            return Err(EvidenceError::NegativeAccuracy(self.accuracy_m));
        }
        Ok(())
    }
}

/// Stable hash derived from multiple device/browser signals.
///
/// Distinguishes devices without relying on login identity alone. The
/// kernel treats it as opaque; only its format is validated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceFingerprint(String);

fn fingerprint_pattern() -> &'static regex_lite::Regex {
    static PATTERN: OnceLock<regex_lite::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex_lite::Regex::new(r"^[0-9a-f]{16,64}$").expect("fingerprint pattern is valid")
    })
}

impl DeviceFingerprint {
    /// Create a fingerprint after validating the format (16-64 lowercase hex chars).
    pub fn new(hash: impl Into<String>) -> Result<Self, EvidenceError> {
        let hash = hash.into();
        if !fingerprint_pattern().is_match(&hash) {
            return Err(EvidenceError::BadFingerprintFormat);
        }
        Ok(Self(hash))
    }

    /// Get the fingerprint as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix safe for structured logs (never log the full value).
    pub fn log_prefix(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", self.log_prefix())
    }
}

/// Opaque reference to a captured photo held by external storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRef(pub String);

/// Optional network-level signals captured at submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSignals {
    /// Client IP address, if known.
    pub ip: Option<String>,
    /// Autonomous system number, if resolved.
    pub asn: Option<u32>,
}

/// Per check-in-attempt evidence, submitted once and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBundle {
    /// Student making the attempt.
    pub student_id: StudentId,
    /// Session being checked into (must match the redeemed token).
    pub session_id: SessionId,
    /// Submission instant. Also the evaluation reference time: verification
    /// windows are computed against this, not wall-clock, so re-runs are
    /// deterministic.
    pub submitted_at: DateTime<Utc>,
    /// Geolocation reading, if the policy collects one.
    pub location: Option<GeoPoint>,
    /// Device fingerprint, if the policy collects one.
    pub device_fingerprint: Option<DeviceFingerprint>,
    /// Photo reference, if the policy collects one.
    pub photo: Option<PhotoRef>,
    /// Network signals, if captured.
    pub network: Option<NetworkSignals>,
}

impl EvidenceBundle {
    /// Validate the bundle's structure.
    ///
    /// This is a pure shape check; whether a channel's evidence is *present*
    /// when the session requires it is the engine's concern (missing
    /// evidence scores maximally suspicious rather than erroring).
    pub fn validate(&self) -> Result<(), EvidenceError> {
        if let Some(location) = &self.location {
            location.validate()?;
        }
        Ok(())
    }
}
