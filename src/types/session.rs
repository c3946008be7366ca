//! Attendance session types.
//!
//! An `AttendanceSession` represents one class meeting's check-in window.
//!
//! ## Lifecycle
//!
//! ```text
//! PENDING ──(valid_from reached / activate)──▶ ACTIVE ──(valid_to reached / close)──▶ CLOSED
//! ```
//!
//! CLOSED is terminal; a closed session is immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::ids::{CourseId, SessionId};

/// Mean Earth radius in meters, used for great-circle distance.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Evidence channel scored by the verification engine.
///
/// `Location`, `Device` and `Photo` may be required per course policy.
/// `Temporal` is always evaluated (soft behavioral signal, low weight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckChannel {
    /// Geolocation vs. the session geofence.
    Location,
    /// Device fingerprint vs. the student's device history.
    Device,
    /// Photo liveness/replay confidence from an external analyzer.
    Photo,
    /// Submission timing and redemption-attempt behavior.
    Temporal,
}

impl fmt::Display for CheckChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Location => write!(f, "location"),
            Self::Device => write!(f, "device"),
            Self::Photo => write!(f, "photo"),
            Self::Temporal => write!(f, "temporal"),
        }
    }
}

/// Circular boundary defining the acceptable physical check-in area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    /// Center latitude in degrees.
    pub center_lat: f64,
    /// Center longitude in degrees.
    pub center_lon: f64,
    /// Radius in meters.
    pub radius_m: f64,
}

impl Geofence {
    /// Create a new geofence.
    pub fn new(center_lat: f64, center_lon: f64, radius_m: f64) -> Self {
        Self {
            center_lat,
            center_lon,
            radius_m,
        }
    }

    /// Great-circle (haversine) distance in meters from the fence center.
    pub fn distance_m(&self, lat: f64, lon: f64) -> f64 {
        let phi1 = self.center_lat.to_radians();
        let phi2 = lat.to_radians();
        let d_phi = (lat - self.center_lat).to_radians();
        let d_lambda = (lon - self.center_lon).to_radians();

        let a = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_M * c
    }

    /// Whether a point lies within the fence radius.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.distance_m(lat, lon) <= self.radius_m
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Created but not yet open for check-in.
    Pending,
    /// Open for token issuance and redemption.
    Active,
    /// Window over; terminal and immutable.
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// One class meeting's check-in window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceSession {
    /// Opaque unique identifier.
    pub id: SessionId,
    /// Course this meeting belongs to.
    pub course_id: CourseId,
    /// Window start (inclusive).
    pub valid_from: DateTime<Utc>,
    /// Window end (exclusive). Always after `valid_from`.
    pub valid_to: DateTime<Utc>,
    /// Evidence channels the course policy requires for this session.
    /// Never contains `Temporal` (always evaluated implicitly).
    pub required_checks: BTreeSet<CheckChannel>,
    /// Acceptable check-in area, if location verification is required.
    pub geofence: Option<Geofence>,
    /// Lifecycle state.
    pub status: SessionStatus,
}

impl AttendanceSession {
    /// Whether a channel must be scored for this session.
    pub fn requires(&self, channel: CheckChannel) -> bool {
        channel == CheckChannel::Temporal || self.required_checks.contains(&channel)
    }

    /// Channels the engine will score, in canonical order.
    pub fn enabled_channels(&self) -> Vec<CheckChannel> {
        let mut channels: Vec<CheckChannel> = self.required_checks.iter().copied().collect();
        channels.push(CheckChannel::Temporal);
        channels
    }

    /// Whether the window covers `now` (independent of lifecycle state).
    pub fn window_covers(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_from && now < self.valid_to
    }
}
