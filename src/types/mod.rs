//! Core types for the attendance kernel.

pub mod evidence;
pub mod ids;
pub mod session;
pub mod token;
pub mod verdict;

pub use evidence::{
    DeviceFingerprint, EvidenceBundle, EvidenceError, GeoPoint, NetworkSignals, PhotoRef,
};
pub use ids::{CourseId, LedgerEntryId, SessionId, StudentId};
pub use session::{AttendanceSession, CheckChannel, Geofence, SessionStatus};
pub use token::CheckInToken;
pub use verdict::{
    Decision, Reason, ReasonCode, Severity, VerdictFingerprint, VerificationVerdict,
};
