//! # attendance-kernel
//!
//! Verification core for in-person attendance check-ins.
//!
//! The kernel answers one question:
//!
//! > Given a redeemed check-in token and its evidence bundle, **should this
//! > attendance claim be trusted**?
//!
//! ## Core Contract
//!
//! 1. Issue short-lived, single-use, rotating check-in tokens per session
//! 2. Score each submission across independent evidence channels and
//!    combine them into an explained ACCEPT / FLAG / REJECT verdict
//! 3. Persist every verdict to an append-only, idempotent decision ledger
//! 4. Escalate suspicious verdicts to the right audience, best-effort
//!
//! ## Architecture
//!
//! ```text
//! Token Redemption → EvidenceBundle → VerificationEngine → VerificationVerdict
//!        ↓                                  ↓                      ↓
//!  SessionTokenIssuer            DeviceHistoryStore       DecisionLedger
//!                                                                ↓
//!                                                       EscalationNotifier
//! ```
//!
//! ## Guarantees
//!
//! - A token redeems exactly once; concurrent redemptions resolve to one winner
//! - Same bundle + same policy + same history state → identical verdict,
//!   fingerprint included
//! - Every non-zero risk contribution carries a machine-readable reason
//! - Ledger writes are idempotent by request_id; entries are never mutated
//! - Channel degradation reduces evidence, never availability

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod canonical;
pub mod engine;
pub mod history;
pub mod issuer;
pub mod ledger;
pub mod notifier;
pub mod policy;
pub mod types;

// Re-exports
pub use types::{CourseId, LedgerEntryId, SessionId, StudentId};
pub use types::{AttendanceSession, CheckChannel, Geofence, SessionStatus};
pub use types::CheckInToken;
pub use types::{
    DeviceFingerprint, EvidenceBundle, EvidenceError, GeoPoint, NetworkSignals, PhotoRef,
};
pub use types::{
    Decision, Reason, ReasonCode, Severity, VerdictFingerprint, VerificationVerdict,
};

pub use canonical::{canonical_hash, canonical_hash_hex, to_canonical_bytes};
pub use engine::{EngineError, PhotoAnalyzer, PhotoAnalyzerError, VerificationEngine};
pub use history::{DeviceContext, DeviceHistoryStore, RedemptionAttempts};
pub use issuer::{IssuerError, SessionTokenIssuer};
pub use ledger::{DecisionLedger, InMemoryLedger, LedgerEntry, LedgerError, RecordRequest};
#[cfg(feature = "postgres")]
pub use ledger::{PostgresConfig, PostgresLedger};
pub use notifier::{
    Audience, DeliveryReport, EscalationNotifier, Notification, NotificationSink, Recipients,
    RetryPolicy, SinkError,
};
pub use policy::{ChannelWeights, VerificationPolicyV1};

/// Schema version for all kernel types.
/// Increment on breaking changes to any schema type.
pub const ATTENDANCE_SCHEMA_VERSION: &str = "1.0.0";

/// Default policy version identifier.
pub const DEFAULT_POLICY_VERSION: &str = "verification_policy_v1";
