//! Verification policy: weights, thresholds and the scoring functions.

pub mod scoring;
pub mod v1;

pub use scoring::{combine, decide, score_device, score_location, score_photo, score_temporal, ChannelOutcome};
pub use v1::{ChannelWeights, VerificationPolicyV1};
