//! Check-in tokens: short-lived, single-use capability credentials.
//!
//! ## Security Model
//!
//! A token's wire value is self-describing:
//!
//! ```text
//! atk1.<session_id>.<nonce>.<issued_ms>.<expires_ms>.<sig>
//! ```
//!
//! where `sig = HMAC-SHA256(secret, canonical_fields)[..16]` under the
//! issuer's secret. Without the secret a token cannot be forged; the
//! signature binds it to exactly one session and one validity window, so a
//! captured QR code cannot be replayed against another session.
//!
//! Consumption state (which student redeemed the token) is tracked by the
//! issuer, not inside the wire value.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::ids::SessionId;

/// Wire-format prefix and version marker for token values.
const TOKEN_PREFIX: &str = "atk1";

/// Version marker mixed into the HMAC canonical string.
const TOKEN_VERSION: &str = "checkin_token_v1_hmac";

/// A signed check-in token for one attendance session.
///
/// The `value` field is the QR payload handed to the client surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInToken {
    /// Opaque wire value (what the QR surface displays).
    pub value: String,
    /// Session this token is bound to.
    pub session_id: SessionId,
    /// Issuance instant.
    pub issued_at: DateTime<Utc>,
    /// Expiry instant (short TTL; rotated continuously while the session is active).
    pub expires_at: DateTime<Utc>,
}

impl CheckInToken {
    /// Build the canonical string for HMAC computation.
    fn canonical_string(
        session_id: &SessionId,
        nonce: &str,
        issued_ms: i64,
        expires_ms: i64,
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            session_id.as_uuid().simple(),
            nonce,
            issued_ms,
            expires_ms,
            TOKEN_VERSION,
        )
    }

    /// Compute the 16-byte HMAC signature, hex encoded.
    fn sign(secret: &[u8], session_id: &SessionId, nonce: &str, issued_ms: i64, expires_ms: i64) -> String {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let canonical = Self::canonical_string(session_id, nonce, issued_ms, expires_ms);
        let mut mac =
            Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts any key size");
        mac.update(canonical.as_bytes());
        let result = mac.finalize().into_bytes();
        hex::encode(&result[..16])
    }

    /// Issue a new signed token (issuer-only operation).
    pub fn issue(
        secret: &[u8],
        session_id: SessionId,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let issued_ms = issued_at.timestamp_millis();
        let expires_ms = expires_at.timestamp_millis();
        let sig = Self::sign(secret, &session_id, &nonce, issued_ms, expires_ms);

        let value = format!(
            "{}.{}.{}.{}.{}.{}",
            TOKEN_PREFIX,
            session_id.as_uuid().simple(),
            nonce,
            issued_ms,
            expires_ms,
            sig,
        );

        Self {
            value,
            session_id,
            issued_at,
            expires_at,
        }
    }

    /// Parse and verify a presented wire value.
    ///
    /// Returns the token fields only if the structure parses and the HMAC
    /// signature verifies (constant-time comparison). A failure here means
    /// the value was never issued by this kernel.
    pub fn parse_and_verify(secret: &[u8], value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.split('.').collect();
        if parts.len() != 6 || parts[0] != TOKEN_PREFIX {
            return None;
        }

        let session_uuid = uuid::Uuid::parse_str(parts[1]).ok()?;
        let session_id = SessionId::new(session_uuid);
        let nonce = parts[2];
        let issued_ms: i64 = parts[3].parse().ok()?;
        let expires_ms: i64 = parts[4].parse().ok()?;
        let presented_sig = parts[5];

        if presented_sig.len() != 32 || !presented_sig.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        let expected = Self::sign(secret, &session_id, nonce, issued_ms, expires_ms);

        // Constant-time comparison
        let matches = presented_sig
            .bytes()
            .zip(expected.bytes())
            .fold(true, |acc, (a, b)| acc && (a == b));
        if !matches {
            return None;
        }

        let issued_at = Utc.timestamp_millis_opt(issued_ms).single()?;
        let expires_at = Utc.timestamp_millis_opt(expires_ms).single()?;

        Some(Self {
            value: value.to_string(),
            session_id,
            issued_at,
            expires_at,
        })
    }

    /// Whether the nominal TTL has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
