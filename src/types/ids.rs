//! Identifier types for the attendance kernel.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create from an existing UUID.
            pub fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from a UUID string.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id! {
    /// Unique identifier for a student.
    ///
    /// Wraps a UUID and implements `Ord` for deterministic ordering.
    StudentId
}

uuid_id! {
    /// Unique identifier for an attendance session (one class meeting's check-in window).
    SessionId
}

uuid_id! {
    /// Unique identifier for a course.
    CourseId
}

uuid_id! {
    /// Unique identifier for a decision ledger entry.
    LedgerEntryId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = StudentId::generate();
        let parsed = StudentId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_order_deterministically() {
        let a = SessionId::new(Uuid::from_u128(1));
        let b = SessionId::new(Uuid::from_u128(2));
        assert!(a < b);
    }
}
