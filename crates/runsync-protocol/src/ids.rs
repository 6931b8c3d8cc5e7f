//! Typed identifiers used across the run sync crates.
//!
//! IDs are opaque String wrappers (serde-transparent). The server owns id
//! generation; the client only compares and echoes them back in URLs.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the id is empty or whitespace only.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Identifier of a server-executed run.
    RunId
);
typed_id!(
    /// Server-assigned identifier of a single run event.
    EventId
);
typed_id!(
    /// Identifier of the project a run belongs to.
    ProjectId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_transparently() {
        let run_id = RunId::from_string("run-42");
        let json = serde_json::to_string(&run_id).unwrap();
        assert_eq!(json, "\"run-42\"");
        let back: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run_id);
    }

    #[test]
    fn blank_ids_are_detected() {
        assert!(RunId::from_string("  ").is_blank());
        assert!(!RunId::new_uuid().is_blank());
    }
}
