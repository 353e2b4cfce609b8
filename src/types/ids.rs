//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, Display, Serialize, Deserialize.
/// Optionally generates `new()` (UUID v4) and `Default` if `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
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
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
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
    };
}

// Request/subscription identity — always fresh, never user-supplied.
define_id!(RequestId, uuid);
define_id!(SubscriptionId, uuid);
define_id!(EventId, uuid);

// Domain identity — typically user- or config-supplied, validated non-empty.
define_id!(AgentId);
define_id!(JudgeId);
define_id!(BatchId, uuid);
define_id!(StageId);
define_id!(AdventureId);
define_id!(UserId);
define_id!(GenreId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
        assert_ne!(BatchId::new(), BatchId::new());
    }

    #[test]
    fn from_string_rejects_empty() {
        assert!(AgentId::from_string(String::new()).is_err());
        assert!(StageId::from_string(String::new()).is_err());
    }

    #[test]
    fn from_str_conversion_roundtrips() {
        let agent: AgentId = "claude".into();
        assert_eq!(agent.as_str(), "claude");
        assert_eq!(agent.to_string(), "claude");
    }

    #[test]
    fn ids_are_hashable_and_ordered() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(AgentId::from("claude"));
        set.insert(AgentId::from("gpt"));
        assert_eq!(set.len(), 2);
        assert!(AgentId::from("claude") < AgentId::from("gpt"));
    }
}
