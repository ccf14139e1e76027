//! Strongly-typed identifiers.
//!
//! String IDs are validated at construction time; numeric IDs are allocated
//! by their owners and only wrap on integer overflow.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed string ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, `TryFrom<&str>`, Display,
/// Serialize, Deserialize.
macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
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

        impl TryFrom<&str> for $name {
            type Error = &'static str;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                Self::from_string(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Macro to define a numeric ID newtype wrapper (u64, never zero when allocated).
macro_rules! define_numeric_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(ServiceId);
define_numeric_id!(WorkerId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_rejects_empty() {
        assert!(ServiceId::from_string(String::new()).is_err());
        let id = ServiceId::try_from("meter-1").unwrap();
        assert_eq!(id.as_str(), "meter-1");
        assert_eq!(id.to_string(), "meter-1");
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = ServiceId::try_from("svc").unwrap();
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("svc"));
        assert_eq!(
            serde_json::to_value(WorkerId::new(7)).unwrap(),
            serde_json::json!(7)
        );
    }
}
