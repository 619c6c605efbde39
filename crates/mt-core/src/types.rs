//! Core type definitions with validation.
//!
//! Catalog entities (machine modes, observation states, reasons, shifts,
//! templates) are carried as immutable value handles: an id plus the few
//! fields the engine actually reads. Slots never hold back-references into
//! the catalog.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// A reason score was negative or not a number.
    #[error("reason score must be a finite non-negative number, got {value}")]
    InvalidScore { value: f64 },
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated machine identifier.
    ///
    /// Every slot partition is owned by exactly one machine.
    MachineId, "machine ID"
);

define_string_id!(
    /// A validated machine mode identifier (e.g., "active", "idle", "off").
    MachineModeId, "machine mode ID"
);

define_string_id!(
    /// A validated observation state identifier (e.g., "attended", "unattended").
    ObservationStateId, "observation state ID"
);

define_string_id!(
    /// A validated reason identifier.
    ReasonId, "reason ID"
);

define_string_id!(
    /// A validated shift identifier.
    ShiftId, "shift ID"
);

define_string_id!(
    /// A validated day/shift template identifier.
    TemplateId, "template ID"
);

/// A machine mode value handle.
///
/// `running` is tri-state: `None` means the mode does not determine by itself
/// whether the machine produces (e.g., a manual mode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineMode {
    pub id: MachineModeId,
    /// Whether this mode counts as the machine running.
    pub running: Option<bool>,
    /// Whether the mode is entered automatically by the data acquisition.
    #[serde(default)]
    pub auto: bool,
}

/// A machine observation state value handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationState {
    pub id: ObservationStateId,
    /// Whether slots in this state must carry a shift.
    #[serde(default)]
    pub shift_required: bool,
    /// Whether this state counts as production time in summaries.
    #[serde(default)]
    pub production: bool,
}

/// A reason value handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub id: ReasonId,
    /// Short display code.
    pub code: String,
}

/// A shift value handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub id: ShiftId,
    /// Short display code.
    pub code: String,
}

/// A reason score: finite and non-negative.
///
/// Scores rank competing reason assertions; higher wins. Manual assertions
/// conventionally use [`Score::MANUAL`], auto-reason extensions configure
/// their own.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Score(f64);

impl Score {
    /// Conventional score of a manual reason assertion.
    pub const MANUAL: Self = Self(100.0);

    /// Conventional score of a static default-table reason.
    pub const DEFAULT: Self = Self(10.0);

    /// Creates a score after validation.
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() || value < 0.0 {
            return Err(ValidationError::InvalidScore { value });
        }
        Ok(Self(value))
    }

    /// Returns the inner value.
    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Score {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Score {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_rejects_empty() {
        assert!(MachineId::new("").is_err());
        assert!(MachineId::new("machine-1").is_ok());
    }

    #[test]
    fn machine_id_serde_roundtrip() {
        let id = MachineId::new("m-42").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"m-42\"");
        let parsed: MachineId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn machine_id_serde_rejects_empty() {
        let result: Result<MachineId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn score_validates_range() {
        assert!(Score::new(0.0).is_ok());
        assert!(Score::new(120.0).is_ok());
        assert!(Score::new(-1.0).is_err());
        assert!(Score::new(f64::NAN).is_err());
        assert!(Score::new(f64::INFINITY).is_err());
    }

    #[test]
    fn score_ordering() {
        assert!(Score::DEFAULT < Score::MANUAL);
        assert!(Score::new(120.0).unwrap() > Score::MANUAL);
    }

    #[test]
    fn reason_id_as_ref() {
        let id = ReasonId::new("break").unwrap();
        let s: &str = id.as_ref();
        assert_eq!(s, "break");
    }

    #[test]
    fn catalog_handles_compare_by_value() {
        let a = MachineMode {
            id: MachineModeId::new("active").unwrap(),
            running: Some(true),
            auto: true,
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
