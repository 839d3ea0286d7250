//! Integer task priority where a lower value is served first.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{SchedulerError, SchedulerResult};

/// Task priority in the closed range `[Priority::MAX, Priority::MIN]`.
///
/// `0` is the most urgent value and `20` the least urgent one, so the derived
/// ordering sorts the most urgent task first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct Priority(u8);

impl Priority {
    /// Most urgent priority.
    pub const MAX: Self = Self(0);
    /// Least urgent priority.
    pub const MIN: Self = Self(20);
    /// Priority given to work submitted without one.
    pub const DEFAULT: Self = Self((Self::MIN.0 - Self::MAX.0) / 2);

    /// Validate a raw priority value.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidArgument` when `value` lies outside `[0, 20]`.
    pub fn new(value: i32) -> SchedulerResult<Self> {
        match u8::try_from(value) {
            Ok(v) if (Self::MAX.0..=Self::MIN.0).contains(&v) => Ok(Self(v)),
            _ => Err(SchedulerError::invalid(
                "priority",
                format!(
                    "{value} is outside [{}, {}]",
                    Self::MAX.0,
                    Self::MIN.0
                ),
            )),
        }
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<i32> for Priority {
    type Error = SchedulerError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for i32 {
    fn from(p: Priority) -> Self {
        Self::from(p.0)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_accepted() {
        assert_eq!(Priority::new(0).unwrap(), Priority::MAX);
        assert_eq!(Priority::new(20).unwrap(), Priority::MIN);
        assert_eq!(Priority::default().value(), 10);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(Priority::new(-1).is_err());
        assert!(Priority::new(21).is_err());
        assert!(Priority::new(i32::MAX).is_err());
    }

    #[test]
    fn test_lower_value_sorts_first() {
        assert!(Priority::MAX < Priority::DEFAULT);
        assert!(Priority::DEFAULT < Priority::MIN);
    }

    #[test]
    fn test_serde_as_integer() {
        let p: Priority = serde_json::from_str("7").unwrap();
        assert_eq!(p.value(), 7);
        assert_eq!(serde_json::to_string(&p).unwrap(), "7");
        assert!(serde_json::from_str::<Priority>("42").is_err());
    }
}
