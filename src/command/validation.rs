//! Named validation violations.

use std::fmt;

use serde::Serialize;

/// A single problem found by [`Command::validate`](super::Command::validate).
///
/// `field` names the offending part of the command: `program`, `params`,
/// `options`, `flags`, `args`, or the name of a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Violation for a required parameter that was never set.
    pub fn missing_param(name: &str) -> Self {
        Self::new(name, "required parameter is missing")
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
