//! Hierarchical failure classes.
//!
//! A class is a dotted path such as `strand.dependency.timeout`. Handlers
//! are declared against a class and catch every failure whose class is
//! equal to it or nested beneath it, the same way a handler for a base
//! type catches every subtype.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dotted failure class name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct FailureClass(String);

impl FailureClass {
    /// The root class, assignable from every failure
    #[must_use]
    pub const fn any() -> Self {
        Self(String::new())
    }

    /// Create a class from a dotted path
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self(path.trim_matches('.').to_string())
    }

    /// Get the dotted path
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the root class
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a failure of class `other` may be handled as `self`
    ///
    /// Matching is by whole path segments: `app.io` covers `app.io` and
    /// `app.io.read` but not `app.iox`.
    #[must_use]
    pub fn is_assignable_from(&self, other: &FailureClass) -> bool {
        if self.is_any() {
            return true;
        }
        match other.0.strip_prefix(self.0.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }

    /// Parent class, if any
    #[must_use]
    pub fn parent(&self) -> Option<FailureClass> {
        if self.is_any() {
            return None;
        }
        Some(match self.0.rsplit_once('.') {
            Some((parent, _)) => Self(parent.to_string()),
            None => Self::any(),
        })
    }

    /// Number of path segments (root has depth zero)
    #[must_use]
    pub fn depth(&self) -> usize {
        if self.is_any() {
            0
        } else {
            self.0.split('.').count()
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<&str> for FailureClass {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FailureClass {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
