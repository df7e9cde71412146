//! Newtype wrappers for domain identifiers.
//!
//! These newtypes prevent accidental mixing of different string identifiers
//! at compile time while remaining fully compatible with string-based APIs
//! through `Deref` and `From`.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::ConsumerError;

/// The name of a processing task, unique within its level of the task
/// definition tree.
///
/// # Construction
///
/// ```rust
/// use aws_stream_consumer::types::TaskName;
///
/// // From &str or String (no validation)
/// let name: TaskName = "persist-order".into();
///
/// // With validation
/// assert!(TaskName::new("persist-order").is_ok());
/// assert!(TaskName::new("").is_err()); // Empty names rejected
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskName(String);

impl TaskName {
    /// Creates a new `TaskName` with validation.
    ///
    /// Returns an error if the value is empty.
    pub fn new(name: impl Into<String>) -> Result<Self, ConsumerError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConsumerError::task_definition(
                "task name cannot be empty",
            ));
        }
        Ok(Self(name))
    }

    /// Creates a new `TaskName` without validation.
    #[inline]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns a reference to the inner string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the inner string value.
    #[inline]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for TaskName {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for TaskName {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskName {
    #[inline]
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskName {
    #[inline]
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The name of a stream or queue destination (a source stream, a dead record
/// queue, or a dead message queue).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationName(String);

impl DestinationName {
    /// Creates a new `DestinationName` with validation.
    ///
    /// Returns an error if the value is empty.
    pub fn new(name: impl Into<String>) -> Result<Self, ConsumerError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConsumerError::configuration(
                "destination name cannot be empty",
            ));
        }
        Ok(Self(name))
    }

    /// Creates a new `DestinationName` without validation.
    #[inline]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns a reference to the inner string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for DestinationName {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for DestinationName {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for DestinationName {
    #[inline]
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DestinationName {
    #[inline]
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
