//! Correlation keys.
//!
//! A [`MessageKey`] names the logical channel a message belongs to. The
//! concrete shape differs per appliance family (an MQTT-style topic, a
//! `service/action` pair, an event name), but all of them are
//! non-empty strings without whitespace, and replies carry the same key
//! as the request that caused them.

use std::{fmt, str::FromStr};

use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::error::Error;

/// The logical channel, topic or service/action name used to match a
/// reply to its originating request.
///
/// At most one unresolved request exists per key at a time, so the key
/// alone is sufficient correlation; the underlying protocols provide no
/// true correlation identifiers.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr)]
pub struct MessageKey(String);

impl MessageKey {
    /// Character separating the segments of a key.
    pub const SEPARATOR: char = '/';

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the segments of the key, split on [`SEPARATOR`](Self::SEPARATOR).
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(Self::SEPARATOR)
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageKey {
    type Err = Error;

    /// Parses a wire string `s` to return a `MessageKey`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if:
    /// - `s` is empty
    /// - `s` contains whitespace
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::invalid_argument("message key may not be empty"));
        }
        if s.contains(char::is_whitespace) {
            return Err(Error::invalid_argument(format!(
                "message key may not contain whitespace: `{s}`"
            )));
        }

        Ok(Self(s.to_owned()))
    }
}
