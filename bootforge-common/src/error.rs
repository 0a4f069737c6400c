// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The structured error object surfaced by the provisioner core.
//!
//! Validation hooks accumulate any number of messages into one [`Error`] and
//! hand it back only when something actually went wrong (see
//! [`Error::or_ok`]).  External adapters translate the numeric code into an
//! HTTP status or CLI exit; the core never interprets it.

use serde::{Deserialize, Serialize};

/// Broad classification of a core error.
///
/// Where possible we reuse existing kinds rather than inventing new ones to
/// distinguish cases no programmatic consumer needs to distinguish.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ErrorKind {
    /// A reference is missing, a key is duplicated, an immutable field
    /// changed, or some other invariant was violated.
    Validation,
    /// Deletion is blocked because other objects still depend on this one.
    StillInUse,
    /// A lease (or similarly contended resource) is held by a different
    /// token.
    Conflict,
    /// A template failed to compile or execute.  Render errors are recorded
    /// on the owning entity rather than aborting its save.
    Render,
    /// A socket or interface operation failed.
    Transport,
    /// The persistence backend failed.
    Backend,
}

impl ErrorKind {
    fn default_code(self) -> u16 {
        match self {
            ErrorKind::Validation => 422,
            ErrorKind::StillInUse => 409,
            ErrorKind::Conflict => 409,
            ErrorKind::Render => 422,
            ErrorKind::Transport => 500,
            ErrorKind::Backend => 500,
        }
    }
}

/// An error generated inside the provisioner core.
///
/// `code` is an HTTP-flavored numeric status, `kind` the taxonomy entry, and
/// `messages` everything the failing operation had to say.  When the error
/// was produced while working on a specific entity, `prefix` and `key`
/// identify it.
#[derive(Clone, Debug, Deserialize, Serialize, thiserror::Error)]
#[error("{}", self.render())]
pub struct Error {
    pub code: u16,
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub messages: Vec<String>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Error {
        Error {
            code: kind.default_code(),
            kind,
            prefix: None,
            key: None,
            messages: Vec::new(),
        }
    }

    /// A fresh error tied to the entity at `(prefix, key)`.
    pub fn for_object(kind: ErrorKind, prefix: &str, key: &str) -> Error {
        let mut e = Error::new(kind);
        e.prefix = Some(prefix.to_string());
        e.key = Some(key.to_string());
        e
    }

    pub fn validation(prefix: &str, key: &str) -> Error {
        Error::for_object(ErrorKind::Validation, prefix, key)
    }

    pub fn still_in_use(prefix: &str, key: &str) -> Error {
        Error::for_object(ErrorKind::StillInUse, prefix, key)
    }

    pub fn conflict(msg: impl Into<String>) -> Error {
        let mut e = Error::new(ErrorKind::Conflict);
        e.add(msg);
        e
    }

    pub fn backend(msg: impl Into<String>) -> Error {
        let mut e = Error::new(ErrorKind::Backend);
        e.add(msg);
        e
    }

    pub fn transport(msg: impl Into<String>) -> Error {
        let mut e = Error::new(ErrorKind::Transport);
        e.add(msg);
        e
    }

    /// Records one more message.
    pub fn add(&mut self, msg: impl Into<String>) {
        self.messages.push(msg.into());
    }

    /// Folds another error's messages into this one.  The code and kind
    /// stay as they are; the receiver decides how the combined failure is
    /// classified.
    pub fn merge(&mut self, other: Error) {
        self.messages.extend(other.messages);
    }

    pub fn has_errors(&self) -> bool {
        !self.messages.is_empty()
    }

    /// The usual tail call for a validation hook: succeed with `val` when no
    /// messages were recorded, otherwise fail with the accumulated error.
    pub fn or_ok<T>(self, val: T) -> Result<T, Error> {
        if self.has_errors() { Err(self) } else { Ok(val) }
    }

    fn render(&self) -> String {
        let what = match (&self.prefix, &self.key) {
            (Some(p), Some(k)) => format!("{:?}: {}/{}", self.kind, p, k),
            _ => format!("{:?}", self.kind),
        };
        if self.messages.is_empty() {
            what
        } else {
            format!("{}: {}", what, self.messages.join("; "))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_accumulation_and_or_ok() {
        let e = Error::validation("machines", "m1");
        assert!(e.or_ok(42).is_ok());

        let mut e = Error::validation("machines", "m1");
        e.add("Bootenv missing does not exist");
        e.add("Profile p1 (at 0) does not exist");
        let err = e.or_ok(()).unwrap_err();
        assert_eq!(err.code, 422);
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.messages.len(), 2);
        let text = err.to_string();
        assert!(text.contains("machines/m1"), "unexpected display: {text}");
        assert!(text.contains("Bootenv missing"), "unexpected display: {text}");
    }

    #[test]
    fn test_default_codes() {
        assert_eq!(Error::new(ErrorKind::Validation).code, 422);
        assert_eq!(Error::new(ErrorKind::StillInUse).code, 409);
        assert_eq!(Error::new(ErrorKind::Conflict).code, 409);
    }
}
