//! Diagnostics accumulated across a compilation session.
//!
//! Parse failures abort the load of the module they occur in; validation
//! and link failures accumulate so a single run reports every problem it
//! found. Fatal conditions (bad arguments, I/O, duplicate module names)
//! are returned eagerly as `anyhow` errors by the operation that hit them.

use std::fmt;

/// Broad classification of a recorded diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Unrecoverable: null/empty inputs, I/O, duplicate module name,
    /// invalid embedding.
    Fatal,
    /// Malformed binary or text input: bad LEB128, unknown opcode,
    /// unexpected token, unknown section.
    Parse,
    /// Static checks: type mismatch, out-of-range index, bad limits,
    /// invalid constant expression.
    Validate,
    /// Cross-module resolution: missing import, import-type mismatch,
    /// whitelist violation.
    Link,
    /// Reported by the native code generator.
    Backend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::Fatal => "fatal",
            ErrorKind::Parse => "parse",
            ErrorKind::Validate => "validate",
            ErrorKind::Link => "link",
            ErrorKind::Backend => "backend",
        };
        write!(f, "{}", s)
    }
}

/// One diagnostic, tagged with the module it was found in (when known).
///
/// The list these accumulate on is built in chronological order; whatever
/// order the loader threads finished in, validation and link diagnostics
/// always follow every parse diagnostic.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ValidationError {
    pub kind: ErrorKind,
    pub module: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(kind: ErrorKind, module: Option<&str>, message: impl Into<String>) -> Self {
        ValidationError {
            kind,
            module: module.map(|m| m.to_owned()),
            message: message.into(),
        }
    }

    pub fn validate(module: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validate, Some(module), message)
    }

    pub fn link(module: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Link, Some(module), message)
    }

    pub fn parse(module: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, Some(module), message)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.module {
            Some(m) => write!(f, "[{}] {}: {}", self.kind, m, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_carries_module_and_kind() {
        let e = ValidationError::link("m0", "missing import env.puts");
        assert_eq!(e.to_string(), "[link] m0: missing import env.puts");
        let e = ValidationError::new(ErrorKind::Fatal, None, "duplicate module name m0");
        assert_eq!(e.to_string(), "[fatal] duplicate module name m0");
    }
}
