//! The canonical service error type.
//!
//! Handlers may fail with anything that converts to [`BoxError`]; the
//! dispatcher wraps whatever comes back into an [`Error`]. A wrapped
//! [`Error`] passes through unchanged, so context attached deeper in the
//! call stack survives propagation.

use std::collections::BTreeMap;

/// Boxed error type handlers are allowed to fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    BadRequest,
    BadResponse,
    Timeout,
    NotFound,
    Forbidden,
    Unauthorized,
    InternalService,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::BadRequest => "bad_request",
            Code::BadResponse => "bad_response",
            Code::Timeout => "timeout",
            Code::NotFound => "not_found",
            Code::Forbidden => "forbidden",
            Code::Unauthorized => "unauthorized",
            Code::InternalService => "internal_service",
        }
    }
}

/// A canonical service error: a code, a human-readable message, and private
/// context that travels with the error as it crosses service boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: Code,
    pub message: String,
    context: BTreeMap<String, String>,
}

impl Error {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Code::BadRequest, message)
    }

    pub fn internal_service(message: impl Into<String>) -> Self {
        Self::new(Code::InternalService, message)
    }

    /// Wrap an arbitrary error. An [`Error`] passes through unchanged;
    /// anything else becomes an internal service error carrying the original
    /// message.
    pub fn wrap(err: BoxError) -> Self {
        match err.downcast::<Error>() {
            Ok(canonical) => *canonical,
            Err(other) => Self::internal_service(other.to_string()),
        }
    }

    /// Look up a private context value.
    pub fn context(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    /// Attach a private context value, replacing any previous one.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach a private context value only if the key is not already set.
    pub fn context_if_unset(&mut self, key: &str, value: &str) {
        if !self.context.contains_key(key) {
            self.context.insert(key.to_string(), value.to_string());
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for Error {}
