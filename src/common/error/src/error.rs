//! Core error types for Strata.

use thiserror::Error;

/// Result type alias using `StrataError`.
pub type StrataResult<T> = std::result::Result<T, StrataError>;

/// Generic boxed error for external error sources.
pub type GenericError = Box<dyn std::error::Error + Send + Sync>;

/// Core error type for Strata operations.
///
/// Variants fall into five families with distinct handling rules:
/// authorization (`AuthDeny`) is fatal and never retried; validation
/// (`BadArg`, `BadDef`, `BadSyntax`) is fatal at parse time; not-found
/// (`NoSuchView`, `NoSuchIden`, `NoSuchName`) is fatal for the operation
/// that performed the lookup; runtime errors abort the current pipeline
/// but are recovered by daemon supervision; `Cancelled` always propagates
/// and is never logged as an error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StrataError {
    /// Permission check failed.
    #[error("AuthDeny: {mesg}")]
    AuthDeny {
        /// Human readable denial message.
        mesg: String,
        /// The dotted permission that was required.
        perm: String,
    },

    /// Invalid argument value or type.
    #[error("BadArg: {0}")]
    BadArg(String),

    /// Malformed command or daemon definition.
    #[error("BadDef: {0}")]
    BadDef(String),

    /// Query text failed to compile.
    #[error("BadSyntax: {0}")]
    BadSyntax(String),

    /// Unknown view iden.
    #[error("NoSuchView: {0}")]
    NoSuchView(String),

    /// Unknown node iden.
    #[error("NoSuchIden: {0}")]
    NoSuchIden(String),

    /// Unknown name (variable, command, type).
    #[error("NoSuchName: {0}")]
    NoSuchName(String),

    /// Merge attempted on a view without a parent.
    #[error("CantMergeView: {0}")]
    CantMergeView(String),

    /// Clean early exit requested by the query itself.
    #[error("QueryExit")]
    QueryExit,

    /// Query logic error raised mid-stream.
    #[error("RuntimeError: {0}")]
    RuntimeError(String),

    /// Execution was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Feature not yet implemented.
    #[error("NotImplemented: {0}")]
    NotImplemented(String),

    /// Internal error (bug in Strata).
    #[error("InternalError: {0}")]
    InternalError(String),

    /// IO error.
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("SerdeJsonError: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// External error from third-party libraries.
    #[error("ExternalError: {0}")]
    ExternalError(GenericError),
}

impl StrataError {
    /// Create a new `AuthDeny` for a dotted permission.
    pub fn auth_deny<S: Into<String>>(mesg: S, perm: &[&str]) -> Self {
        Self::AuthDeny {
            mesg: mesg.into(),
            perm: perm.join("."),
        }
    }

    /// Create a new `BadArg`.
    pub fn bad_arg<S: Into<String>>(mesg: S) -> Self {
        Self::BadArg(mesg.into())
    }

    /// Create a new `BadDef`.
    pub fn bad_def<S: Into<String>>(mesg: S) -> Self {
        Self::BadDef(mesg.into())
    }

    /// Create a new `RuntimeError`.
    pub fn runtime<S: Into<String>>(mesg: S) -> Self {
        Self::RuntimeError(mesg.into())
    }

    /// Create a new `Cancelled` error.
    pub fn cancelled<S: Into<String>>(mesg: S) -> Self {
        Self::Cancelled(mesg.into())
    }

    /// Create a new `NotImplemented` error.
    pub fn not_implemented<S: Into<String>>(mesg: S) -> Self {
        Self::NotImplemented(mesg.into())
    }

    /// Create a new `InternalError`.
    pub fn internal<S: Into<String>>(mesg: S) -> Self {
        Self::InternalError(mesg.into())
    }

    /// True if this error is a cancellation and must propagate untouched.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// True if this error is an authorization denial.
    pub fn is_auth_deny(&self) -> bool {
        matches!(self, Self::AuthDeny { .. })
    }
}

/// Ensure a condition holds, returning a `RuntimeError` if not.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            return Err($crate::StrataError::RuntimeError($msg.to_string()));
        }
    };
    ($cond:expr, $variant:ident: $($msg:tt)*) => {
        if !$cond {
            return Err($crate::StrataError::$variant(format!($($msg)*)));
        }
    };
}

/// Return early with a `RuntimeError`.
#[macro_export]
macro_rules! runtime_err {
    ($($arg:tt)*) => {
        return Err($crate::StrataError::RuntimeError(format!($($arg)*)))
    };
}

/// Return early with a `BadArg` error.
#[macro_export]
macro_rules! bad_arg {
    ($($arg:tt)*) => {
        return Err($crate::StrataError::BadArg(format!($($arg)*)))
    };
}
