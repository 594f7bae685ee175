//! Runtime error model.
//!
//! Every fallible operation in the runtime returns [`RunResult`]. A
//! [`RunError`] carries an [`ErrorKind`] from the fixed taxonomy, a
//! human-readable message, and the byte offset of the failing instruction
//! when the error surfaced inside a running fiber.

use std::fmt;

use strum::{Display, IntoStaticStr};

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Error categories surfaced by the runtime.
///
/// The string representation matches the conventional exception name
/// (e.g. `Type` -> "TypeError") via strum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ErrorKind {
    /// Operator/operand mismatch, invalid cast in a binding, or dispatch on
    /// a value that is not callable/subscriptable/has no such member.
    #[strum(serialize = "TypeError")]
    Type,
    /// Missing, duplicate, unknown or excess arguments.
    #[strum(serialize = "ArityError")]
    Arity,
    /// Domain errors: negative shift count, out-of-range access,
    /// scheduler/promise misuse.
    #[strum(serialize = "ValueError")]
    Value,
    /// Catch-all wrapper for a message surfaced to user code.
    #[strum(serialize = "RuntimeError")]
    Runtime,
    /// A programming bug in the host embedding, e.g. a binder invoked with
    /// an incoherent signature vs its registered spec.
    #[strum(serialize = "InternalError")]
    Internal,
}

/// Position of a failing instruction inside its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodePos {
    /// Byte offset of the instruction's opcode in the chunk.
    pub ip: usize,
}

/// A runtime error with category, message and optional code position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    /// The error category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Byte offset of the failing instruction, when known.
    pub pos: Option<CodePos>,
}

impl RunError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            pos: None,
        }
    }

    /// Operator/operand or cast mismatch.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    /// Argument shape mismatch.
    pub fn arity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arity, message)
    }

    /// Domain error.
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    /// Message surfaced to user code.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    /// Host embedding bug.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attaches the failing instruction position, keeping an existing one.
    ///
    /// The innermost position wins: unwinding code calls this at every level
    /// but only the first (deepest) call records anything.
    #[must_use]
    pub fn with_pos(mut self, ip: usize) -> Self {
        if self.pos.is_none() {
            self.pos = Some(CodePos { ip });
        }
        self
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(pos) = self.pos {
            write!(f, " (at byte offset {})", pos.ip)?;
        }
        Ok(())
    }
}

impl std::error::Error for RunError {}
