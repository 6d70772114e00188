//! Error types for compilation and evaluation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompilerError>;

/// Errors raised while compiling a statement tree. All of these indicate a
/// malformed input tree; the rewrite passes themselves do not fail.
#[derive(Debug, Clone, Error)]
pub enum CompilerError {
    #[error("unbound symbol '{name}' in {context}")]
    UnboundSymbol { name: String, context: String },

    #[error("'{construct}' is not a valid input to bounds inference")]
    SliceBeforeInference { construct: &'static str },

    #[error("crop of dimension {dim} exceeds rank {rank} of buffer '{buffer}'")]
    RankMismatch {
        buffer: String,
        dim: usize,
        rank: usize,
    },

    #[error("wildcard expression in input tree ({context})")]
    WildcardInInput { context: String },

    #[error("output buffer '{name}' has no producer")]
    MissingProducer { name: String },

    #[error("malformed pipeline: {0}")]
    Malformed(String),
}

/// Errors raised while interpreting a compiled statement tree.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("check failed: {0}")]
    CheckFailed(String),

    #[error("symbol '{0}' is not bound to a value")]
    UndefinedValue(String),

    #[error("symbol '{0}' is bound to a {1}, expected a {2}")]
    WrongValueKind(String, &'static str, &'static str),

    #[error("division by zero")]
    DivideByZero,

    #[error("indeterminate value in evaluation")]
    Indeterminate,

    #[error("access at {at:?} is outside the storage of the buffer")]
    OutOfBounds { at: Vec<i64> },

    #[error("{0} is not supported by the interpreter")]
    Unsupported(&'static str),

    #[error("stage failed: {0}")]
    StageFailed(String),
}

#[macro_export]
macro_rules! err_malformed {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::Malformed(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! bail_malformed {
    ($($arg:tt)*) => {
        return Err($crate::err_malformed!($($arg)*))
    };
}
