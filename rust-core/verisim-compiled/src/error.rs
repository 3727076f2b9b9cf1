// SPDX-License-Identifier: PMPL-1.0-or-later
//! Compiled query error types.

use thiserror::Error;

use crate::command::ParamType;
use crate::storage::StorageError;

/// Errors raised while deriving keys, compiling, binding or executing a
/// compiled query.
///
/// None of these are cached: a failed compile leaves no entry behind, so the
/// next call with the same key compiles again.
#[derive(Error, Debug)]
pub enum CompiledQueryError {
    #[error("unsupported expression in {template}: {reason}")]
    UnsupportedExpression {
        template: &'static str,
        reason: String,
    },

    #[error("{0} has no value equality contract; value_equatable key mode requires one")]
    EqualityContractMissing(&'static str),

    #[error("{template} has no member named {member}")]
    UnknownMember { template: &'static str, member: String },

    #[error("plan was compiled for {expected} but bound with {actual}")]
    TemplateTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("parameter {slot} expects {expected} but {member} produced {found}")]
    ParameterType {
        slot: String,
        member: String,
        expected: ParamType,
        found: ParamType,
    },

    #[error("no document matched {0}")]
    NotFound(&'static str),

    #[error("{template} expected a single document but matched {count}")]
    MultipleResults { template: &'static str, count: usize },

    #[error("result shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("result decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{template} cancelled after {elapsed_ms}ms waiting on storage")]
    Cancelled {
        template: &'static str,
        elapsed_ms: u128,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = CompiledQueryError> = std::result::Result<T, E>;
