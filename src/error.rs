//! Error taxonomy.
//!
//! The runtime draws a line between condition failures (why a pre-flight
//! predicate refused to pass), operation errors (the public, user-visible
//! error attached to a finished operation), and configuration errors (load
//! failures for [`crate::config::RuntimeConfig`]). Each is its own enum
//! rather than one crate-wide catch-all, so a caller matching on a
//! `ConditionFailure` isn't also forced to handle `ConfigError` variants.

use std::fmt;

/// Why a [`crate::condition::Condition`] refused to evaluate as satisfied.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConditionFailure {
    /// A [`crate::condition::BlockCondition`] predicate returned `false`.
    #[error("block condition failed")]
    BlockFailed,

    /// A [`crate::condition::FalseCondition`] was evaluated.
    #[error("false condition")]
    FalseCondition,

    /// [`crate::condition::NoFailedDependenciesCondition`] found a cancelled dependency.
    #[error("one or more dependencies were cancelled")]
    CancelledDependencies,

    /// [`crate::condition::NoFailedDependenciesCondition`] found a failed dependency.
    #[error("one or more dependencies failed")]
    FailedDependencies,

    /// A negated [`crate::condition::ComposedCondition`] found its inner condition satisfied.
    #[error("requirement not satisfied")]
    RequirementNotSatisfied,

    /// An escape hatch for user-defined condition failures.
    #[error("{0}")]
    Custom(String),
}

/// The public error type surfaced on a finished [`crate::operation::Operation`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationError {
    /// A condition attached to this operation failed during evaluation.
    #[error("condition failed: {0}")]
    Condition(#[from] ConditionFailure),

    /// A structural error wrapping a group's cancellation cause, propagated
    /// to a child that supports error-carrying cancellation.
    #[error("parent cancelled: {0:?}")]
    ParentCancelled(Vec<OperationError>),

    /// A domain-specific error reported by an operation's own `execute` body
    /// via `finish(errors)`, or synthesized from a caught panic.
    #[error("{0}")]
    Domain(String),
}

impl OperationError {
    /// Construct a domain error from any displayable value.
    pub fn domain(message: impl fmt::Display) -> Self {
        OperationError::Domain(message.to_string())
    }
}

/// Failure to load or parse [`crate::config::RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML in config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid environment override {key}: {value}")]
    InvalidEnv { key: String, value: String },
}
