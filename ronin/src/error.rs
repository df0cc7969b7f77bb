//! Error types for the runtime.
//!
//! The taxonomy follows one rule: anywhere an in-band representation exists
//! (a tool output, a verdict, a failure record), that representation is used
//! instead of `Err`. The variants below are reserved for model transport
//! failures, contract violations, and fatal configuration problems.

use crate::model::Tier;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The model transport failed (network, provider, malformed response).
    #[error("model error: {message}")]
    Model {
        /// The underlying error message.
        message: String,
    },

    /// No model is configured for the requested tier.
    #[error("no model configured for tier '{tier}'")]
    TierUnavailable {
        /// The tier that was requested.
        tier: Tier,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration issue.
        message: String,
    },

    /// The run was aborted via its abort signal.
    #[error("run aborted")]
    Aborted,

    /// Plan production or validation failed.
    #[error("planning failed: {message}")]
    Planning {
        /// Why the plan was rejected.
        message: String,
    },

    /// Step verification failed in a way that cannot be expressed as a verdict.
    #[error("verification failed: {message}")]
    Verification {
        /// The underlying error message.
        message: String,
    },

    /// An internal invariant was broken.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the broken invariant.
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a new model error.
    #[must_use]
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model {
            message: message.into(),
        }
    }

    /// Create a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new planning error.
    #[must_use]
    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning {
            message: message.into(),
        }
    }

    /// Create a new verification error.
    #[must_use]
    pub fn verification(message: impl Into<String>) -> Self {
        Self::Verification {
            message: message.into(),
        }
    }

    /// Create a new invalid-state error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}

/// Errors raised at the tool boundary.
///
/// These never escape the tool executor as `Err`: every variant is rendered
/// into a failed [`ToolOutput`](crate::message::ToolOutput) that the agent
/// sees as ordinary tool output.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    /// No tool is registered under the given exposed name.
    #[error("tool '{0}' not found")]
    NotFound(String),

    /// The arguments did not match the tool's input schema.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The tool ran but failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// A guard rejected the call.
    #[error("rejected by guard '{guard}': {reason}")]
    Rejected {
        /// Name of the guard that rejected the call.
        guard: String,
        /// Why it rejected.
        reason: String,
    },

    /// The run's abort signal fired before or during the call.
    #[error("tool call aborted")]
    Aborted,
}
