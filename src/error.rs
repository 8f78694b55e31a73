//! Error types for the devflow engine

use thiserror::Error;

/// Main error type for devflow operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A service, port, ingress or flow identity is absent from a topology
    #[error("{kind} '{id}' not found during {operation}")]
    NotFound {
        /// Kind of entity that was looked up (service, port, flow, ...)
        kind: String,
        /// Identity that was looked up
        id: String,
        /// Operation that performed the lookup
        operation: String,
    },

    /// A topology or manifest violates a structural invariant
    #[error("structural invariant violated during {operation}: {message}")]
    Structural {
        /// Operation that detected the violation
        operation: String,
        /// Description of the violation
        message: String,
    },

    /// A plugin hook failed or returned a malformed payload
    #[error("plugin '{plugin}' failed for service '{service}': {message}")]
    PluginHook {
        /// Plugin reference name
        plugin: String,
        /// Service the hook was invoked for
        service: String,
        /// Hook error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Template rendering error
    #[error("template error: {0}")]
    Template(String),

    /// Invalid engine configuration
    #[error("config error: {0}")]
    Config(String),

    /// Cluster applier error
    #[error("failed to apply {kind} '{name}': {message}")]
    Apply {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Applier error message
        message: String,
    },
}

impl Error {
    /// Create a not-found error naming the missing identity and the operation
    pub fn not_found(
        kind: impl Into<String>,
        id: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
            operation: operation.into(),
        }
    }

    /// Create a structural invariant error
    pub fn structural(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Structural {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a plugin hook error
    pub fn plugin_hook(
        plugin: impl Into<String>,
        service: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::PluginHook {
            plugin: plugin.into(),
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an apply error for a resource
    pub fn apply(
        kind: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a caller/config mistake rather than a transient failure.
    ///
    /// Caller mistakes are never retried by the tenant layer or the applier.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Structural { .. } | Self::Config(_)
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<minijinja::Error> for Error {
    fn from(err: minijinja::Error) -> Self {
        Self::Template(err.to_string())
    }
}
