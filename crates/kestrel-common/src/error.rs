//! Error types for the cluster engine
//!
//! Every failure the engine can surface maps to exactly one [`ErrorKind`].
//! The kind drives the process exit code, so wrapping an error with context
//! must never change it: [`Error::Context`] delegates `kind()` to its source.

use std::fmt;

use thiserror::Error;

/// Closed enumeration of failure kinds
///
/// Each kind maps one-to-one to a non-zero process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgs,
    ModelInvalid,
    ModelNotFound,
    OutputExists,
    UnsupportedVersion,
    UnsupportedUpgrade,
    CloudAuthFailed,
    CloudApiError,
    DeploymentFailed,
    DrainFailed,
    MultiDrainFailed,
    TemplateMalformed,
    Timeout,
    Internal,
}

impl ErrorKind {
    /// Process exit code for this kind
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::InvalidArgs => 2,
            ErrorKind::ModelInvalid => 3,
            ErrorKind::ModelNotFound => 4,
            ErrorKind::OutputExists => 5,
            ErrorKind::UnsupportedVersion => 6,
            ErrorKind::UnsupportedUpgrade => 7,
            ErrorKind::CloudAuthFailed => 8,
            ErrorKind::CloudApiError => 9,
            ErrorKind::DeploymentFailed => 10,
            ErrorKind::DrainFailed => 11,
            ErrorKind::MultiDrainFailed => 12,
            ErrorKind::TemplateMalformed => 13,
            ErrorKind::Timeout => 14,
            ErrorKind::Internal => 70,
        }
    }

    pub fn is_drain(self) -> bool {
        matches!(self, ErrorKind::DrainFailed | ErrorKind::MultiDrainFailed)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgs => "InvalidArgs",
            ErrorKind::ModelInvalid => "ModelInvalid",
            ErrorKind::ModelNotFound => "ModelNotFound",
            ErrorKind::OutputExists => "OutputExists",
            ErrorKind::UnsupportedVersion => "UnsupportedVersion",
            ErrorKind::UnsupportedUpgrade => "UnsupportedUpgrade",
            ErrorKind::CloudAuthFailed => "CloudAuthFailed",
            ErrorKind::CloudApiError => "CloudAPIError",
            ErrorKind::DeploymentFailed => "DeploymentFailed",
            ErrorKind::DrainFailed => "DrainFailed",
            ErrorKind::MultiDrainFailed => "MultiDrainFailed",
            ErrorKind::TemplateMalformed => "TemplateMalformed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// User supplied missing or incompatible flags
    #[error("{message}")]
    InvalidArgs { message: String },

    /// API model failed validation at a field path
    #[error("{field}: {reason}")]
    ModelInvalid { field: String, reason: String },

    /// API model file does not exist
    #[error("specified api model does not exist ({path})")]
    ModelNotFound { path: String },

    /// Output directory exists and overwriting was not requested
    #[error("Output directory already exists and forceOverwrite flag is not set: {path}")]
    OutputExists { path: String },

    /// Kubernetes version is not supported by this build
    #[error("{message}")]
    UnsupportedVersion { message: String },

    /// Target version is not reachable from the current one
    #[error("upgrading from Kubernetes version {from} to version {to} is not supported. To see a list of available upgrades, use 'kestrel get-versions --version {from}'")]
    UnsupportedUpgrade { from: String, to: String },

    /// Cloud credentials were rejected or missing
    #[error("cloud authentication failed: {message}")]
    CloudAuthFailed { message: String },

    /// Cloud API returned an error
    #[error("cloud API error ({code}): {message}")]
    CloudApi { code: String, message: String },

    /// Deployment finished in a failed state; body is the cloud's verbatim error
    #[error("deployment failed: {body}")]
    DeploymentFailed { body: String },

    /// A single node could not be drained
    #[error("failed to drain node {node}: {cause}")]
    DrainFailed { node: String, cause: String },

    /// Several nodes could not be drained
    #[error("failed to drain {} node(s): {}", .failures.len(), join_messages(.failures))]
    MultiDrainFailed { failures: Vec<Error> },

    /// Several nodes failed, not all of them while draining
    #[error("{} node(s) failed: {}", .failures.len(), join_messages(.failures))]
    NodeFailures { failures: Vec<Error> },

    /// Template is not shaped as expected
    #[error("template malformed at {location}: {reason}")]
    TemplateMalformed { location: String, reason: String },

    /// A bounded step did not complete in time
    #[error("timed out: {step}")]
    Timeout { step: String },

    /// Filesystem failure at a persistence point
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Programmer error or broken invariant
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Wrapped error with additional context
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Error::InvalidArgs {
            message: message.into(),
        }
    }

    pub fn model_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ModelInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn model_not_found(path: impl Into<String>) -> Self {
        Error::ModelNotFound { path: path.into() }
    }

    pub fn output_exists(path: impl Into<String>) -> Self {
        Error::OutputExists { path: path.into() }
    }

    pub fn unsupported_version(message: impl Into<String>) -> Self {
        Error::UnsupportedVersion {
            message: message.into(),
        }
    }

    pub fn unsupported_upgrade(from: impl Into<String>, to: impl Into<String>) -> Self {
        Error::UnsupportedUpgrade {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn cloud_auth(message: impl Into<String>) -> Self {
        Error::CloudAuthFailed {
            message: message.into(),
        }
    }

    pub fn cloud_api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::CloudApi {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn deployment_failed(body: impl Into<String>) -> Self {
        Error::DeploymentFailed { body: body.into() }
    }

    pub fn drain_failed(node: impl Into<String>, cause: impl Into<String>) -> Self {
        Error::DrainFailed {
            node: node.into(),
            cause: cause.into(),
        }
    }

    pub fn template_malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::TemplateMalformed {
            location: location.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(step: impl Into<String>) -> Self {
        Error::Timeout { step: step.into() }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Wrap this error with additional context, keeping its kind
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgs { .. } => ErrorKind::InvalidArgs,
            Error::ModelInvalid { .. } => ErrorKind::ModelInvalid,
            Error::ModelNotFound { .. } => ErrorKind::ModelNotFound,
            Error::OutputExists { .. } => ErrorKind::OutputExists,
            Error::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            Error::UnsupportedUpgrade { .. } => ErrorKind::UnsupportedUpgrade,
            Error::CloudAuthFailed { .. } => ErrorKind::CloudAuthFailed,
            Error::CloudApi { .. } => ErrorKind::CloudApiError,
            Error::DeploymentFailed { .. } => ErrorKind::DeploymentFailed,
            Error::DrainFailed { .. } => ErrorKind::DrainFailed,
            Error::MultiDrainFailed { .. } => ErrorKind::MultiDrainFailed,
            Error::NodeFailures { failures } => failures
                .iter()
                .map(Error::kind)
                .find(|k| !k.is_drain())
                .unwrap_or(ErrorKind::MultiDrainFailed),
            Error::TemplateMalformed { .. } => ErrorKind::TemplateMalformed,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Io { .. } | Error::Internal { .. } => ErrorKind::Internal,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// Innermost error, skipping every context layer
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Context layers from outermost to innermost, ending with the root message
    pub fn chain(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = self;
        while let Error::Context { context, source } = current {
            out.push(context.clone());
            current = source;
        }
        out.push(current.to_string());
        out
    }

    /// Aggregate drain failures: none is success, one stays as-is, several become `MultiDrainFailed`
    pub fn from_drain_failures(mut failures: Vec<Error>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(Error::MultiDrainFailed { failures }),
        }
    }

    /// Aggregate failures of per-node work that drains and then calls the cloud
    ///
    /// Several drain failures are `MultiDrainFailed`. Otherwise the aggregate
    /// takes the kind of its first failure that is not a drain failure.
    pub fn from_node_failures(mut failures: Vec<Error>) -> Option<Self> {
        let all_drains = failures.iter().all(|e| e.kind().is_drain());
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ if all_drains => Some(Error::MultiDrainFailed { failures }),
            _ => Some(Error::NodeFailures { failures }),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::model_invalid("(json)", e.to_string())
    }
}

/// Extension trait for attaching context to results
pub trait ResultExt<T> {
    /// Wrap the error with a static or formatted message
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Wrap the error with a lazily built message
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Into::<Error>::into(e).context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Into::<Error>::into(e).context(f()))
    }
}
