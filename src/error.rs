//! Error types for djaq.

use thiserror::Error;

/// The main error type for djaq operations.
#[derive(Debug, Error)]
pub enum DjaqError {
    /// Unknown model, or a model excluded by the whitelist.
    #[error("Model not found: '{0}'")]
    ModelNotFound(String),

    /// Unknown field or attribute on an otherwise valid model.
    #[error("Field not found: '{field}' on model '{model}'{}", hint(.suggestion))]
    FieldNotFound {
        model: String,
        field: String,
        suggestion: Option<String>,
    },

    /// Function is neither a builtin nor whitelisted.
    #[error("Unknown function: '{0}'")]
    UnknownFunction(String),

    /// Failed to parse an expression source.
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    /// Structurally invalid expression (bad column list, bad direction, arity).
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    /// An `@name` reference that resolves to nothing usable.
    #[error("Sub-query resolution failed: {0}")]
    SubqueryResolution(String),

    /// Literal SQL met while literal SQL is not trusted.
    #[error("Literal SQL is not trusted: '{0}'")]
    UntrustedSql(String),

    /// A placeholder survived pruning but has no value to bind.
    #[error("Missing value for parameter '{0}'")]
    MissingParameter(String),

    /// Invalid schema descriptor.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Row could not be converted to the requested shape.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn hint(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean '{}'?)", s),
        None => String::new(),
    }
}

impl DjaqError {
    /// Create a parse error at the given position.
    pub fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }

    /// Create a field-not-found error without a suggestion.
    pub fn field_not_found(model: impl Into<String>, field: impl Into<String>) -> Self {
        Self::FieldNotFound {
            model: model.into(),
            field: field.into(),
            suggestion: None,
        }
    }

    /// True for errors raised while compiling, as opposed to executing.
    pub fn is_compile_error(&self) -> bool {
        !matches!(
            self,
            Self::Connection(_) | Self::Execution(_) | Self::Decode(_) | Self::Io(_)
        )
    }
}

/// Result type alias for djaq operations.
pub type DjaqResult<T> = Result<T, DjaqError>;
