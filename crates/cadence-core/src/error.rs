use thiserror::Error;

/// Errors raised while building or resolving triggers.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The expression could not be parsed by the scheme's builder.
    #[error("Invalid '{scheme}' expression: {message}")]
    InvalidExpression { scheme: String, message: String },

    /// No builder is registered for the requested scheme.
    #[error("No trigger builder registered for scheme '{scheme}'")]
    UnknownScheme { scheme: String },

    /// The expression text is empty or whitespace-only.
    #[error("Trigger expression is empty")]
    EmptyExpression,
}

pub type Result<T> = std::result::Result<T, TriggerError>;
