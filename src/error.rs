use thiserror::Error;

pub type Result<T> = std::result::Result<T, NatError>;

#[derive(Debug, Error)]
pub enum NatError {
    /// A value was supplied for a field the configured model does not accept.
    #[error("{field} is not supported for {key}: {model}")]
    GatingViolation {
        field: String,
        key: String,
        model: String,
    },

    #[error("{field} must be within [{min}, {max}], got {value}")]
    RangeViolation {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("invalid gated field definition: {0}")]
    InvalidGateSpec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("{provider} request failed with {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("trace conversion error: {0}")]
    TraceConversion(String),

    #[error("export error: {0}")]
    Export(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl NatError {
    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            NatError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
