use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlareError>;

#[derive(Error, Debug)]
pub enum FlareError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Packaging error: {message}")]
    Packaging { message: String },

    #[error("Invalid scrub pattern '{pattern}': {source}")]
    ScrubPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
