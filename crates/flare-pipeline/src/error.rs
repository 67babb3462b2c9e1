use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] flare_core::FlareError),

    #[error(transparent)]
    Transport(#[from] flare_transport::TransportError),

    #[error("Offline store error: {message}")]
    Store { message: String },

    #[error("Controller has been shut down")]
    ShutDown,
}
