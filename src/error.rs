//! Error taxonomy for the perception loop and its collaborators.

use thiserror::Error;

/// Camera acquisition errors. Fatal to the session at startup.
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera access denied: {0}")]
    AccessDenied(String),

    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Detection model errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to load detection model: {0}")]
    Load(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Text recognition errors.
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("text recognition engine not available: {0}")]
    EngineMissing(String),

    #[error("text recognition failed: {0}")]
    Failed(String),
}

/// Speech output errors.
#[derive(Error, Debug)]
pub enum NarrationError {
    #[error("narration unavailable: {0}")]
    Unsupported(String),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
}
