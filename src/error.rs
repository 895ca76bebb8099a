use thiserror::Error;

/// Failures raised by the registration core.
///
/// Configuration-time variants (`FileReadFailure`, `FileParseFailure`,
/// `AlgorithmAllocationFailure`) abort only the requested change and leave
/// the pipeline in its last good state. The per-frame variants are recovered
/// locally by the stage that hits them.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("source image is missing")]
    NullImage,

    #[error("source image has no pixel data")]
    NullImageData,

    #[error("cannot process image with {channels} channels (need 1 or 3)")]
    InvalidImageType { channels: u8 },

    #[error("failed to construct algorithm '{family}'")]
    AlgorithmAllocationFailure { family: String },

    #[error("failed to read '{path}': {detail}")]
    FileReadFailure { path: String, detail: String },

    #[error("malformed calibration data: {detail}")]
    FileParseFailure { detail: String },

    #[error("descriptor reference not set: {which}")]
    DescriptorsUnset { which: &'static str },

    #[error("incompatible descriptors: {detail}")]
    IncompatibleDescriptors { detail: &'static str },

    #[error("point sequence not set: {which}")]
    PointsUnset { which: &'static str },
}

pub type Result<T> = std::result::Result<T, CoreError>;
