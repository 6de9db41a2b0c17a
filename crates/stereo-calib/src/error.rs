use stereo_calib_core::StorageError;

/// Errors produced by the pipeline stages.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// A capture read failed even after one reopen attempt.
    #[error("frame unavailable from capture source{}", source_name(.0))]
    FrameUnavailable(Option<String>),

    /// The two stereo sources disagree on frame count. Checked once at
    /// session construction, never retried.
    #[error("stereo sources report different frame counts (left {left}, right {right})")]
    FrameCountMismatch { left: usize, right: usize },

    /// A numerical solver reported failure; propagates as fatal.
    #[error("solver failed: {0}")]
    Solver(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to decode frame: {0}")]
    Image(#[from] image::ImageError),

    /// A stage precondition was not met (e.g. missing rectification maps).
    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn source_name(name: &Option<String>) -> String {
    match name {
        Some(n) => format!(" {n:?}"),
        None => String::new(),
    }
}
