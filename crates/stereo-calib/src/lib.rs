//! Interactive camera calibration pipeline.
//!
//! Drives a live or file-backed image source through pattern detection,
//! accumulates board/image correspondences, solves for intrinsics and
//! stereo extrinsics, derives rectification maps, computes disparity and
//! reprojects it into a 3D point cloud.
//!
//! Capture, display, pattern detection and the heavy numerical solvers
//! are collaborators behind traits ([`FrameSource`], [`Display`],
//! [`PatternDetector`], [`CalibrationSolver`]); the pipeline itself owns
//! the stage sequencing, the data model and all persisted artifacts.

mod capture;
mod detect;
mod display;
pub mod disparity;
mod epipolar;
mod error;
mod maps;
mod pointcloud;
mod session;
mod solver;
mod stage;
mod stereo;

pub use capture::{
    expand_pattern, next_frame_with_retry, FrameSource, ImageSequenceSource, MemorySource,
};
pub use detect::PatternDetector;
pub use display::{ControlEvent, Display, NullDisplay};
pub use disparity::{BlockMatcher, DisparityEngine, MatcherParams, TuningParam};
pub use epipolar::{average_calibration_error, epipolar_line, point_line_distance, undistort_points};
pub use error::PipelineError;
pub use maps::{build_rectify_map, remap, side_by_side_with_lines};
pub use pointcloud::PointCloudBuilder;
pub use session::CalibrationSession;
pub use solver::{CalibrationSolver, RectifyTransforms, SolvedCamera};
pub use stage::{run_accumulation, Accumulator, StageOutcome, DEFAULT_FRAME_SKIP};
pub use stereo::{RectificationStrategy, StereoCalibrationSession};

/// Horizontal reference-line spacing on the rectified preview pair.
pub const REFERENCE_LINE_INTERVAL: usize = 16;

/// Points whose reprojected coordinates exceed this magnitude are treated
/// as at infinity and dropped from the point cloud.
pub const INFINITY_BOUND: f32 = 500.0;
