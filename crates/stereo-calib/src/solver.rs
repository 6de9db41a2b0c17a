//! Boundary to the external numerical vision routines.
//!
//! Camera matrix estimation, the joint stereo solve and the rectification
//! transform computations are supplied by a vision library behind this
//! trait; the pipeline owns everything around them (accumulation, error
//! metrics, remap tables, persistence).

use nalgebra::{Matrix3, Matrix3x4, Point3, Vector3};
use stereo_calib_core::{CameraParams, CornerSet, StereoExtrinsics};

use crate::error::PipelineError;

/// Result of the single-camera intrinsic solve.
#[derive(Clone, Debug)]
pub struct SolvedCamera {
    pub camera: CameraParams,
    pub rotations: Vec<Vector3<f64>>,
    pub translations: Vec<Vector3<f64>>,
}

/// Output of the calibrated (Bouguet) rectification transform solve.
#[derive(Clone, Copy, Debug)]
pub struct RectifyTransforms {
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    pub p1: Matrix3x4<f64>,
    pub p2: Matrix3x4<f64>,
    pub disparity_to_depth: Matrix3x4<f64>,
}

pub trait CalibrationSolver {
    /// Estimate intrinsics and distortion from object/image point pairs.
    /// `initial` carries the unit-focal-ratio guess.
    fn calibrate_camera(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points: &[CornerSet],
        image_size: (usize, usize),
        initial: CameraParams,
    ) -> Result<SolvedCamera, PipelineError>;

    /// Joint stereo solve with both intrinsics held fixed; only the
    /// extrinsics (R, T, E, F) are estimated.
    fn stereo_calibrate(
        &self,
        object_points: &[Vec<Point3<f64>>],
        left_points: &[CornerSet],
        right_points: &[CornerSet],
        left: &CameraParams,
        right: &CameraParams,
        image_size: (usize, usize),
    ) -> Result<StereoExtrinsics, PipelineError>;

    /// Calibrated rectification from the solved rotation/translation.
    fn stereo_rectify(
        &self,
        left: &CameraParams,
        right: &CameraParams,
        image_size: (usize, usize),
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> Result<RectifyTransforms, PipelineError>;

    /// Uncalibrated rectification: per-camera homographies from pooled
    /// point correspondences and the fundamental matrix.
    fn stereo_rectify_uncalibrated(
        &self,
        left_points: &[nalgebra::Point2<f64>],
        right_points: &[nalgebra::Point2<f64>],
        fundamental: &Matrix3<f64>,
        image_size: (usize, usize),
    ) -> Result<(Matrix3<f64>, Matrix3<f64>), PipelineError>;

    /// Re-estimate the fundamental matrix from pooled correspondences.
    fn find_fundamental(
        &self,
        left_points: &[nalgebra::Point2<f64>],
        right_points: &[nalgebra::Point2<f64>],
    ) -> Result<Matrix3<f64>, PipelineError>;
}
