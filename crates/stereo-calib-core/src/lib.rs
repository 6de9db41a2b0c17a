//! Core types and persistence for the stereo calibration pipeline.
//!
//! This crate is intentionally small and purely geometric. It does *not*
//! depend on any concrete capture source, display, or numeric solver.

mod board;
mod data;
mod image;
mod logger;
mod storage;

pub use board::{object_point, object_points, BoardGeometry, CornerSet};
pub use data::{
    CalibrationData, CameraParams, DisparityMap, RectificationSet, RemapTables,
    StereoCalibrationData, StereoExtrinsics,
};
pub use image::{sample_bilinear, sample_bilinear_u8, GrayImage, GrayImageView};
pub use logger::init_with_level;
pub use storage::{
    load_fixed, load_matrix, save_matrices, save_matrix, to_dynamic, Artifact, MatrixDocument, StorageError, DISPARITY_MAP,
    DISTORTION_COEFFS, D2D_MAPPING_MATRIX, ESSENTIAL_MATRIX, FUNDAMENTAL_MATRIX, INTRINSIC_MATRIX,
    PROJECTION_MATRIX_1, PROJECTION_MATRIX_2, RECTIFY_MAP_X1, RECTIFY_MAP_X2, RECTIFY_MAP_Y1,
    RECTIFY_MAP_Y2, RECT_TRANSFORM_1, RECT_TRANSFORM_2, STEREO_ROTATION, STEREO_TRANSLATION,
};
