use nalgebra::{DMatrix, Matrix3, Matrix3x4, Vector3, Vector5};
use serde::{Deserialize, Serialize};

use crate::board::BoardGeometry;

/// Intrinsic parameters of one camera: 3x3 projection matrix and the
/// five-coefficient distortion vector (k1, k2, p1, p2, k3).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraParams {
    pub intrinsic: Matrix3<f64>,
    pub distortion: Vector5<f64>,
}

impl CameraParams {
    /// Initial guess handed to the intrinsic solver: unit focal-length
    /// ratio (fx = fy = 1), every other entry default.
    pub fn initial_guess() -> Self {
        let mut intrinsic = Matrix3::zeros();
        intrinsic[(0, 0)] = 1.0;
        intrinsic[(1, 1)] = 1.0;
        Self {
            intrinsic,
            distortion: Vector5::zeros(),
        }
    }

    /// Identity intrinsic / zero distortion placeholder used by the stereo
    /// session before the persisted single-camera results are loaded.
    pub fn identity() -> Self {
        Self {
            intrinsic: Matrix3::identity(),
            distortion: Vector5::zeros(),
        }
    }
}

/// Per-session calibration state for a single camera: board geometry,
/// target view count and the solved results.
#[derive(Clone, Debug)]
pub struct CalibrationData {
    pub board: BoardGeometry,
    pub images_amount: usize,
    pub capture_source: Option<String>,
    pub camera: CameraParams,
    /// Per-view rotation vectors, filled by the solve step.
    pub rotations: Vec<Vector3<f64>>,
    /// Per-view translation vectors, filled by the solve step.
    pub translations: Vec<Vector3<f64>>,
}

impl CalibrationData {
    pub fn new(board: BoardGeometry, images_amount: usize) -> Self {
        Self {
            board,
            images_amount,
            capture_source: None,
            camera: CameraParams::initial_guess(),
            rotations: Vec::new(),
            translations: Vec::new(),
        }
    }
}

/// Extrinsic results of the joint stereo solve, relating the two cameras.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StereoExtrinsics {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub essential: Matrix3<f64>,
    pub fundamental: Matrix3<f64>,
}

/// Dense per-pixel remap lookup tables for a rectified stereo pair.
#[derive(Clone, Debug, PartialEq)]
pub struct RemapTables {
    pub width: usize,
    pub height: usize,
    pub left_x: Vec<f32>,
    pub left_y: Vec<f32>,
    pub right_x: Vec<f32>,
    pub right_y: Vec<f32>,
}

impl RemapTables {
    pub fn new(width: usize, height: usize) -> Self {
        let n = width * height;
        Self {
            width,
            height,
            left_x: vec![0.0; n],
            left_y: vec![0.0; n],
            right_x: vec![0.0; n],
            right_y: vec![0.0; n],
        }
    }
}

/// Everything one rectification strategy produces: per-camera transforms,
/// projection matrices, the optional disparity-to-depth mapping and the
/// dense remap tables derived from them.
#[derive(Clone, Debug)]
pub struct RectificationSet {
    pub rect_transform_1: Matrix3<f64>,
    pub rect_transform_2: Matrix3<f64>,
    pub projection_1: Matrix3x4<f64>,
    pub projection_2: Matrix3x4<f64>,
    /// Only the calibrated strategy yields a disparity-to-depth mapping.
    pub disparity_to_depth: Option<Matrix3x4<f64>>,
    pub maps: RemapTables,
}

/// Paired calibration results for a stereo rig. Composes two cameras
/// instead of extending the single-camera data.
#[derive(Clone, Debug)]
pub struct StereoCalibrationData {
    pub board: BoardGeometry,
    pub images_amount: usize,
    pub left: CameraParams,
    pub right: CameraParams,
    pub extrinsics: Option<StereoExtrinsics>,
    pub rectification: Option<RectificationSet>,
}

impl StereoCalibrationData {
    pub fn new(board: BoardGeometry, images_amount: usize) -> Self {
        Self {
            board,
            images_amount,
            left: CameraParams::identity(),
            right: CameraParams::identity(),
            extrinsics: None,
            rectification: None,
        }
    }
}

/// Signed disparity map aligned to the rectified image size. Persisted
/// independently of the remap tables that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct DisparityMap {
    pub width: usize,
    pub height: usize,
    pub data: Vec<i16>,
}

impl DisparityMap {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> i16 {
        self.data[y * self.width + x]
    }

    /// Normalize the signed map into a displayable 8-bit range.
    pub fn to_gray(&self) -> crate::GrayImage {
        let (mut lo, mut hi) = (i16::MAX, i16::MIN);
        for &d in &self.data {
            lo = lo.min(d);
            hi = hi.max(d);
        }
        let span = (i32::from(hi) - i32::from(lo)).max(1) as f32;
        let data = self
            .data
            .iter()
            .map(|&d| (255.0 * (i32::from(d) - i32::from(lo)) as f32 / span) as u8)
            .collect();
        crate::GrayImage {
            width: self.width,
            height: self.height,
            data,
        }
    }

    pub fn to_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_iterator(
            self.height,
            self.width,
            self.data.iter().map(|&d| f64::from(d)),
        )
    }

    pub fn from_matrix(m: &DMatrix<f64>) -> Self {
        Self {
            width: m.ncols(),
            height: m.nrows(),
            data: m.transpose().iter().map(|&v| v as i16).collect(),
        }
    }
}
