//! Stereo calibration session.
//!
//! Accumulates paired views from two synchronized sources, runs the joint
//! extrinsic solve with both cameras' intrinsics held fixed, derives one
//! of two rectification strategies, persists every stereo artifact and
//! finishes with a live rectified preview (reference lines plus a rough
//! disparity map).

use std::path::{Path, PathBuf};

use nalgebra::{DMatrix, Matrix3, Matrix3x4, Point2, Point3};
use stereo_calib_core::{
    load_fixed, object_points, save_matrices, save_matrix, to_dynamic, BoardGeometry,
    CameraParams, CornerSet, GrayImage, RectificationSet, RemapTables, StereoCalibrationData,
    StereoExtrinsics, D2D_MAPPING_MATRIX, DISTORTION_COEFFS, ESSENTIAL_MATRIX,
    FUNDAMENTAL_MATRIX, INTRINSIC_MATRIX, PROJECTION_MATRIX_1, PROJECTION_MATRIX_2,
    RECTIFY_MAP_X1, RECTIFY_MAP_X2, RECTIFY_MAP_Y1, RECTIFY_MAP_Y2, RECT_TRANSFORM_1,
    RECT_TRANSFORM_2, STEREO_ROTATION, STEREO_TRANSLATION,
};

use crate::capture::{next_frame_with_retry, FrameSource};
use crate::detect::PatternDetector;
use crate::display::{ControlEvent, Display};
use crate::disparity::BlockMatcher;
use crate::epipolar::average_calibration_error;
use crate::error::PipelineError;
use crate::maps::{build_rectify_map, remap, side_by_side_with_lines};
use crate::solver::CalibrationSolver;
use crate::stage::{detect_exact, handle_controls, StageOutcome, DEFAULT_FRAME_SKIP};

const LEFT_WINDOW: &str = "Left";
const RIGHT_WINDOW: &str = "Right";
const RECTIFIED_WINDOW: &str = "Rectified";
const PREVIEW_DISPARITY_WINDOW: &str = "Disparity";

/// How the rectification transforms are obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RectificationStrategy {
    /// Bouguet's method from the solved rotation and translation. Yields
    /// a disparity-to-depth mapping alongside the transforms.
    Calibrated,
    /// Hartley's method from pooled point correspondences. Works without
    /// solved extrinsics but yields no disparity-to-depth mapping.
    Uncalibrated {
        /// Re-estimate the fundamental matrix from the pooled points
        /// instead of reusing the one from the joint solve.
        reestimate_fundamental: bool,
    },
}

/// Correspondences collected simultaneously from both sides. A view
/// counts only when both frames of the pair yield a complete corner set.
struct PairedAccumulator {
    board: BoardGeometry,
    target: usize,
    object_grid: Vec<Point3<f64>>,
    left: Vec<CornerSet>,
    right: Vec<CornerSet>,
    image_size: Option<(usize, usize)>,
}

impl PairedAccumulator {
    fn new(board: BoardGeometry, target: usize) -> Self {
        Self {
            board,
            target,
            object_grid: object_points(&board),
            left: Vec::new(),
            right: Vec::new(),
            image_size: None,
        }
    }

    fn accept(&mut self, left: CornerSet, right: CornerSet) {
        self.left.push(left);
        self.right.push(right);
        log::info!("paired successes: {}/{}", self.successes(), self.target);
    }

    fn successes(&self) -> usize {
        self.left.len()
    }

    fn is_done(&self) -> bool {
        self.successes() >= self.target
    }

    fn object_points(&self) -> Vec<Vec<Point3<f64>>> {
        vec![self.object_grid.clone(); self.left.len()]
    }

    /// All accepted corners from every view flattened into two parallel
    /// point lists, as consumed by the uncalibrated rectification.
    fn pooled_points(&self) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
        let flatten = |views: &[CornerSet]| {
            views
                .iter()
                .flat_map(|set| set.points.iter().copied())
                .collect::<Vec<_>>()
        };
        (flatten(&self.left), flatten(&self.right))
    }
}

pub struct StereoCalibrationSession {
    data: StereoCalibrationData,
    strategy: RectificationStrategy,
    out_dir: PathBuf,
    frame_skip: usize,
}

impl StereoCalibrationSession {
    pub fn new(
        board: BoardGeometry,
        images_amount: usize,
        strategy: RectificationStrategy,
        out_dir: &Path,
    ) -> Self {
        Self {
            data: StereoCalibrationData::new(board, images_amount),
            strategy,
            out_dir: out_dir.to_path_buf(),
            frame_skip: DEFAULT_FRAME_SKIP,
        }
    }

    pub fn with_frame_skip(mut self, frame_skip: usize) -> Self {
        self.frame_skip = frame_skip;
        self
    }

    pub fn cameras(&self) -> (&CameraParams, &CameraParams) {
        (&self.data.left, &self.data.right)
    }

    pub fn extrinsics(&self) -> Option<&StereoExtrinsics> {
        self.data.extrinsics.as_ref()
    }

    /// Run the whole stereo stage: frame-count check, intrinsics pickup,
    /// paired accumulation, joint solve, rectification, persistence and
    /// the rectified preview.
    pub fn run<L, R, P, D, C>(
        &mut self,
        left: &mut L,
        right: &mut R,
        detector: &mut P,
        display: &mut D,
        solver: &C,
    ) -> StageOutcome
    where
        L: FrameSource,
        R: FrameSource,
        P: PatternDetector,
        D: Display,
        C: CalibrationSolver,
    {
        if let (Some(l), Some(r)) = (left.frame_count(), right.frame_count()) {
            if l != r {
                return StageOutcome::Failed(PipelineError::FrameCountMismatch {
                    left: l,
                    right: r,
                });
            }
        }

        if let Err(err) = self.load_initial_cameras() {
            return StageOutcome::Failed(err);
        }

        let mut acc = PairedAccumulator::new(self.data.board, self.data.images_amount);
        let outcome = self.accumulate_pairs(left, right, detector, display, &mut acc);
        if !outcome.is_completed() {
            return outcome;
        }

        if let Err(err) = self.solve_and_persist(&acc, solver) {
            log::error!("{err}");
            return StageOutcome::Failed(err);
        }

        match self.preview(left, right, display) {
            Ok(outcome) => outcome,
            Err(err) => StageOutcome::Failed(err),
        }
    }

    /// Pick up previously persisted per-side intrinsics, if any. The
    /// joint solve holds these fixed, so starting from a prior
    /// single-camera calibration run improves the extrinsic estimates.
    fn load_initial_cameras(&mut self) -> Result<(), PipelineError> {
        for (suffix, camera) in [
            ("_left", &mut self.data.left),
            ("_right", &mut self.data.right),
        ] {
            let intrinsic_path = self.out_dir.join(INTRINSIC_MATRIX.file_with_suffix(suffix));
            if !intrinsic_path.exists() {
                log::warn!(
                    "no persisted intrinsics for side {suffix:?}, starting from identity"
                );
                continue;
            }
            camera.intrinsic = load_fixed(&intrinsic_path, INTRINSIC_MATRIX.key)?;
            let distortion_path = self
                .out_dir
                .join(DISTORTION_COEFFS.file_with_suffix(suffix));
            camera.distortion = load_fixed(&distortion_path, DISTORTION_COEFFS.key)?;
            log::info!("loaded persisted intrinsics for side {suffix:?}");
        }
        Ok(())
    }

    fn accumulate_pairs<L, R, P, D>(
        &self,
        left: &mut L,
        right: &mut R,
        detector: &mut P,
        display: &mut D,
        acc: &mut PairedAccumulator,
    ) -> StageOutcome
    where
        L: FrameSource,
        R: FrameSource,
        P: PatternDetector,
        D: Display,
    {
        let skip = self.frame_skip.max(1);
        let mut tick = 0usize;
        while !acc.is_done() {
            let pair = match grab_pair(left, right) {
                Ok(Some(pair)) => pair,
                Ok(None) => {
                    log::error!(
                        "sources exhausted at {}/{} paired views",
                        acc.successes(),
                        acc.target
                    );
                    return StageOutcome::Failed(PipelineError::FrameUnavailable(None));
                }
                Err(err) => return StageOutcome::Failed(err),
            };
            acc.image_size = Some((pair.0.width, pair.0.height));

            display.show(LEFT_WINDOW, &pair.0);
            display.show(RIGHT_WINDOW, &pair.1);

            if tick % skip == 0 {
                let found_left = detect_exact(detector, &pair.0, &acc.board);
                let found_right = detect_exact(detector, &pair.1, &acc.board);
                // One-sided detections are dropped whole; the solver needs
                // the same view seen from both cameras.
                if let (Some(l), Some(r)) = (found_left, found_right) {
                    acc.accept(l, r);
                }
            }
            tick += 1;

            if handle_controls(display) == ControlEvent::Cancel {
                log::warn!("stereo accumulation cancelled at {} pairs", acc.successes());
                return StageOutcome::Cancelled;
            }
        }
        StageOutcome::Completed
    }

    fn solve_and_persist<C: CalibrationSolver>(
        &mut self,
        acc: &PairedAccumulator,
        solver: &C,
    ) -> Result<(), PipelineError> {
        let image_size = acc
            .image_size
            .ok_or_else(|| PipelineError::Precondition("no frames were sampled".into()))?;

        let extrinsics = solver.stereo_calibrate(
            &acc.object_points(),
            &acc.left,
            &acc.right,
            &self.data.left,
            &self.data.right,
            image_size,
        )?;
        let avg_error = average_calibration_error(
            &acc.left,
            &acc.right,
            &self.data.left,
            &self.data.right,
            &extrinsics.fundamental,
        );
        log::info!("average epipolar error: {avg_error:.4}");
        self.data.extrinsics = Some(extrinsics);

        let rectification = self.rectify(acc, solver, &extrinsics, image_size)?;
        self.persist(&extrinsics, &rectification)?;
        self.data.rectification = Some(rectification);
        Ok(())
    }

    fn rectify<C: CalibrationSolver>(
        &self,
        acc: &PairedAccumulator,
        solver: &C,
        extrinsics: &StereoExtrinsics,
        image_size: (usize, usize),
    ) -> Result<RectificationSet, PipelineError> {
        let (r1, r2, p1, p2, disparity_to_depth) = match self.strategy {
            RectificationStrategy::Calibrated => {
                let t = solver.stereo_rectify(
                    &self.data.left,
                    &self.data.right,
                    image_size,
                    &extrinsics.rotation,
                    &extrinsics.translation,
                )?;
                (t.r1, t.r2, t.p1, t.p2, Some(t.disparity_to_depth))
            }
            RectificationStrategy::Uncalibrated {
                reestimate_fundamental,
            } => {
                let (left_points, right_points) = acc.pooled_points();
                let fundamental = if reestimate_fundamental {
                    solver.find_fundamental(&left_points, &right_points)?
                } else {
                    extrinsics.fundamental
                };
                let (h1, h2) = solver.stereo_rectify_uncalibrated(
                    &left_points,
                    &right_points,
                    &fundamental,
                    image_size,
                )?;
                let r1 = homography_to_rotation(&h1, &self.data.left.intrinsic)?;
                let r2 = homography_to_rotation(&h2, &self.data.right.intrinsic)?;
                (
                    r1,
                    r2,
                    padded_projection(&self.data.left.intrinsic),
                    padded_projection(&self.data.right.intrinsic),
                    None,
                )
            }
        };

        let proj1 = p1.fixed_view::<3, 3>(0, 0).into_owned();
        let proj2 = p2.fixed_view::<3, 3>(0, 0).into_owned();
        let (left_x, left_y) = build_rectify_map(&self.data.left, &r1, &proj1, image_size)?;
        let (right_x, right_y) = build_rectify_map(&self.data.right, &r2, &proj2, image_size)?;

        Ok(RectificationSet {
            rect_transform_1: r1,
            rect_transform_2: r2,
            projection_1: p1,
            projection_2: p2,
            disparity_to_depth,
            maps: RemapTables {
                width: image_size.0,
                height: image_size.1,
                left_x,
                left_y,
                right_x,
                right_y,
            },
        })
    }

    fn persist(
        &self,
        extrinsics: &StereoExtrinsics,
        rect: &RectificationSet,
    ) -> Result<(), PipelineError> {
        let path = |file: &str| self.out_dir.join(file);

        save_matrix(
            &path(STEREO_ROTATION.file),
            STEREO_ROTATION.key,
            &to_dynamic(&extrinsics.rotation),
        )?;
        save_matrix(
            &path(STEREO_TRANSLATION.file),
            STEREO_TRANSLATION.key,
            &to_dynamic(&extrinsics.translation),
        )?;
        save_matrix(
            &path(ESSENTIAL_MATRIX.file),
            ESSENTIAL_MATRIX.key,
            &to_dynamic(&extrinsics.essential),
        )?;
        save_matrix(
            &path(FUNDAMENTAL_MATRIX.file),
            FUNDAMENTAL_MATRIX.key,
            &to_dynamic(&extrinsics.fundamental),
        )?;
        save_matrices(
            &path(RECT_TRANSFORM_1.file),
            &[
                (RECT_TRANSFORM_1.key, to_dynamic(&rect.rect_transform_1)),
                (RECT_TRANSFORM_2.key, to_dynamic(&rect.rect_transform_2)),
            ],
        )?;
        save_matrices(
            &path(PROJECTION_MATRIX_1.file),
            &[
                (PROJECTION_MATRIX_1.key, to_dynamic(&rect.projection_1)),
                (PROJECTION_MATRIX_2.key, to_dynamic(&rect.projection_2)),
            ],
        )?;
        if let Some(q) = &rect.disparity_to_depth {
            save_matrix(&path(D2D_MAPPING_MATRIX.file), D2D_MAPPING_MATRIX.key, &to_dynamic(q))?;
        }

        let maps = &rect.maps;
        let table = |v: &[f32]| {
            DMatrix::from_row_iterator(maps.height, maps.width, v.iter().map(|&x| f64::from(x)))
        };
        save_matrices(
            &path(RECTIFY_MAP_X1.file),
            &[
                (RECTIFY_MAP_X1.key, table(&maps.left_x)),
                (RECTIFY_MAP_Y1.key, table(&maps.left_y)),
                (RECTIFY_MAP_X2.key, table(&maps.right_x)),
                (RECTIFY_MAP_Y2.key, table(&maps.right_y)),
            ],
        )?;
        log::info!("stereo artifacts saved to {}", self.out_dir.display());
        Ok(())
    }

    /// Re-walks the paired frames from the start and shows a rectified
    /// side-by-side preview with reference lines, plus a rough
    /// default-parameter disparity map of every pair. End of either
    /// source ends the session normally.
    fn preview<L, R, D>(
        &self,
        left: &mut L,
        right: &mut R,
        display: &mut D,
    ) -> Result<StageOutcome, PipelineError>
    where
        L: FrameSource,
        R: FrameSource,
        D: Display,
    {
        let rect = self
            .data
            .rectification
            .as_ref()
            .ok_or_else(|| PipelineError::Precondition("rectification not computed".into()))?;
        // Accumulation has consumed the sources; rewind both for the walk.
        left.reopen()?;
        right.reopen()?;
        let maps = &rect.maps;
        let matcher = BlockMatcher::default();

        loop {
            let (lf, rf) = match grab_pair(left, right)? {
                Some(pair) => pair,
                None => return Ok(StageOutcome::Completed),
            };
            let rect_left = remap(&lf, &maps.left_x, &maps.left_y, maps.width, maps.height);
            let rect_right = remap(&rf, &maps.right_x, &maps.right_y, maps.width, maps.height);

            display.show(
                RECTIFIED_WINDOW,
                &side_by_side_with_lines(&rect_left, &rect_right),
            );
            display.show(
                PREVIEW_DISPARITY_WINDOW,
                &matcher.compute(&rect_left, &rect_right).to_gray(),
            );

            if handle_controls(display) == ControlEvent::Cancel {
                return Ok(StageOutcome::Completed);
            }
        }
    }
}

/// Grab one frame from each side; `None` as soon as either side runs out.
fn grab_pair<L: FrameSource, R: FrameSource>(
    left: &mut L,
    right: &mut R,
) -> Result<Option<(GrayImage, GrayImage)>, PipelineError> {
    let lf = match next_frame_with_retry(left)? {
        Some(frame) => frame,
        None => return Ok(None),
    };
    let rf = match next_frame_with_retry(right)? {
        Some(frame) => frame,
        None => return Ok(None),
    };
    Ok(Some((lf, rf)))
}

/// Map a rectifying homography into camera space: R = K^-1 H K.
fn homography_to_rotation(
    h: &Matrix3<f64>,
    intrinsic: &Matrix3<f64>,
) -> Result<Matrix3<f64>, PipelineError> {
    let inv = intrinsic
        .try_inverse()
        .ok_or_else(|| PipelineError::Solver("intrinsic matrix is singular".into()))?;
    Ok(inv * h * intrinsic)
}

/// The uncalibrated path keeps the original camera matrix as the
/// rectified projection, with a zero translation column.
fn padded_projection(intrinsic: &Matrix3<f64>) -> Matrix3x4<f64> {
    let mut p = Matrix3x4::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(intrinsic);
    p
}
