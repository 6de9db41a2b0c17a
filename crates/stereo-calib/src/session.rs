//! Single-camera calibration session.
//!
//! The session drives the accumulation stage against one frame source,
//! hands the collected correspondences to the solver, persists the solved
//! intrinsics, and then replays the remaining frames as a live
//! original/undistorted side-by-side preview. Artifacts are written only
//! after the solve succeeds; a cancelled or failed session leaves the
//! output directory untouched.

use std::path::{Path, PathBuf};

use nalgebra::Matrix3;
use stereo_calib_core::{
    save_matrix, to_dynamic, Artifact, BoardGeometry, CalibrationData, CameraParams,
    DISTORTION_COEFFS, INTRINSIC_MATRIX,
};

use crate::capture::{next_frame_with_retry, FrameSource};
use crate::detect::PatternDetector;
use crate::display::{ControlEvent, Display};
use crate::error::PipelineError;
use crate::maps::{build_rectify_map, remap};
use crate::solver::CalibrationSolver;
use crate::stage::{
    handle_controls, run_accumulation, Accumulator, StageOutcome, DEFAULT_FRAME_SKIP,
};

const LIVE_WINDOW: &str = "Calibration";
const UNDISTORT_WINDOW: &str = "Undistorted";

pub struct CalibrationSession {
    data: CalibrationData,
    out_dir: PathBuf,
    frame_skip: usize,
    /// Rig-side suffix for the artifact file names; empty for a lone camera.
    suffix: String,
}

impl CalibrationSession {
    pub fn new(board: BoardGeometry, images_amount: usize, out_dir: &Path) -> Self {
        Self {
            data: CalibrationData::new(board, images_amount),
            out_dir: out_dir.to_path_buf(),
            frame_skip: DEFAULT_FRAME_SKIP,
            suffix: String::new(),
        }
    }

    pub fn with_frame_skip(mut self, frame_skip: usize) -> Self {
        self.frame_skip = frame_skip;
        self
    }

    /// Sessions run as one side of a stereo rig persist to suffixed file
    /// names ("_left" / "_right") so the two results do not collide.
    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.suffix = suffix.to_string();
        self
    }

    pub fn camera(&self) -> &CameraParams {
        &self.data.camera
    }

    pub fn artifact_path(&self, artifact: Artifact) -> PathBuf {
        self.out_dir.join(artifact.file_with_suffix(&self.suffix))
    }

    /// Accumulate, solve, persist, preview. Cancellation at any point
    /// before the solve leaves no artifacts behind.
    pub fn run<S, P, D, C>(
        &mut self,
        source: &mut S,
        detector: &mut P,
        display: &mut D,
        solver: &C,
    ) -> StageOutcome
    where
        S: FrameSource,
        P: PatternDetector,
        D: Display,
        C: CalibrationSolver,
    {
        self.data.capture_source = Some(source.name());
        let mut acc = Accumulator::new(self.data.board, self.data.images_amount);
        let outcome = run_accumulation(
            source,
            detector,
            display,
            &mut acc,
            self.frame_skip,
            LIVE_WINDOW,
        );
        if !outcome.is_completed() {
            return outcome;
        }

        if let Err(err) = self.solve_and_persist(&acc, solver) {
            log::error!("{err}");
            return StageOutcome::Failed(err);
        }

        match self.preview(source, display) {
            Ok(outcome) => outcome,
            Err(err) => StageOutcome::Failed(err),
        }
    }

    fn solve_and_persist<C: CalibrationSolver>(
        &mut self,
        acc: &Accumulator,
        solver: &C,
    ) -> Result<(), PipelineError> {
        let image_size = acc
            .image_size()
            .ok_or_else(|| PipelineError::Precondition("no frames were sampled".into()))?;

        let solved = solver.calibrate_camera(
            &acc.object_points(),
            acc.image_points(),
            image_size,
            CameraParams::initial_guess(),
        )?;
        log::info!(
            "intrinsics solved from {} views: fx={:.2} fy={:.2}",
            acc.successes(),
            solved.camera.intrinsic[(0, 0)],
            solved.camera.intrinsic[(1, 1)]
        );
        self.data.camera = solved.camera;
        self.data.rotations = solved.rotations;
        self.data.translations = solved.translations;

        save_matrix(
            &self.artifact_path(INTRINSIC_MATRIX),
            INTRINSIC_MATRIX.key,
            &to_dynamic(&self.data.camera.intrinsic),
        )?;
        save_matrix(
            &self.artifact_path(DISTORTION_COEFFS),
            DISTORTION_COEFFS.key,
            &to_dynamic(&self.data.camera.distortion),
        )?;
        Ok(())
    }

    /// Replay the remaining frames undistorted next to the originals.
    /// End of source is a normal end of the session, as is cancel.
    fn preview<S, D>(&self, source: &mut S, display: &mut D) -> Result<StageOutcome, PipelineError>
    where
        S: FrameSource,
        D: Display,
    {
        let mut tables: Option<(Vec<f32>, Vec<f32>, usize, usize)> = None;
        loop {
            let frame = match next_frame_with_retry(source)? {
                Some(frame) => frame,
                None => return Ok(StageOutcome::Completed),
            };

            if tables.is_none() {
                let size = (frame.width, frame.height);
                let (mx, my) = build_rectify_map(
                    &self.data.camera,
                    &Matrix3::identity(),
                    &self.data.camera.intrinsic,
                    size,
                )?;
                tables = Some((mx, my, size.0, size.1));
            }
            if let Some((map_x, map_y, w, h)) = &tables {
                let undistorted = remap(&frame, map_x, map_y, *w, *h);
                display.show(UNDISTORT_WINDOW, &frame.side_by_side(&undistorted));
            }

            if handle_controls(display) == ControlEvent::Cancel {
                return Ok(StageOutcome::Completed);
            }
        }
    }
}
