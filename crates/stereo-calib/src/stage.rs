//! Shared corner detection and accumulation stage.
//!
//! One loop iteration (a *tick*) renders the live frame, polls the
//! controls, and on every Kth tick runs pattern detection. Accepted
//! detections append a corner set together with the matching object-point
//! grid. The stage ends when the success count reaches its target, when
//! the user cancels, or when the source fails before the target is met.

use nalgebra::Point3;
use stereo_calib_core::{object_points, BoardGeometry, CornerSet, GrayImage};

use crate::capture::{next_frame_with_retry, FrameSource};
use crate::detect::PatternDetector;
use crate::display::{ControlEvent, Display};
use crate::error::PipelineError;

/// Ticks between detection attempts; gives the operator time to move the
/// board while the live view keeps refreshing.
pub const DEFAULT_FRAME_SKIP: usize = 20;

/// Explicit stage result, checked by the caller. Cancellation is a value,
/// not an unwind, so a cancelled stage never rewrites persisted artifacts.
#[derive(Debug)]
pub enum StageOutcome {
    Completed,
    Cancelled,
    Failed(PipelineError),
}

impl StageOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StageOutcome::Completed)
    }
}

/// Collected correspondences for one camera.
#[derive(Clone, Debug)]
pub struct Accumulator {
    board: BoardGeometry,
    target: usize,
    /// Object-point grid, generated once and reused for every view.
    object_grid: Vec<Point3<f64>>,
    image_points: Vec<CornerSet>,
    image_size: Option<(usize, usize)>,
}

impl Accumulator {
    pub fn new(board: BoardGeometry, target: usize) -> Self {
        Self {
            board,
            target,
            object_grid: object_points(&board),
            image_points: Vec::new(),
            image_size: None,
        }
    }

    /// Record the frame dimensions for the later solve step.
    pub fn note_frame(&mut self, frame: &GrayImage) {
        self.image_size = Some((frame.width, frame.height));
    }

    pub fn image_size(&self) -> Option<(usize, usize)> {
        self.image_size
    }

    /// Accept a detection iff its corner count exactly matches the board.
    /// Any other length is discarded without incrementing the counter.
    pub fn accept(&mut self, corners: CornerSet) -> bool {
        if !corners.is_complete(&self.board) {
            log::debug!(
                "discarding detection with {} corners (board has {})",
                corners.len(),
                self.board.points_on_board()
            );
            return false;
        }
        self.image_points.push(corners);
        log::info!("successes: {}/{}", self.successes(), self.target);
        true
    }

    pub fn successes(&self) -> usize {
        self.image_points.len()
    }

    pub fn is_done(&self) -> bool {
        self.successes() >= self.target
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn board(&self) -> &BoardGeometry {
        &self.board
    }

    pub fn image_points(&self) -> &[CornerSet] {
        &self.image_points
    }

    /// One object-point set per accepted view, all identical.
    pub fn object_points(&self) -> Vec<Vec<Point3<f64>>> {
        vec![self.object_grid.clone(); self.image_points.len()]
    }
}

/// Drive a single-camera accumulation loop until `acc` reaches its target.
pub fn run_accumulation<S, P, D>(
    source: &mut S,
    detector: &mut P,
    display: &mut D,
    acc: &mut Accumulator,
    frame_skip: usize,
    window: &str,
) -> StageOutcome
where
    S: FrameSource,
    P: PatternDetector,
    D: Display,
{
    let skip = frame_skip.max(1);
    let mut tick = 0usize;
    while !acc.is_done() {
        let frame = match next_frame_with_retry(source) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let err = PipelineError::FrameUnavailable(Some(source.name()));
                log::error!("source exhausted at {}/{} views", acc.successes(), acc.target());
                return StageOutcome::Failed(err);
            }
            Err(err) => {
                log::error!("{err}");
                return StageOutcome::Failed(err);
            }
        };

        acc.note_frame(&frame);
        display.show(window, &frame);

        if tick % skip == 0 {
            if let Some(corners) = detect_exact(detector, &frame, acc.board()) {
                acc.accept(corners);
            }
        }
        tick += 1;

        if handle_controls(display) == ControlEvent::Cancel {
            log::warn!("accumulation cancelled at {} successes", acc.successes());
            return StageOutcome::Cancelled;
        }
    }
    StageOutcome::Completed
}

/// Detection with the exact-count acceptance rule applied: a "found"
/// result with a mismatched corner count is treated as not found.
pub(crate) fn detect_exact<P: PatternDetector>(
    detector: &mut P,
    frame: &GrayImage,
    board: &BoardGeometry,
) -> Option<CornerSet> {
    detector
        .detect(frame, board)
        .filter(|corners| corners.is_complete(board))
}

/// One control poll per tick: pause blocks until resumed or cancelled.
pub(crate) fn handle_controls<D: Display>(display: &mut D) -> ControlEvent {
    match display.poll(15) {
        ControlEvent::Pause => display.wait_unpause(),
        event => event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MemorySource;
    use crate::display::testing::ScriptedDisplay;
    use crate::display::NullDisplay;
    use nalgebra::Point2;

    fn board() -> BoardGeometry {
        BoardGeometry::new(2, 2, 1.0)
    }

    fn full_set() -> CornerSet {
        CornerSet::new(vec![Point2::new(1.0, 1.0); 4])
    }

    fn frames(n: usize) -> Vec<GrayImage> {
        (0..n).map(|_| GrayImage::new(4, 4)).collect()
    }

    #[test]
    fn completes_with_exactly_target_views() {
        let mut source = MemorySource::new(frames(10));
        let mut display = NullDisplay;
        let mut acc = Accumulator::new(board(), 3);
        let mut detector =
            |_: &GrayImage, _: &BoardGeometry| -> Option<CornerSet> { Some(full_set()) };

        let outcome = run_accumulation(&mut source, &mut detector, &mut display, &mut acc, 1, "w");
        assert!(outcome.is_completed());
        assert_eq!(acc.successes(), 3);
        assert_eq!(acc.object_points().len(), 3);
    }

    #[test]
    fn mismatched_corner_count_is_not_accumulated() {
        let mut source = MemorySource::new(frames(4));
        let mut display = NullDisplay;
        let mut acc = Accumulator::new(board(), 2);
        // "Found" with one corner short: must never count.
        let mut detector = |_: &GrayImage, _: &BoardGeometry| -> Option<CornerSet> {
            Some(CornerSet::new(vec![Point2::new(0.0, 0.0); 3]))
        };

        let outcome = run_accumulation(&mut source, &mut detector, &mut display, &mut acc, 1, "w");
        assert!(matches!(outcome, StageOutcome::Failed(_)));
        assert_eq!(acc.successes(), 0);
    }

    #[test]
    fn cancel_stops_mid_accumulation() {
        let mut source = MemorySource::new(frames(10));
        let mut display = ScriptedDisplay::new(vec![
            ControlEvent::None,
            ControlEvent::None,
            ControlEvent::Cancel,
        ]);
        let mut acc = Accumulator::new(board(), 5);
        let mut detector =
            |_: &GrayImage, _: &BoardGeometry| -> Option<CornerSet> { Some(full_set()) };

        let outcome = run_accumulation(&mut source, &mut detector, &mut display, &mut acc, 1, "w");
        assert!(matches!(outcome, StageOutcome::Cancelled));
        assert_eq!(acc.successes(), 3);
        assert!(acc.successes() < acc.target());
    }

    #[test]
    fn pause_blocks_until_resumed() {
        let mut source = MemorySource::new(frames(6));
        // Pause on the first tick, resume, then run to completion.
        let mut display = ScriptedDisplay::new(vec![ControlEvent::Pause, ControlEvent::Pause]);
        let mut acc = Accumulator::new(board(), 2);
        let mut detector =
            |_: &GrayImage, _: &BoardGeometry| -> Option<CornerSet> { Some(full_set()) };

        let outcome = run_accumulation(&mut source, &mut detector, &mut display, &mut acc, 1, "w");
        assert!(outcome.is_completed());
    }

    #[test]
    fn source_exhaustion_before_target_fails() {
        let mut source = MemorySource::new(frames(2));
        let mut display = NullDisplay;
        let mut acc = Accumulator::new(board(), 5);
        let mut detector = |_: &GrayImage, _: &BoardGeometry| -> Option<CornerSet> { None };

        let outcome = run_accumulation(&mut source, &mut detector, &mut display, &mut acc, 1, "w");
        assert!(matches!(
            outcome,
            StageOutcome::Failed(PipelineError::FrameUnavailable(_))
        ));
    }

    #[test]
    fn frame_skip_samples_every_kth_tick() {
        let mut source = MemorySource::new(frames(8));
        let mut display = NullDisplay;
        let mut acc = Accumulator::new(board(), 8);
        let mut calls = 0usize;
        let mut detector = |_: &GrayImage, _: &BoardGeometry| -> Option<CornerSet> {
            calls += 1;
            Some(full_set())
        };

        // skip=4 over 8 frames: detection fires on ticks 0 and 4 only,
        // so the stage runs out of frames before reaching its target.
        let outcome = run_accumulation(&mut source, &mut detector, &mut display, &mut acc, 4, "w");
        assert!(matches!(outcome, StageOutcome::Failed(_)));
        assert_eq!(calls, 2);
        assert_eq!(acc.successes(), 2);
    }
}
