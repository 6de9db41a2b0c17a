//! Pattern detection boundary.

use stereo_calib_core::{BoardGeometry, CornerSet, GrayImage};

/// Detector collaborator: finds the board's corner grid in a frame and
/// refines it to sub-pixel accuracy.
///
/// Implementations return `None` when the pattern is not found. A `Some`
/// whose corner count differs from `board.points_on_board()` is treated by
/// the accumulation stage as not found; only exact-count detections are
/// accepted.
pub trait PatternDetector {
    fn detect(&mut self, image: &GrayImage, board: &BoardGeometry) -> Option<CornerSet>;
}

impl<F> PatternDetector for F
where
    F: FnMut(&GrayImage, &BoardGeometry) -> Option<CornerSet>,
{
    fn detect(&mut self, image: &GrayImage, board: &BoardGeometry) -> Option<CornerSet> {
        self(image, board)
    }
}
