use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// Geometry of a planar calibration target: an inner-corner grid of
/// `width x height` points with a known square size.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardGeometry {
    pub width: usize,
    pub height: usize,
    pub square_size: f64,
}

impl BoardGeometry {
    pub fn new(width: usize, height: usize, square_size: f64) -> Self {
        Self {
            width,
            height,
            square_size,
        }
    }

    /// Number of detectable pattern points, always `width * height`.
    #[inline]
    pub fn points_on_board(&self) -> usize {
        self.width * self.height
    }
}

/// Ordered 2D corner detections for a single frame.
///
/// A corner set is only usable for calibration when it is *complete*:
/// its length matches the number of points on the board.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CornerSet {
    pub points: Vec<Point2<f64>>,
}

impl CornerSet {
    pub fn new(points: Vec<Point2<f64>>) -> Self {
        Self { points }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// A detection is acceptable iff it covers the full board.
    #[inline]
    pub fn is_complete(&self, board: &BoardGeometry) -> bool {
        self.len() == board.points_on_board()
    }
}

/// Deterministic 3D board coordinate for corner index `j`.
///
/// The board is planar, so z = 0 for every accepted view.
#[inline]
pub fn object_point(board: &BoardGeometry, j: usize) -> Point3<f64> {
    Point3::new(
        (j / board.width) as f64 * board.square_size,
        (j % board.width) as f64 * board.square_size,
        0.0,
    )
}

/// The full object-point grid, identical for every accepted view.
pub fn object_points(board: &BoardGeometry) -> Vec<Point3<f64>> {
    (0..board.points_on_board())
        .map(|j| object_point(board, j))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn points_on_board_is_product() {
        for (w, h) in [(1usize, 1usize), (9, 6), (7, 5), (13, 2)] {
            let board = BoardGeometry::new(w, h, 1.0);
            assert_eq!(board.points_on_board(), w * h);
        }
    }

    #[test]
    fn object_point_formula() {
        let board = BoardGeometry::new(9, 6, 2.5);
        for j in 0..board.points_on_board() {
            let p = object_point(&board, j);
            assert_relative_eq!(p.x, (j / 9) as f64 * 2.5);
            assert_relative_eq!(p.y, (j % 9) as f64 * 2.5);
            assert_relative_eq!(p.z, 0.0);
        }
    }

    #[test]
    fn object_grid_is_deterministic() {
        let board = BoardGeometry::new(4, 3, 1.0);
        assert_eq!(object_points(&board), object_points(&board));
        assert_eq!(object_points(&board).len(), 12);
    }

    #[test]
    fn completeness_requires_exact_count() {
        let board = BoardGeometry::new(3, 2, 1.0);
        let full = CornerSet::new(vec![Point2::new(0.0, 0.0); 6]);
        let short = CornerSet::new(vec![Point2::new(0.0, 0.0); 5]);
        let long = CornerSet::new(vec![Point2::new(0.0, 0.0); 7]);
        assert!(full.is_complete(&board));
        assert!(!short.is_complete(&board));
        assert!(!long.is_complete(&board));
    }
}
