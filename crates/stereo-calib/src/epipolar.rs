//! Epipolar geometry helpers and the stereo calibration quality metric.

use nalgebra::{Matrix3, Point2, Vector3};
use stereo_calib_core::{CameraParams, CornerSet};

/// Undistort 2D points and reproject them through the intrinsic matrix,
/// so the output stays in pixel coordinates.
///
/// Inverts the 5-coefficient Brown-Conrady model (k1, k2, p1, p2, k3) by
/// fixed-point iteration on the normalized coordinates.
pub fn undistort_points(points: &[Point2<f64>], camera: &CameraParams) -> Vec<Point2<f64>> {
    let fx = camera.intrinsic[(0, 0)];
    let fy = camera.intrinsic[(1, 1)];
    let cx = camera.intrinsic[(0, 2)];
    let cy = camera.intrinsic[(1, 2)];
    let (k1, k2, p1, p2, k3) = (
        camera.distortion[0],
        camera.distortion[1],
        camera.distortion[2],
        camera.distortion[3],
        camera.distortion[4],
    );

    points
        .iter()
        .map(|p| {
            let xd = (p.x - cx) / fx;
            let yd = (p.y - cy) / fy;
            let (mut x, mut y) = (xd, yd);
            for _ in 0..5 {
                let r2 = x * x + y * y;
                let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
                let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
                x = (xd - dx) / radial;
                y = (yd - dy) / radial;
            }
            Point2::new(fx * x + cx, fy * y + cy)
        })
        .collect()
}

/// Epipolar line in the *other* image for a point observed in image
/// `which` (1 = left, 2 = right), normalized so that a^2 + b^2 = 1.
pub fn epipolar_line(fundamental: &Matrix3<f64>, point: Point2<f64>, which: u8) -> Vector3<f64> {
    let p = Vector3::new(point.x, point.y, 1.0);
    let line = match which {
        1 => fundamental * p,
        _ => fundamental.transpose() * p,
    };
    let norm = (line.x * line.x + line.y * line.y).sqrt();
    if norm > 1e-12 {
        line / norm
    } else {
        line
    }
}

/// Absolute distance from a point to a normalized line (a, b, c).
#[inline]
pub fn point_line_distance(point: Point2<f64>, line: &Vector3<f64>) -> f64 {
    (point.x * line.x + point.y * line.y + line.z).abs()
}

/// Average epipolar error over all accepted view pairs.
///
/// For every view: undistort both corner sets, compute the corresponding
/// epipolar lines from the fundamental matrix, and sum the absolute
/// point-to-line distances on both sides; the total is divided by the
/// total point count across all views.
pub fn average_calibration_error(
    left_views: &[CornerSet],
    right_views: &[CornerSet],
    left: &CameraParams,
    right: &CameraParams,
    fundamental: &Matrix3<f64>,
) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for (lv, rv) in left_views.iter().zip(right_views) {
        let lp = undistort_points(&lv.points, left);
        let rp = undistort_points(&rv.points, right);
        for (l, r) in lp.iter().zip(&rp) {
            let line_in_right = epipolar_line(fundamental, *l, 1);
            let line_in_left = epipolar_line(fundamental, *r, 2);
            total += point_line_distance(*l, &line_in_left);
            total += point_line_distance(*r, &line_in_right);
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    total / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use stereo_calib_core::CameraParams;

    /// Fundamental matrix of a pure horizontal-baseline rig with identity
    /// intrinsics: y_left == y_right for corresponding points.
    fn horizontal_baseline_f() -> Matrix3<f64> {
        // F = [t]_x for R = I, t = (1, 0, 0)
        Matrix3::new(0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0)
    }

    #[test]
    fn undistort_is_identity_for_zero_distortion() {
        let camera = CameraParams::identity();
        let pts = vec![Point2::new(3.0, -2.0), Point2::new(0.25, 0.75)];
        let out = undistort_points(&pts, &camera);
        for (a, b) in out.iter().zip(&pts) {
            assert_relative_eq!(a.x, b.x, epsilon = 1e-12);
            assert_relative_eq!(a.y, b.y, epsilon = 1e-12);
        }
    }

    #[test]
    fn undistort_inverts_the_forward_model() {
        let mut camera = CameraParams::identity();
        camera.intrinsic[(0, 0)] = 500.0;
        camera.intrinsic[(1, 1)] = 500.0;
        camera.intrinsic[(0, 2)] = 320.0;
        camera.intrinsic[(1, 2)] = 240.0;
        camera.distortion[0] = 0.1;
        camera.distortion[1] = -0.05;

        // Distort a known normalized point forward, then undo it.
        let (x, y) = (0.2, -0.1);
        let r2: f64 = x * x + y * y;
        let radial = 1.0 + 0.1 * r2 + (-0.05) * r2 * r2;
        let xd = x * radial;
        let yd = y * radial;
        let pixel = Point2::new(500.0 * xd + 320.0, 500.0 * yd + 240.0);

        let out = undistort_points(&[pixel], &camera);
        assert_relative_eq!(out[0].x, 500.0 * x + 320.0, epsilon = 1e-6);
        assert_relative_eq!(out[0].y, 500.0 * y + 240.0, epsilon = 1e-6);
    }

    #[test]
    fn noise_free_correspondences_have_near_zero_error() {
        let f = horizontal_baseline_f();
        let camera = CameraParams::identity();

        // Corresponding points share the same y; x shifts by disparity.
        let left: Vec<Point2<f64>> = (0..6)
            .map(|i| Point2::new(10.0 + i as f64, 4.0 + 2.0 * i as f64))
            .collect();
        let right: Vec<Point2<f64>> = left.iter().map(|p| Point2::new(p.x - 3.0, p.y)).collect();

        let err = average_calibration_error(
            &[CornerSet::new(left)],
            &[CornerSet::new(right)],
            &camera,
            &camera,
            &f,
        );
        assert!(err < 1e-10, "expected ~0 error, got {err}");
    }

    #[test]
    fn misaligned_rows_produce_positive_error() {
        let f = horizontal_baseline_f();
        let camera = CameraParams::identity();
        let left = vec![Point2::new(5.0, 10.0)];
        let right = vec![Point2::new(2.0, 12.5)];
        let err = average_calibration_error(
            &[CornerSet::new(left)],
            &[CornerSet::new(right)],
            &camera,
            &camera,
            &f,
        );
        assert_relative_eq!(err, 5.0, epsilon = 1e-9);
    }
}
