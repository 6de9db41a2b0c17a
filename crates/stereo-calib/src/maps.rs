//! Dense undistort/rectify remap tables and their application.

use nalgebra::{Matrix3, Vector3};
use stereo_calib_core::{sample_bilinear_u8, CameraParams, GrayImage};

use crate::error::PipelineError;
use crate::REFERENCE_LINE_INTERVAL;

/// Build the per-pixel lookup tables mapping rectified coordinates back
/// into the original distorted image.
///
/// For every destination pixel the inverse of `new_projection * r` gives
/// the ray in the camera frame; the forward distortion model then lands it
/// in the source image. Equivalent to OpenCV's `initUndistortRectifyMap`.
pub fn build_rectify_map(
    camera: &CameraParams,
    r: &Matrix3<f64>,
    new_projection: &Matrix3<f64>,
    image_size: (usize, usize),
) -> Result<(Vec<f32>, Vec<f32>), PipelineError> {
    let (width, height) = image_size;
    let inverse = (new_projection * r)
        .try_inverse()
        .ok_or_else(|| PipelineError::Solver("rectification transform is singular".into()))?;

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

    let mut map_x = vec![0.0f32; width * height];
    let mut map_y = vec![0.0f32; width * height];

    for v in 0..height {
        for u in 0..width {
            let ray = inverse * Vector3::new(u as f64, v as f64, 1.0);
            let x = ray.x / ray.z;
            let y = ray.y / ray.z;

            let r2 = x * x + y * y;
            let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
            let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

            let idx = v * width + u;
            map_x[idx] = (fx * xd + cx) as f32;
            map_y[idx] = (fy * yd + cy) as f32;
        }
    }

    Ok((map_x, map_y))
}

/// Resample `src` through `width x height` lookup tables with bilinear
/// interpolation.
pub fn remap(src: &GrayImage, map_x: &[f32], map_y: &[f32], width: usize, height: usize) -> GrayImage {
    debug_assert_eq!(map_x.len(), map_y.len());
    debug_assert_eq!(map_x.len(), width * height);
    let view = src.as_view();
    let mut out = GrayImage::new(width, height);
    for (i, px) in out.data.iter_mut().enumerate() {
        *px = sample_bilinear_u8(&view, map_x[i], map_y[i]);
    }
    out
}

/// Assemble the rectified preview: left and right side by side, with
/// horizontal reference lines so aligned epipolar rows are easy to check.
pub fn side_by_side_with_lines(left: &GrayImage, right: &GrayImage) -> GrayImage {
    let mut pair = left.side_by_side(right);
    pair.draw_horizontal_lines(REFERENCE_LINE_INTERVAL, 255);
    pair
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identity_camera_yields_identity_map() {
        let camera = CameraParams::identity();
        let (map_x, map_y) =
            build_rectify_map(&camera, &Matrix3::identity(), &Matrix3::identity(), (4, 3))
                .expect("map");
        for v in 0..3 {
            for u in 0..4 {
                let idx = v * 4 + u;
                assert_relative_eq!(map_x[idx] as f64, u as f64, epsilon = 1e-6);
                assert_relative_eq!(map_y[idx] as f64, v as f64, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn remap_with_identity_map_reproduces_image() {
        let src = GrayImage {
            width: 3,
            height: 2,
            data: vec![10, 20, 30, 40, 50, 60],
        };
        let mut map_x = vec![0.0f32; 6];
        let mut map_y = vec![0.0f32; 6];
        for v in 0..2 {
            for u in 0..3 {
                map_x[v * 3 + u] = u as f32;
                map_y[v * 3 + u] = v as f32;
            }
        }
        assert_eq!(remap(&src, &map_x, &map_y, 3, 2), src);
    }

    #[test]
    fn singular_projection_is_rejected() {
        let camera = CameraParams::identity();
        let err = build_rectify_map(&camera, &Matrix3::identity(), &Matrix3::zeros(), (2, 2));
        assert!(err.is_err());
    }

    #[test]
    fn horizontal_shift_projection_shifts_the_map() {
        // New projection translates x by +2: destination pixel (u, v)
        // samples source pixel (u - 2, v).
        let camera = CameraParams::identity();
        let mut new_p = Matrix3::identity();
        new_p[(0, 2)] = 2.0;
        let (map_x, map_y) =
            build_rectify_map(&camera, &Matrix3::identity(), &new_p, (4, 2)).expect("map");
        assert_relative_eq!(map_x[3] as f64, 1.0, epsilon = 1e-6);
        assert_relative_eq!(map_y[3] as f64, 0.0, epsilon = 1e-6);
    }
}
