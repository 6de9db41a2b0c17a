//! Built-in linear solver backend.
//!
//! Closed-form planar calibration (Zhang's method), quaternion-averaged
//! rig extrinsics, a normalized 8-point fundamental solver and both
//! rectification transform constructions. All solves are direct linear
//! methods without iterative refinement; a heavier solver can replace
//! this one through the `CalibrationSolver` trait.

use nalgebra::{
    DMatrix, DVector, Matrix3, Matrix3x4, Point2, Point3, Quaternion, Rotation3, UnitQuaternion,
    Vector3,
};
use stereo_calib::{CalibrationSolver, PipelineError, RectifyTransforms, SolvedCamera};
use stereo_calib_core::{CameraParams, CornerSet, StereoExtrinsics};

pub struct LinearSolver;

fn solver_err(msg: impl Into<String>) -> PipelineError {
    PipelineError::Solver(msg.into())
}

/// Right-singular vector of the smallest singular value of `a`, as the
/// homogeneous solution of `a x = 0`.
fn null_vector(a: DMatrix<f64>) -> Result<DVector<f64>, PipelineError> {
    let a = if a.nrows() < a.ncols() {
        let (rows, cols) = a.shape();
        let mut padded = DMatrix::zeros(cols, cols);
        padded.view_mut((0, 0), (rows, cols)).copy_from(&a);
        padded
    } else {
        a
    };
    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or_else(|| solver_err("svd failed"))?;
    Ok(v_t.row(v_t.nrows() - 1).transpose())
}

fn mat3_from_vec(v: &DVector<f64>) -> Matrix3<f64> {
    Matrix3::from_fn(|r, c| v[3 * r + c])
}

fn cross_matrix(t: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -t.z, t.y, t.z, 0.0, -t.x, -t.y, t.x, 0.0)
}

/// Hartley's isotropic normalization: centroid to the origin, mean
/// distance sqrt(2). Fails on degenerate (coincident) point sets.
fn normalize_points(
    points: &[Point2<f64>],
) -> Result<(Vec<Point2<f64>>, Matrix3<f64>), PipelineError> {
    if points.is_empty() {
        return Err(solver_err("no points to normalize"));
    }
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist <= f64::EPSILON {
        return Err(solver_err("degenerate point configuration"));
    }
    let scale = 2f64.sqrt() / mean_dist;
    let t = Matrix3::new(scale, 0.0, -scale * cx, 0.0, scale, -scale * cy, 0.0, 0.0, 1.0);
    let normalized = points
        .iter()
        .map(|p| Point2::new((p.x - cx) * scale, (p.y - cy) * scale))
        .collect();
    Ok((normalized, t))
}

/// Plane-to-image homography via DLT.
fn dlt_homography(
    world: &[Point2<f64>],
    image: &[Point2<f64>],
) -> Result<Matrix3<f64>, PipelineError> {
    let n = world.len();
    if n < 4 || image.len() != n {
        return Err(solver_err(format!("need at least 4 correspondences, got {n}")));
    }
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (pw, pi)) in world.iter().zip(image.iter()).enumerate() {
        let (x, y) = (pw.x, pw.y);
        let (u, v) = (pi.x, pi.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;
        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }
    let mut h = mat3_from_vec(&null_vector(a)?);
    if h[(2, 2)].abs() > f64::EPSILON {
        h /= h[(2, 2)];
    }
    Ok(h)
}

/// The 6-vector v_ij(H) of Zhang's closed-form intrinsic constraints.
fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> nalgebra::SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);
    nalgebra::SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Camera matrix from plane homographies, Zhang's closed form.
fn intrinsics_from_homographies(hs: &[Matrix3<f64>]) -> Result<Matrix3<f64>, PipelineError> {
    if hs.len() < 3 {
        return Err(solver_err(format!(
            "need at least 3 views for the intrinsic solve, got {}",
            hs.len()
        )));
    }
    let mut vmtx = DMatrix::<f64>::zeros(2 * hs.len(), 6);
    for (k, h) in hs.iter().enumerate() {
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        let v12 = v_ij(h, 0, 1);
        vmtx.row_mut(2 * k).copy_from(&v12.transpose());
        vmtx.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }
    let b = null_vector(vmtx)?;
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() <= f64::EPSILON * (b11 * b11 + b22 * b22) {
        return Err(solver_err("degenerate view configuration"));
    }
    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda.signum() != b11.signum() {
        return Err(solver_err("inconsistent homographies"));
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    Ok(Matrix3::new(alpha, gamma, u0, 0.0, beta, v0, 0.0, 0.0, 1.0))
}

/// Board pose from a plane homography and a known camera matrix.
/// The scale is fixed so the board sits in front of the camera, and the
/// rotation is snapped to the nearest orthonormal matrix.
fn pose_from_homography(
    k: &Matrix3<f64>,
    h: &Matrix3<f64>,
) -> Result<(Matrix3<f64>, Vector3<f64>), PipelineError> {
    let k_inv = k
        .try_inverse()
        .ok_or_else(|| solver_err("camera matrix is singular"))?;
    let a = k_inv * h;
    let norm = a.column(0).norm();
    if norm <= f64::EPSILON {
        return Err(solver_err("degenerate homography"));
    }
    let lambda = 1.0 / norm;
    let mut r1 = a.column(0) * lambda;
    let mut r2 = a.column(1) * lambda;
    let mut t = a.column(2) * lambda;
    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let r3 = r1.cross(&r2);
    let approx_r = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = approx_r.svd(true, true);
    let u = svd.u.ok_or_else(|| solver_err("svd failed"))?;
    let v_t = svd.v_t.ok_or_else(|| solver_err("svd failed"))?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        r = u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0)) * v_t;
    }
    Ok((r, Vector3::new(t.x, t.y, t.z)))
}

/// Quaternion average with hemisphere correction; initialization-quality
/// only, not a proper rotation mean.
fn average_rotation(rotations: &[Matrix3<f64>]) -> Result<Matrix3<f64>, PipelineError> {
    if rotations.is_empty() {
        return Err(solver_err("no rotations to average"));
    }
    let quats: Vec<UnitQuaternion<f64>> = rotations
        .iter()
        .map(|r| UnitQuaternion::from_matrix(r))
        .collect();
    let q0 = quats[0];
    let mut acc = nalgebra::Vector4::<f64>::zeros();
    for q in &quats {
        let sign = if q0.coords.dot(&q.coords) < 0.0 { -1.0 } else { 1.0 };
        acc += q.coords * sign;
    }
    if acc.norm_squared() <= f64::EPSILON {
        return Err(solver_err("rotations cancel out"));
    }
    let q = Quaternion::from_vector(acc).normalize();
    Ok(UnitQuaternion::from_quaternion(q)
        .to_rotation_matrix()
        .into_inner())
}

/// Drop z from the planar board grid.
fn board_plane(points: &[Point3<f64>]) -> Vec<Point2<f64>> {
    points.iter().map(|p| Point2::new(p.x, p.y)).collect()
}

fn per_view_poses(
    object_points: &[Vec<Point3<f64>>],
    image_points: &[CornerSet],
    k: &Matrix3<f64>,
) -> Result<Vec<(Matrix3<f64>, Vector3<f64>)>, PipelineError> {
    object_points
        .iter()
        .zip(image_points.iter())
        .map(|(obj, img)| {
            let h = dlt_homography(&board_plane(obj), &img.points)?;
            pose_from_homography(k, &h)
        })
        .collect()
}

impl CalibrationSolver for LinearSolver {
    fn calibrate_camera(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points: &[CornerSet],
        _image_size: (usize, usize),
        initial: CameraParams,
    ) -> Result<SolvedCamera, PipelineError> {
        let homographies: Vec<Matrix3<f64>> = object_points
            .iter()
            .zip(image_points.iter())
            .map(|(obj, img)| dlt_homography(&board_plane(obj), &img.points))
            .collect::<Result<_, _>>()?;
        let intrinsic = intrinsics_from_homographies(&homographies)?;

        let mut rotations = Vec::with_capacity(homographies.len());
        let mut translations = Vec::with_capacity(homographies.len());
        for h in &homographies {
            let (r, t) = pose_from_homography(&intrinsic, h)?;
            rotations.push(Rotation3::from_matrix(&r).scaled_axis());
            translations.push(t);
        }

        Ok(SolvedCamera {
            camera: CameraParams {
                intrinsic,
                // the linear solve does not model lens distortion
                distortion: initial.distortion,
            },
            rotations,
            translations,
        })
    }

    fn stereo_calibrate(
        &self,
        object_points: &[Vec<Point3<f64>>],
        left_points: &[CornerSet],
        right_points: &[CornerSet],
        left: &CameraParams,
        right: &CameraParams,
        _image_size: (usize, usize),
    ) -> Result<StereoExtrinsics, PipelineError> {
        if object_points.is_empty() {
            return Err(solver_err("no stereo views accumulated"));
        }
        let left_poses = per_view_poses(object_points, left_points, &left.intrinsic)?;
        let right_poses = per_view_poses(object_points, right_points, &right.intrinsic)?;

        let mut relative_rotations = Vec::with_capacity(left_poses.len());
        let mut relative_translations = Vec::with_capacity(left_poses.len());
        for ((rl, tl), (rr, tr)) in left_poses.iter().zip(right_poses.iter()) {
            let r = rr * rl.transpose();
            relative_rotations.push(r);
            relative_translations.push(tr - r * tl);
        }
        let rotation = average_rotation(&relative_rotations)?;
        let translation = relative_translations.iter().sum::<Vector3<f64>>()
            / relative_translations.len() as f64;

        let essential = cross_matrix(&translation) * rotation;
        let right_inv = right
            .intrinsic
            .try_inverse()
            .ok_or_else(|| solver_err("right camera matrix is singular"))?;
        let left_inv = left
            .intrinsic
            .try_inverse()
            .ok_or_else(|| solver_err("left camera matrix is singular"))?;
        let mut fundamental = right_inv.transpose() * essential * left_inv;
        if fundamental[(2, 2)].abs() > f64::EPSILON {
            fundamental /= fundamental[(2, 2)];
        }

        Ok(StereoExtrinsics {
            rotation,
            translation,
            essential,
            fundamental,
        })
    }

    /// Bouguet-style construction: split the relative rotation between
    /// the cameras, then row-align both with the baseline.
    fn stereo_rectify(
        &self,
        left: &CameraParams,
        right: &CameraParams,
        _image_size: (usize, usize),
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> Result<RectifyTransforms, PipelineError> {
        let uq = UnitQuaternion::from_matrix(rotation);
        let half_left = uq.powf(0.5).to_rotation_matrix().into_inner();
        let half_right = uq.powf(-0.5).to_rotation_matrix().into_inner();

        let t = half_right * translation;
        let norm = t.norm();
        if norm <= f64::EPSILON {
            return Err(solver_err("zero baseline"));
        }
        let mut e1 = t / norm;
        if e1.x < 0.0 {
            e1 = -e1;
        }
        let planar = (e1.x * e1.x + e1.y * e1.y).sqrt();
        if planar <= f64::EPSILON {
            return Err(solver_err("baseline is parallel to the optical axis"));
        }
        let e2 = Vector3::new(-e1.y, e1.x, 0.0) / planar;
        let e3 = e1.cross(&e2);
        let row_align = Matrix3::from_rows(&[e1.transpose(), e2.transpose(), e3.transpose()]);

        let r1 = row_align * half_left;
        let r2 = row_align * half_right;

        let mut k_new = (left.intrinsic + right.intrinsic) / 2.0;
        k_new[(0, 1)] = 0.0;
        let (fx, cx, cy) = (k_new[(0, 0)], k_new[(0, 2)], k_new[(1, 2)]);
        let tx = (row_align * t).x;

        let mut p1 = Matrix3x4::zeros();
        p1.fixed_view_mut::<3, 3>(0, 0).copy_from(&k_new);
        let mut p2 = p1;
        p2[(0, 3)] = fx * tx;

        let disparity_to_depth = Matrix3x4::new(
            1.0, 0.0, 0.0, -cx, //
            0.0, 1.0, 0.0, -cy, //
            0.0, 0.0, 0.0, fx,
        );

        Ok(RectifyTransforms {
            r1,
            r2,
            p1,
            p2,
            disparity_to_depth,
        })
    }

    /// Hartley's construction: send the right epipole to infinity, carry
    /// the matching transform to the left image and align it to the
    /// right points with a least-squares affine x-correction.
    fn stereo_rectify_uncalibrated(
        &self,
        left_points: &[Point2<f64>],
        right_points: &[Point2<f64>],
        fundamental: &Matrix3<f64>,
        image_size: (usize, usize),
    ) -> Result<(Matrix3<f64>, Matrix3<f64>), PipelineError> {
        if left_points.len() != right_points.len() || left_points.is_empty() {
            return Err(solver_err("mismatched correspondence lists"));
        }

        // Right epipole: left null vector of F.
        let svd = fundamental.svd(true, false);
        let u = svd.u.ok_or_else(|| solver_err("svd failed"))?;
        let epipole = Vector3::new(u[(0, 2)], u[(1, 2)], u[(2, 2)]);

        let (w, h) = (image_size.0 as f64, image_size.1 as f64);
        let center = Matrix3::new(1.0, 0.0, -w / 2.0, 0.0, 1.0, -h / 2.0, 0.0, 0.0, 1.0);
        let center_inv = Matrix3::new(1.0, 0.0, w / 2.0, 0.0, 1.0, h / 2.0, 0.0, 0.0, 1.0);

        let mut e = center * epipole;
        if e.x < 0.0 {
            // sign is free in the homogeneous epipole; keep x positive
            // so the rotation does not mirror the image
            e = -e;
        }
        let planar = (e.x * e.x + e.y * e.y).sqrt();
        if planar <= f64::EPSILON {
            return Err(solver_err("epipole at the image center"));
        }
        let rotate = Matrix3::new(
            e.x / planar,
            e.y / planar,
            0.0,
            -e.y / planar,
            e.x / planar,
            0.0,
            0.0,
            0.0,
            1.0,
        );
        let rotated = rotate * e;
        let mut shear = Matrix3::identity();
        if rotated.z.abs() > f64::EPSILON {
            shear[(2, 0)] = -rotated.z / rotated.x;
        }
        let mut h2 = center_inv * shear * rotate * center;
        if h2[(2, 2)].abs() > f64::EPSILON {
            h2 /= h2[(2, 2)];
        }

        // Matching left transform: H0 = H2 M with F = [e]x M.
        let m = cross_matrix(&epipole) * fundamental
            + epipole * nalgebra::RowVector3::new(1.0, 1.0, 1.0);
        let h0 = h2 * m;

        let apply = |h: &Matrix3<f64>, p: &Point2<f64>| -> Point2<f64> {
            let v = h * Vector3::new(p.x, p.y, 1.0);
            Point2::new(v.x / v.z, v.y / v.z)
        };

        // Least-squares x-alignment of the transformed left points onto
        // the transformed right points.
        let n = left_points.len();
        let mut a = DMatrix::<f64>::zeros(n, 3);
        let mut b = DVector::<f64>::zeros(n);
        for (i, (pl, pr)) in left_points.iter().zip(right_points.iter()).enumerate() {
            let tl = apply(&h0, pl);
            let tr = apply(&h2, pr);
            a[(i, 0)] = tl.x;
            a[(i, 1)] = tl.y;
            a[(i, 2)] = 1.0;
            b[i] = tr.x;
        }
        let coeffs = a
            .svd(true, true)
            .solve(&b, f64::EPSILON)
            .map_err(|e| solver_err(e.to_string()))?;
        let align = Matrix3::new(coeffs[0], coeffs[1], coeffs[2], 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);

        let mut h1 = align * h0;
        if h1[(2, 2)].abs() > f64::EPSILON {
            h1 /= h1[(2, 2)];
        }
        Ok((h1, h2))
    }

    /// Normalized 8-point algorithm with rank-2 enforcement.
    fn find_fundamental(
        &self,
        left_points: &[Point2<f64>],
        right_points: &[Point2<f64>],
    ) -> Result<Matrix3<f64>, PipelineError> {
        let n = left_points.len();
        if n < 8 || right_points.len() != n {
            return Err(solver_err(format!("need at least 8 correspondences, got {n}")));
        }
        let (lp, t1) = normalize_points(left_points)?;
        let (rp, t2) = normalize_points(right_points)?;

        let mut a = DMatrix::<f64>::zeros(n, 9);
        for (i, (p1, p2)) in lp.iter().zip(rp.iter()).enumerate() {
            let (x, y) = (p1.x, p1.y);
            let (xp, yp) = (p2.x, p2.y);
            a[(i, 0)] = xp * x;
            a[(i, 1)] = xp * y;
            a[(i, 2)] = xp;
            a[(i, 3)] = yp * x;
            a[(i, 4)] = yp * y;
            a[(i, 5)] = yp;
            a[(i, 6)] = x;
            a[(i, 7)] = y;
            a[(i, 8)] = 1.0;
        }
        let mut f = mat3_from_vec(&null_vector(a)?);

        let svd = f.svd(true, true);
        let u = svd.u.ok_or_else(|| solver_err("svd failed"))?;
        let v_t = svd.v_t.ok_or_else(|| solver_err("svd failed"))?;
        let mut s = svd.singular_values;
        s[2] = 0.0;
        f = u * Matrix3::from_diagonal(&s) * v_t;

        f = t2.transpose() * f * t1;
        if f[(2, 2)].abs() > f64::EPSILON {
            f /= f[(2, 2)];
        }
        Ok(f)
    }
}
