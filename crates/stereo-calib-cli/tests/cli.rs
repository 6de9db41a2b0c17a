use std::fs;

use assert_cmd::Command;
use nalgebra::{DMatrix, Matrix3, Point3, Rotation3, Vector3};
use predicates::prelude::*;
use tempfile::tempdir;

use stereo_calib::expand_pattern;
use stereo_calib_core::{
    load_fixed, object_points, save_matrices, save_matrix, BoardGeometry, D2D_MAPPING_MATRIX,
    DISPARITY_MAP, DISTORTION_COEFFS, INTRINSIC_MATRIX, PROJECTION_MATRIX_1, RECTIFY_MAP_X1,
    RECTIFY_MAP_X2, RECTIFY_MAP_Y1, RECTIFY_MAP_Y2, RECT_TRANSFORM_1, STEREO_ROTATION,
    STEREO_TRANSLATION,
};

fn cmd() -> Command {
    Command::cargo_bin("stereo-calib").expect("binary")
}

#[test]
fn calibrate_rejects_missing_positionals() {
    cmd()
        .args(["calibrate", "9", "6"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn unknown_subcommand_fails() {
    cmd()
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized"));
}

#[test]
fn cloud_writes_a_ply_file() {
    let dir = tempdir().expect("tempdir");

    // One valid pixel and one reprojecting past the infinity bound.
    let disparity = DMatrix::from_row_slice(1, 2, &[1.0, 2000.0]);
    save_matrix(
        &dir.path().join(DISPARITY_MAP.file),
        DISPARITY_MAP.key,
        &disparity,
    )
    .expect("seed disparity");
    let mapping = DMatrix::from_row_slice(
        3,
        4,
        &[
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 2.0, 0.0, //
            0.0, 0.0, 3.0, 0.0,
        ],
    );
    save_matrix(
        &dir.path().join(D2D_MAPPING_MATRIX.file),
        D2D_MAPPING_MATRIX.key,
        &mapping,
    )
    .expect("seed mapping");

    let out = dir.path().join("cloud.ply");
    cmd()
        .args(["cloud", "--dir"])
        .arg(dir.path())
        .arg("--out")
        .arg(&out)
        .assert()
        .success();

    let ply = fs::read_to_string(&out).expect("read ply");
    assert!(ply.starts_with("ply\n"));
    assert!(ply.contains("element vertex 1"));
}

#[test]
fn disparity_persists_a_map_and_preview() {
    let dir = tempdir().expect("tempdir");
    let (width, height) = (40usize, 24usize);

    // Identity remap tables, so matching runs on the inputs unchanged.
    let mut map_x = DMatrix::zeros(height, width);
    let mut map_y = DMatrix::zeros(height, width);
    for y in 0..height {
        for x in 0..width {
            map_x[(y, x)] = x as f64;
            map_y[(y, x)] = y as f64;
        }
    }
    save_matrices(
        &dir.path().join(RECTIFY_MAP_X1.file),
        &[
            (RECTIFY_MAP_X1.key, map_x.clone()),
            (RECTIFY_MAP_Y1.key, map_y.clone()),
            (RECTIFY_MAP_X2.key, map_x),
            (RECTIFY_MAP_Y2.key, map_y),
        ],
    )
    .expect("seed maps");

    // Right image is the left shifted two pixels toward the left edge.
    let mut left = image::GrayImage::new(width as u32, height as u32);
    let mut right = image::GrayImage::new(width as u32, height as u32);
    for y in 0..height as u32 {
        for x in 0..width as u32 {
            let v = ((x * 13 + y * 29) % 251) as u8;
            left.put_pixel(x, y, image::Luma([v]));
            if x >= 2 {
                right.put_pixel(x - 2, y, image::Luma([v]));
            }
        }
    }
    let left_path = dir.path().join("left.png");
    let right_path = dir.path().join("right.png");
    left.save(&left_path).expect("save left");
    right.save(&right_path).expect("save right");

    let preview = dir.path().join("preview.png");
    cmd()
        .args(["disparity", "--block-size", "5", "--num-disparities", "16"])
        .arg("--left")
        .arg(&left_path)
        .arg("--right")
        .arg(&right_path)
        .arg("--dir")
        .arg(dir.path())
        .arg("--preview")
        .arg(&preview)
        .assert()
        .success();

    assert!(dir.path().join(DISPARITY_MAP.file).exists());
    assert!(preview.exists());
}

struct SyntheticRig {
    board: BoardGeometry,
    k: Matrix3<f64>,
    poses: Vec<(Matrix3<f64>, Vector3<f64>)>,
}

impl SyntheticRig {
    fn new() -> Self {
        let axes = [
            (Vector3::new(0.2, 0.0, 0.1), Vector3::new(-4.0, -3.0, 14.0)),
            (Vector3::new(0.0, -0.25, 0.0), Vector3::new(-3.0, -4.0, 12.0)),
            (Vector3::new(0.15, 0.2, -0.1), Vector3::new(-5.0, -2.0, 16.0)),
            (Vector3::new(-0.1, 0.15, 0.05), Vector3::new(-2.0, -3.5, 13.0)),
        ];
        Self {
            board: BoardGeometry::new(9, 6, 1.0),
            k: Matrix3::new(900.0, 0.0, 640.0, 0.0, 880.0, 360.0, 0.0, 0.0, 1.0),
            poses: axes
                .iter()
                .map(|(axis, t)| (Rotation3::new(*axis).into_inner(), *t))
                .collect(),
        }
    }

    /// Write blank frames and projected corner documents for every pose,
    /// composing each view with an optional rig offset.
    fn write_view_files(
        &self,
        image_pattern: &str,
        corner_pattern: &str,
        offset: Option<(&Matrix3<f64>, &Vector3<f64>)>,
    ) {
        let blank = image::GrayImage::new(64, 48);
        for (i, (r, t)) in self.poses.iter().enumerate() {
            blank
                .save(expand_pattern(image_pattern, i))
                .expect("save frame");
            let (r, t) = match offset {
                Some((ro, to)) => (ro * r, ro * t + to),
                None => (*r, *t),
            };
            save_matrix(
                &expand_pattern(corner_pattern, i),
                "Corners",
                &self.corner_document(&r, &t),
            )
            .expect("save corners");
        }
    }

    /// Projected Nx2 corner matrix for one board pose.
    fn corner_document(&self, r: &Matrix3<f64>, t: &Vector3<f64>) -> DMatrix<f64> {
        let grid = object_points(&self.board);
        DMatrix::from_fn(grid.len(), 2, |row, col| {
            let p: &Point3<f64> = &grid[row];
            let cam = r * p.coords + t;
            let q = self.k * cam;
            if col == 0 {
                q.x / q.z
            } else {
                q.y / q.z
            }
        })
    }
}

#[test]
fn calibrate_recovers_intrinsics_from_synthetic_corners() {
    let dir = tempdir().expect("tempdir");
    let rig = SyntheticRig::new();

    let image_pattern = dir.path().join("frame_%d.png");
    let image_pattern = image_pattern.to_str().expect("utf8").to_string();
    let corner_pattern = dir.path().join("corners_%d.yml");
    let corner_pattern = corner_pattern.to_str().expect("utf8").to_string();
    rig.write_view_files(&image_pattern, &corner_pattern, None);

    cmd()
        .args(["calibrate", "9", "6", "4"])
        .arg("--images")
        .arg(&image_pattern)
        .arg("--corners")
        .arg(&corner_pattern)
        .arg("--out")
        .arg(dir.path())
        .assert()
        .success();

    let intrinsic: Matrix3<f64> = load_fixed(
        &dir.path().join(INTRINSIC_MATRIX.file),
        INTRINSIC_MATRIX.key,
    )
    .expect("load intrinsics");
    assert!((intrinsic[(0, 0)] - 900.0).abs() < 1e-3);
    assert!((intrinsic[(1, 1)] - 880.0).abs() < 1e-3);
    assert!(dir.path().join(DISTORTION_COEFFS.file).exists());
}

#[test]
fn frame_skip_keeps_corner_documents_aligned_with_frames() {
    let dir = tempdir().expect("tempdir");
    let rig = SyntheticRig::new();

    let image_pattern = dir.path().join("frame_%d.png");
    let image_pattern = image_pattern.to_str().expect("utf8").to_string();
    let corner_pattern = dir.path().join("corners_%d.yml");
    let corner_pattern = corner_pattern.to_str().expect("utf8").to_string();

    // Real views land at even indices. Odd indices carry complete but
    // mispositioned documents, so any off-by-one pairing of a sampled
    // frame with a skipped document throws the solve off.
    let blank = image::GrayImage::new(64, 48);
    for (i, (r, t)) in rig.poses.iter().enumerate() {
        let corners = rig.corner_document(r, t);
        for (j, doc) in [(2 * i, corners.clone()), (2 * i + 1, corners.map(|v| v * 0.5))] {
            blank
                .save(expand_pattern(&image_pattern, j))
                .expect("save frame");
            save_matrix(&expand_pattern(&corner_pattern, j), "Corners", &doc)
                .expect("save corners");
        }
    }

    cmd()
        .args(["calibrate", "9", "6", "4", "--frame-skip", "2"])
        .arg("--images")
        .arg(&image_pattern)
        .arg("--corners")
        .arg(&corner_pattern)
        .arg("--out")
        .arg(dir.path())
        .assert()
        .success();

    let intrinsic: Matrix3<f64> = load_fixed(
        &dir.path().join(INTRINSIC_MATRIX.file),
        INTRINSIC_MATRIX.key,
    )
    .expect("load intrinsics");
    assert!((intrinsic[(0, 0)] - 900.0).abs() < 1e-3);
    assert!((intrinsic[(1, 1)] - 880.0).abs() < 1e-3);
}

#[test]
fn stereo_chain_recovers_extrinsics_and_rectifies() {
    let dir = tempdir().expect("tempdir");
    let rig = SyntheticRig::new();

    // Right camera sits a small rotation and a mostly-horizontal
    // baseline away from the left one.
    let r_rig = Rotation3::new(Vector3::new(0.0, 0.05, 0.0)).into_inner();
    let t_rig = Vector3::new(-2.0, 0.1, 0.05);

    let patterns: Vec<String> = [
        "left_%d.png",
        "left_corners_%d.yml",
        "right_%d.png",
        "right_corners_%d.yml",
    ]
    .iter()
    .map(|n| dir.path().join(n).to_str().expect("utf8").to_string())
    .collect();
    rig.write_view_files(&patterns[0], &patterns[1], None);
    rig.write_view_files(&patterns[2], &patterns[3], Some((&r_rig, &t_rig)));

    // Per-side intrinsics first, then the joint solve picks them up.
    for (images, corners, suffix) in [
        (&patterns[0], &patterns[1], "_left"),
        (&patterns[2], &patterns[3], "_right"),
    ] {
        cmd()
            .args(["calibrate", "9", "6", "4", "--suffix", suffix])
            .arg("--images")
            .arg(images)
            .arg("--corners")
            .arg(corners)
            .arg("--out")
            .arg(dir.path())
            .assert()
            .success();
    }

    cmd()
        .args(["stereo", "9", "6", "4"])
        .arg("--left-images")
        .arg(&patterns[0])
        .arg("--left-corners")
        .arg(&patterns[1])
        .arg("--right-images")
        .arg(&patterns[2])
        .arg("--right-corners")
        .arg(&patterns[3])
        .arg("--out")
        .arg(dir.path())
        .assert()
        .success();

    let rotation: Matrix3<f64> = load_fixed(
        &dir.path().join(STEREO_ROTATION.file),
        STEREO_ROTATION.key,
    )
    .expect("load rotation");
    for r in 0..3 {
        for c in 0..3 {
            assert!((rotation[(r, c)] - r_rig[(r, c)]).abs() < 1e-4);
        }
    }
    for artifact in [
        STEREO_TRANSLATION,
        RECT_TRANSFORM_1,
        PROJECTION_MATRIX_1,
        D2D_MAPPING_MATRIX,
        RECTIFY_MAP_X1,
    ] {
        assert!(dir.path().join(artifact.file).exists());
    }
}
