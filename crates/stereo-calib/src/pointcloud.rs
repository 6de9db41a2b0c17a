//! Disparity-to-point-cloud reprojection and PLY export.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use nalgebra::{Matrix3x4, Point3, Vector4};
use stereo_calib_core::{load_fixed, load_matrix, DisparityMap, DISPARITY_MAP, D2D_MAPPING_MATRIX};

use crate::error::PipelineError;
use crate::INFINITY_BOUND;

/// Reprojects a persisted disparity map through the disparity-to-depth
/// mapping matrix and writes the result as an ASCII PLY vertex cloud.
///
/// Pixels whose reprojection has any coordinate beyond [`INFINITY_BOUND`]
/// in magnitude are treated as at infinity and skipped.
pub struct PointCloudBuilder {
    disparity: DisparityMap,
    mapping: Matrix3x4<f64>,
}

impl PointCloudBuilder {
    pub fn new(disparity: DisparityMap, mapping: Matrix3x4<f64>) -> Self {
        Self { disparity, mapping }
    }

    /// Load both inputs from the artifact files a calibrated stereo run
    /// and a disparity tuning run left in `dir`.
    pub fn load(dir: &Path) -> Result<Self, PipelineError> {
        let disparity = DisparityMap::from_matrix(&load_matrix(
            &dir.join(DISPARITY_MAP.file),
            DISPARITY_MAP.key,
        )?);
        let mapping = load_fixed(&dir.join(D2D_MAPPING_MATRIX.file), D2D_MAPPING_MATRIX.key)?;
        Ok(Self { disparity, mapping })
    }

    /// Reproject every pixel: [x y z]^T = Q * [u v d 1]^T.
    pub fn points(&self) -> Vec<Point3<f32>> {
        let mut points = Vec::new();
        for v in 0..self.disparity.height {
            for u in 0..self.disparity.width {
                let d = f64::from(self.disparity.get(u, v));
                let p = self.mapping * Vector4::new(u as f64, v as f64, d, 1.0);
                let p = Point3::new(p.x as f32, p.y as f32, p.z as f32);
                if p.coords.iter().any(|c| c.abs() > INFINITY_BOUND) {
                    continue;
                }
                points.push(p);
            }
        }
        points
    }

    pub fn write_ply<W: Write>(&self, mut out: W) -> Result<usize, PipelineError> {
        let points = self.points();
        writeln!(out, "ply")?;
        writeln!(out, "format ascii 1.0")?;
        writeln!(out, "element vertex {}", points.len())?;
        writeln!(out, "property float32 x")?;
        writeln!(out, "property float32 y")?;
        writeln!(out, "property float32 z")?;
        writeln!(out, "end_header")?;
        for p in &points {
            writeln!(out, "{} {} {}", p.x, p.y, p.z)?;
        }
        Ok(points.len())
    }

    pub fn save_ply(&self, path: &Path) -> Result<usize, PipelineError> {
        let mut out = BufWriter::new(File::create(path)?);
        let count = self.write_ply(&mut out)?;
        out.flush()?;
        log::info!("wrote {count} points to {}", path.display());
        Ok(count)
    }
}
