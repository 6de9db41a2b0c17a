//! Corner detections fed from files.
//!
//! The command line runs without a native detector; corner sets come as
//! one YAML matrix document per frame, produced by an external detection
//! step. Each document holds an Nx2 matrix under the `Corners` key, one
//! image point per row. An empty matrix means the pattern was not found
//! in that frame.

use nalgebra::{DMatrix, Point2};

use stereo_calib::{expand_pattern, PipelineError};
use stereo_calib_core::{load_matrix, CornerSet};

pub const CORNERS_KEY: &str = "Corners";

/// Interpret a loaded matrix as a corner set. Zero rows stand for a
/// frame with no detection.
fn corner_set_from(m: &DMatrix<f64>) -> Result<Option<CornerSet>, PipelineError> {
    if m.nrows() == 0 {
        return Ok(None);
    }
    if m.ncols() != 2 {
        return Err(PipelineError::Precondition(format!(
            "corner documents must be Nx2, got {}x{}",
            m.nrows(),
            m.ncols()
        )));
    }
    let points = m
        .row_iter()
        .map(|row| Point2::new(row[0], row[1]))
        .collect();
    Ok(Some(CornerSet::new(points)))
}

/// Load the corner documents matching a printf-style pattern, probing
/// indices from zero until the first missing file.
pub fn load_sequence(pattern: &str) -> Result<Vec<Option<CornerSet>>, PipelineError> {
    let mut frames = Vec::new();
    for index in 0.. {
        let path = expand_pattern(pattern, index);
        if !path.exists() {
            break;
        }
        let matrix = load_matrix(&path, CORNERS_KEY)?;
        frames.push(corner_set_from(&matrix)?);
    }
    if frames.is_empty() {
        return Err(PipelineError::Precondition(format!(
            "no corner documents match `{pattern}`"
        )));
    }
    Ok(frames)
}
