//! Named-matrix artifact persistence.
//!
//! Every persisted calibration artifact is a single YAML document mapping
//! one or more fixed key names to a row-major matrix payload. File names
//! are fixed per artifact type so that later pipeline stages can find the
//! results of earlier ones.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use nalgebra::{DMatrix, SMatrix};
use serde::{Deserialize, Serialize};

/// Fixed key name and file name of one persisted artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub key: &'static str,
    pub file: &'static str,
}

impl Artifact {
    /// File name with a rig-side suffix spliced in before the extension,
    /// e.g. `intrinsic_matrix.yml` + `_left` -> `intrinsic_matrix_left.yml`.
    pub fn file_with_suffix(&self, suffix: &str) -> String {
        match self.file.rsplit_once('.') {
            Some((stem, ext)) => format!("{stem}{suffix}.{ext}"),
            None => format!("{}{suffix}", self.file),
        }
    }
}

pub const INTRINSIC_MATRIX: Artifact = Artifact {
    key: "Intrinsic Matrix",
    file: "intrinsic_matrix.yml",
};
pub const DISTORTION_COEFFS: Artifact = Artifact {
    key: "Distortion Coefficients",
    file: "distortion_coeffs.yml",
};
pub const STEREO_ROTATION: Artifact = Artifact {
    key: "Stereo Rotation Matrix",
    file: "stereo_rotation.yml",
};
pub const STEREO_TRANSLATION: Artifact = Artifact {
    key: "Stereo Translation Vector",
    file: "stereo_translation.yml",
};
pub const ESSENTIAL_MATRIX: Artifact = Artifact {
    key: "Essential Matrix",
    file: "essential_matrix.yml",
};
pub const FUNDAMENTAL_MATRIX: Artifact = Artifact {
    key: "Fundamental Matrix",
    file: "fundamental_matrix.yml",
};
pub const RECT_TRANSFORM_1: Artifact = Artifact {
    key: "Rectification Transform 1",
    file: "rect_transforms.yml",
};
pub const RECT_TRANSFORM_2: Artifact = Artifact {
    key: "Rectification Transform 2",
    file: "rect_transforms.yml",
};
pub const PROJECTION_MATRIX_1: Artifact = Artifact {
    key: "Projection Matrix 1",
    file: "projection_matrices.yml",
};
pub const PROJECTION_MATRIX_2: Artifact = Artifact {
    key: "Projection Matrix 2",
    file: "projection_matrices.yml",
};
pub const D2D_MAPPING_MATRIX: Artifact = Artifact {
    key: "Disparity-to-depth Mapping Matrix",
    file: "d2d_mapping_matrix.yml",
};
pub const RECTIFY_MAP_X1: Artifact = Artifact {
    key: "Rectify Map X1",
    file: "rectify_maps.yml",
};
pub const RECTIFY_MAP_Y1: Artifact = Artifact {
    key: "Rectify Map Y1",
    file: "rectify_maps.yml",
};
pub const RECTIFY_MAP_X2: Artifact = Artifact {
    key: "Rectify Map X2",
    file: "rectify_maps.yml",
};
pub const RECTIFY_MAP_Y2: Artifact = Artifact {
    key: "Rectify Map Y2",
    file: "rectify_maps.yml",
};
pub const DISPARITY_MAP: Artifact = Artifact {
    key: "Disparity Map",
    file: "disparity_map.yml",
};

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("failed to access artifact file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed artifact document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("artifact key {key:?} not found in {path}")]
    MissingKey { key: String, path: String },

    #[error("matrix payload for {key:?} has {got} values, expected {expected}")]
    ShapeMismatch {
        key: String,
        expected: usize,
        got: usize,
    },
}

/// Row-major matrix payload as written into a YAML artifact document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatrixDocument {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl MatrixDocument {
    pub fn from_matrix(m: &DMatrix<f64>) -> Self {
        Self {
            rows: m.nrows(),
            cols: m.ncols(),
            data: m.transpose().as_slice().to_vec(),
        }
    }

    pub fn to_matrix(&self, key: &str) -> Result<DMatrix<f64>, StorageError> {
        let expected = self.rows * self.cols;
        if self.data.len() != expected {
            return Err(StorageError::ShapeMismatch {
                key: key.to_string(),
                expected,
                got: self.data.len(),
            });
        }
        Ok(DMatrix::from_row_slice(self.rows, self.cols, &self.data))
    }
}

/// Write one named matrix into its own document at `path`.
pub fn save_matrix(path: &Path, key: &str, matrix: &DMatrix<f64>) -> Result<(), StorageError> {
    save_matrices(path, &[(key, matrix.clone())])
}

/// Write several named matrices into a single document at `path`.
pub fn save_matrices(path: &Path, entries: &[(&str, DMatrix<f64>)]) -> Result<(), StorageError> {
    let mut doc = BTreeMap::new();
    for (key, matrix) in entries {
        doc.insert((*key).to_string(), MatrixDocument::from_matrix(matrix));
    }
    let file = BufWriter::new(File::create(path)?);
    serde_yaml::to_writer(file, &doc)?;
    log::debug!("saved {} matrix entr(ies) to {}", entries.len(), path.display());
    Ok(())
}

/// Convert a fixed-size matrix into the dynamic payload form.
pub fn to_dynamic<const R: usize, const C: usize>(m: &SMatrix<f64, R, C>) -> DMatrix<f64> {
    DMatrix::from_column_slice(R, C, m.as_slice())
}

/// Read one named matrix and check it against a fixed shape.
pub fn load_fixed<const R: usize, const C: usize>(
    path: &Path,
    key: &str,
) -> Result<SMatrix<f64, R, C>, StorageError> {
    let m = load_matrix(path, key)?;
    if m.shape() != (R, C) {
        return Err(StorageError::ShapeMismatch {
            key: key.to_string(),
            expected: R * C,
            got: m.len(),
        });
    }
    Ok(SMatrix::from_iterator(m.iter().cloned()))
}

/// Read one named matrix back from the document at `path`.
pub fn load_matrix(path: &Path, key: &str) -> Result<DMatrix<f64>, StorageError> {
    let file = BufReader::new(File::open(path)?);
    let doc: BTreeMap<String, MatrixDocument> = serde_yaml::from_reader(file)?;
    let entry = doc.get(key).ok_or_else(|| StorageError::MissingKey {
        key: key.to_string(),
        path: path.display().to_string(),
    })?;
    entry.to_matrix(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn round_trip(key: &str, m: DMatrix<f64>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("artifact.yml");
        save_matrix(&path, key, &m).expect("save");
        let back = load_matrix(&path, key).expect("load");
        assert_eq!(back.shape(), m.shape());
        for (a, b) in back.iter().zip(m.iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-12);
        }
    }

    #[test]
    fn round_trips_every_artifact_shape() {
        // 3x3 transforms, 3x1 translation, 5x1 distortion, 3x4 projections.
        round_trip(
            INTRINSIC_MATRIX.key,
            DMatrix::from_row_slice(3, 3, &[520.0, 0.0, 320.5, 0.0, 521.0, 240.5, 0.0, 0.0, 1.0]),
        );
        round_trip(
            STEREO_TRANSLATION.key,
            DMatrix::from_row_slice(3, 1, &[-0.12, 0.003, 0.0007]),
        );
        round_trip(
            DISTORTION_COEFFS.key,
            DMatrix::from_row_slice(5, 1, &[0.1, -0.25, 0.001, -0.002, 0.08]),
        );
        round_trip(
            PROJECTION_MATRIX_1.key,
            DMatrix::from_row_slice(
                3,
                4,
                &[
                    520.0, 0.0, 320.5, 0.0, 0.0, 521.0, 240.5, 0.0, 0.0, 0.0, 1.0, 0.0,
                ],
            ),
        );
    }

    #[test]
    fn multi_key_document_keeps_both_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(RECT_TRANSFORM_1.file);
        let r1 = DMatrix::from_row_slice(3, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        let r2 = DMatrix::from_row_slice(3, 3, &[0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        save_matrices(
            &path,
            &[(RECT_TRANSFORM_1.key, r1.clone()), (RECT_TRANSFORM_2.key, r2.clone())],
        )
        .expect("save");
        assert_eq!(load_matrix(&path, RECT_TRANSFORM_1.key).expect("r1"), r1);
        assert_eq!(load_matrix(&path, RECT_TRANSFORM_2.key).expect("r2"), r2);
    }

    #[test]
    fn fixed_shape_load_rejects_wrong_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(INTRINSIC_MATRIX.file);
        let m = nalgebra::Matrix3::<f64>::new(520.0, 0.0, 320.5, 0.0, 521.0, 240.5, 0.0, 0.0, 1.0);
        save_matrix(&path, INTRINSIC_MATRIX.key, &to_dynamic(&m)).expect("save");

        let back: nalgebra::Matrix3<f64> =
            load_fixed(&path, INTRINSIC_MATRIX.key).expect("load 3x3");
        assert_eq!(back, m);
        let wrong: Result<nalgebra::Matrix3x4<f64>, _> = load_fixed(&path, INTRINSIC_MATRIX.key);
        assert!(matches!(wrong, Err(StorageError::ShapeMismatch { .. })));
    }

    #[test]
    fn suffix_lands_before_the_extension() {
        assert_eq!(
            INTRINSIC_MATRIX.file_with_suffix("_left"),
            "intrinsic_matrix_left.yml"
        );
        assert_eq!(DISTORTION_COEFFS.file_with_suffix(""), "distortion_coeffs.yml");
    }

    #[test]
    fn missing_key_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("artifact.yml");
        save_matrix(&path, "Some Matrix", &DMatrix::identity(3, 3)).expect("save");
        let err = load_matrix(&path, "Other Matrix").unwrap_err();
        assert!(matches!(err, StorageError::MissingKey { .. }));
    }
}
