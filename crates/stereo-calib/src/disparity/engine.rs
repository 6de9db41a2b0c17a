//! Interactive disparity computation over a persisted rectification.

use std::path::Path;

use stereo_calib_core::{
    load_matrix, save_matrix, DisparityMap, GrayImage, RemapTables, DISPARITY_MAP, RECTIFY_MAP_X1,
    RECTIFY_MAP_X2, RECTIFY_MAP_Y1, RECTIFY_MAP_Y2,
};

use crate::display::{ControlEvent, Display};
use crate::error::PipelineError;
use crate::maps::remap;
use crate::stage::StageOutcome;

use super::bm::{BlockMatcher, MatcherParams};

const DISPARITY_WINDOW: &str = "Disparity";

/// Named, bounded matcher tunables exposed to the control surface.
/// Slider values map onto matcher parameters the way the original tool's
/// trackbars did (offset, odd-size and multiple-of-16 encodings).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TuningParam {
    /// Matcher value = slider - 50.
    MinDisparity,
    /// Matcher value = 2 * slider + 5.
    BlockSize,
    /// Matcher value = 16 * slider.
    NumDisparities,
    Disp12MaxDiff,
    PreFilterCap,
    UniquenessRatio,
    SpeckleWindowSize,
    SpeckleRange,
    SmoothnessP1,
    SmoothnessP2,
}

/// Loads the four persisted remap tables and recomputes a disparity map
/// from a rectified pair every time a tunable changes.
pub struct DisparityEngine {
    maps: RemapTables,
    matcher: BlockMatcher,
    disparity: Option<DisparityMap>,
}

impl DisparityEngine {
    /// Load "Rectify Map X1/Y1/X2/Y2" from `rectify_maps.yml` in `dir`.
    pub fn load(dir: &Path) -> Result<Self, PipelineError> {
        let path = dir.join(RECTIFY_MAP_X1.file);
        let x1 = load_matrix(&path, RECTIFY_MAP_X1.key)?;
        let y1 = load_matrix(&path, RECTIFY_MAP_Y1.key)?;
        let x2 = load_matrix(&path, RECTIFY_MAP_X2.key)?;
        let y2 = load_matrix(&path, RECTIFY_MAP_Y2.key)?;

        let (height, width) = x1.shape();
        let as_f32 = |m: &nalgebra::DMatrix<f64>| -> Vec<f32> {
            m.transpose().iter().map(|&v| v as f32).collect()
        };
        let maps = RemapTables {
            width,
            height,
            left_x: as_f32(&x1),
            left_y: as_f32(&y1),
            right_x: as_f32(&x2),
            right_y: as_f32(&y2),
        };
        Ok(Self::from_tables(maps))
    }

    pub fn from_tables(maps: RemapTables) -> Self {
        Self {
            maps,
            matcher: BlockMatcher::default(),
            disparity: None,
        }
    }

    pub fn matcher(&self) -> &BlockMatcher {
        &self.matcher
    }

    /// Replace the matcher parameters wholesale, for batch runs that take
    /// them up front instead of through sliders.
    pub fn set_params(&mut self, params: MatcherParams) {
        self.matcher.params = params;
    }

    /// Remap both images into rectified space and run the block matcher.
    pub fn compute(&mut self, left: &GrayImage, right: &GrayImage) -> &DisparityMap {
        let rect_left = remap(
            left,
            &self.maps.left_x,
            &self.maps.left_y,
            self.maps.width,
            self.maps.height,
        );
        let rect_right = remap(
            right,
            &self.maps.right_x,
            &self.maps.right_y,
            self.maps.width,
            self.maps.height,
        );
        self.disparity
            .insert(self.matcher.compute(&rect_left, &rect_right))
    }

    /// Apply one bounded slider change.
    pub fn set(&mut self, param: TuningParam, value: i32) {
        let p = &mut self.matcher.params;
        match param {
            TuningParam::MinDisparity => p.min_disparity = (value - 50).clamp(-50, 50),
            TuningParam::BlockSize => p.block_size = (2 * value + 5).clamp(5, 51) as usize,
            TuningParam::NumDisparities => {
                p.num_disparities = (16 * value).clamp(16, 256) as usize
            }
            TuningParam::Disp12MaxDiff => p.disp12_max_diff = value.clamp(-1, 100),
            TuningParam::PreFilterCap => p.prefilter_cap = value.clamp(1, 63),
            TuningParam::UniquenessRatio => p.uniqueness_ratio = value.clamp(0, 100),
            TuningParam::SpeckleWindowSize => {
                p.speckle_window_size = value.clamp(0, 600) as usize
            }
            TuningParam::SpeckleRange => p.speckle_range = value.clamp(0, 32),
            TuningParam::SmoothnessP1 => p.p1 = value.clamp(0, 4000),
            TuningParam::SmoothnessP2 => p.p2 = value.clamp(0, 4000),
        }
        log::info!("tunable {param:?} set (slider value {value})");
    }

    /// Persist the raw (non-normalized) disparity map.
    pub fn save(&self, dir: &Path) -> Result<(), PipelineError> {
        let disparity = self.disparity.as_ref().ok_or_else(|| {
            PipelineError::Precondition("no disparity map computed yet".into())
        })?;
        save_matrix(
            &dir.join(DISPARITY_MAP.file),
            DISPARITY_MAP.key,
            &disparity.to_matrix(),
        )?;
        log::info!("disparity map saved to {}", dir.join(DISPARITY_MAP.file).display());
        Ok(())
    }

    /// Interactive tuning loop: every slider change recomputes the map and
    /// refreshes the preview; save persists the raw map; cancel stops the
    /// loop with no further recompute.
    pub fn run<D: Display>(
        &mut self,
        display: &mut D,
        left: &GrayImage,
        right: &GrayImage,
        out_dir: &Path,
    ) -> StageOutcome {
        self.compute(left, right);
        if let Some(d) = &self.disparity {
            display.show(DISPARITY_WINDOW, &d.to_gray());
        }
        loop {
            match display.poll(50) {
                ControlEvent::Cancel => return StageOutcome::Cancelled,
                ControlEvent::Save => {
                    if let Err(err) = self.save(out_dir) {
                        return StageOutcome::Failed(err);
                    }
                }
                ControlEvent::Adjust(param, value) => {
                    self.set(param, value);
                    self.compute(left, right);
                    if let Some(d) = &self.disparity {
                        display.show(DISPARITY_WINDOW, &d.to_gray());
                    }
                }
                ControlEvent::Pause => {
                    if display.wait_unpause() == ControlEvent::Cancel {
                        return StageOutcome::Cancelled;
                    }
                }
                ControlEvent::None => {}
            }
        }
    }
}
