//! Block-matching disparity computation and the interactive tuning engine.

mod bm;
mod engine;

pub use bm::{BlockMatcher, MatcherParams};
pub use engine::{DisparityEngine, TuningParam};
