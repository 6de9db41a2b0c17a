//! Command line front end for the calibration pipeline.
//!
//! All stages run in batch mode against files: image sequences come as
//! printf-style patterns, corner detections as per-frame YAML documents
//! (see [`corners`]), and every artifact lands in `--out` under its
//! fixed name. The numerical backbone is the built-in linear solver.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use stereo_calib::{
    CalibrationSession, DisparityEngine, ImageSequenceSource, MatcherParams, NullDisplay,
    PatternDetector, PipelineError, PointCloudBuilder, RectificationStrategy, StageOutcome,
    StereoCalibrationSession,
};
use stereo_calib_core::{init_with_level, BoardGeometry, CornerSet, GrayImage};

mod backend;
mod corners;

#[derive(Parser)]
#[command(name = "stereo-calib", version, about = "Stereo camera calibration pipeline")]
struct Cli {
    /// Log verbosity (off, error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate a single camera from an image sequence and matching
    /// corner documents.
    Calibrate {
        /// Inner corners per board row.
        board_width: usize,
        /// Inner corners per board column.
        board_height: usize,
        /// Complete views to accumulate before solving.
        images_amount: usize,

        /// Image sequence pattern, e.g. `frames/cam_%02d.png`.
        #[arg(long)]
        images: String,
        /// Corner document pattern, one Nx2 YAML matrix per frame.
        #[arg(long)]
        corners: String,
        /// Output directory for the calibration artifacts.
        #[arg(long, default_value = ".")]
        out: PathBuf,
        /// Sample every Nth frame for detection.
        #[arg(long, default_value_t = 1)]
        frame_skip: usize,
        /// Artifact file name suffix, e.g. `_left` for a rig side.
        #[arg(long, default_value = "")]
        suffix: String,
        /// Board square edge length in world units.
        #[arg(long, default_value_t = 1.0)]
        square_size: f64,
    },

    /// Jointly calibrate and rectify a stereo pair. Picks up per-side
    /// intrinsics from the output directory when present.
    Stereo {
        board_width: usize,
        board_height: usize,
        images_amount: usize,

        #[arg(long)]
        left_images: String,
        #[arg(long)]
        right_images: String,
        #[arg(long)]
        left_corners: String,
        #[arg(long)]
        right_corners: String,
        #[arg(long, default_value = ".")]
        out: PathBuf,
        #[arg(long, default_value_t = 1)]
        frame_skip: usize,
        #[arg(long, default_value_t = 1.0)]
        square_size: f64,
        /// Rectify from point correspondences instead of the calibrated
        /// extrinsics. The output then carries no depth mapping matrix.
        #[arg(long)]
        uncalibrated: bool,
        /// Re-estimate the fundamental matrix from the pooled corners
        /// instead of reusing the one from the joint solve.
        #[arg(long, requires = "uncalibrated")]
        reestimate_fundamental: bool,
    },

    /// Compute a disparity map from one rectified image pair using the
    /// persisted rectification maps.
    Disparity {
        /// Left image file.
        #[arg(long)]
        left: PathBuf,
        /// Right image file.
        #[arg(long)]
        right: PathBuf,
        /// Directory holding `rectify_maps.yml`; the disparity map is
        /// written back there.
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Optional PNG preview of the normalized disparity map.
        #[arg(long)]
        preview: Option<PathBuf>,

        #[arg(long, default_value_t = 0)]
        min_disparity: i32,
        #[arg(long, default_value_t = 21)]
        block_size: usize,
        #[arg(long, default_value_t = 64)]
        num_disparities: usize,
        #[arg(long, default_value_t = -1)]
        disp12_max_diff: i32,
        #[arg(long, default_value_t = 31)]
        prefilter_cap: i32,
        #[arg(long, default_value_t = 15)]
        uniqueness_ratio: i32,
        #[arg(long, default_value_t = 0)]
        speckle_window_size: usize,
        #[arg(long, default_value_t = 1)]
        speckle_range: i32,
        #[arg(long, default_value_t = 0)]
        p1: i32,
        #[arg(long, default_value_t = 0)]
        p2: i32,
    },

    /// Reproject the persisted disparity map into a PLY point cloud.
    Cloud {
        /// Directory holding `disparity_map.yml` and
        /// `d2d_mapping_matrix.yml`.
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Output PLY file.
        #[arg(long, default_value = "point_cloud.ply")]
        out: PathBuf,
    },
}

/// Feeds the corner document matching each sampled frame.
///
/// Sessions only query the detector on every `frame_skip`th frame, so the
/// cursor advances by the same stride to keep document k paired with
/// frame k.
struct FileCorners {
    frames: Vec<Option<CornerSet>>,
    cursor: usize,
    stride: usize,
}

impl FileCorners {
    fn new(frames: Vec<Option<CornerSet>>, frame_skip: usize) -> Self {
        Self {
            frames,
            cursor: 0,
            stride: frame_skip.max(1),
        }
    }

    fn advance(&mut self) -> Option<CornerSet> {
        let doc = self.frames.get(self.cursor).cloned().flatten();
        self.cursor += self.stride;
        doc
    }
}

impl PatternDetector for FileCorners {
    fn detect(&mut self, _image: &GrayImage, _board: &BoardGeometry) -> Option<CornerSet> {
        self.advance()
    }
}

/// Alternates between the left and right corner sequences, in the order
/// the paired accumulation queries them.
struct PairedFileCorners {
    left: FileCorners,
    right: FileCorners,
    next_is_left: bool,
}

impl PatternDetector for PairedFileCorners {
    fn detect(&mut self, _image: &GrayImage, _board: &BoardGeometry) -> Option<CornerSet> {
        let side = if self.next_is_left {
            &mut self.left
        } else {
            &mut self.right
        };
        self.next_is_left = !self.next_is_left;
        side.advance()
    }
}

fn load_image(path: &std::path::Path) -> Result<GrayImage, PipelineError> {
    let img = image::ImageReader::open(path)?.decode()?.to_luma8();
    Ok(GrayImage {
        width: img.width() as usize,
        height: img.height() as usize,
        data: img.into_raw(),
    })
}

fn outcome_to_exit(outcome: StageOutcome) -> ExitCode {
    match outcome {
        StageOutcome::Completed => ExitCode::SUCCESS,
        StageOutcome::Cancelled => {
            log::warn!("stage cancelled, no artifacts written");
            ExitCode::SUCCESS
        }
        StageOutcome::Failed(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, PipelineError> {
    match cli.command {
        Commands::Calibrate {
            board_width,
            board_height,
            images_amount,
            images,
            corners: corner_pattern,
            out,
            frame_skip,
            suffix,
            square_size,
        } => {
            let board = BoardGeometry::new(board_width, board_height, square_size);
            let mut source = ImageSequenceSource::open(&images)?;
            let mut detector =
                FileCorners::new(corners::load_sequence(&corner_pattern)?, frame_skip);
            let mut session = CalibrationSession::new(board, images_amount, &out)
                .with_frame_skip(frame_skip)
                .with_suffix(&suffix);
            let outcome = session.run(
                &mut source,
                &mut detector,
                &mut NullDisplay,
                &backend::LinearSolver,
            );
            Ok(outcome_to_exit(outcome))
        }

        Commands::Stereo {
            board_width,
            board_height,
            images_amount,
            left_images,
            right_images,
            left_corners,
            right_corners,
            out,
            frame_skip,
            square_size,
            uncalibrated,
            reestimate_fundamental,
        } => {
            let board = BoardGeometry::new(board_width, board_height, square_size);
            let strategy = if uncalibrated {
                RectificationStrategy::Uncalibrated {
                    reestimate_fundamental,
                }
            } else {
                RectificationStrategy::Calibrated
            };
            let mut left = ImageSequenceSource::open(&left_images)?;
            let mut right = ImageSequenceSource::open(&right_images)?;
            let mut detector = PairedFileCorners {
                left: FileCorners::new(corners::load_sequence(&left_corners)?, frame_skip),
                right: FileCorners::new(corners::load_sequence(&right_corners)?, frame_skip),
                next_is_left: true,
            };
            let mut session = StereoCalibrationSession::new(board, images_amount, strategy, &out)
                .with_frame_skip(frame_skip);
            let outcome = session.run(
                &mut left,
                &mut right,
                &mut detector,
                &mut NullDisplay,
                &backend::LinearSolver,
            );
            Ok(outcome_to_exit(outcome))
        }

        Commands::Disparity {
            left,
            right,
            dir,
            preview,
            min_disparity,
            block_size,
            num_disparities,
            disp12_max_diff,
            prefilter_cap,
            uniqueness_ratio,
            speckle_window_size,
            speckle_range,
            p1,
            p2,
        } => {
            let left = load_image(&left)?;
            let right = load_image(&right)?;
            let mut engine = DisparityEngine::load(&dir)?;
            engine.set_params(MatcherParams {
                min_disparity,
                block_size,
                num_disparities,
                disp12_max_diff,
                prefilter_cap,
                uniqueness_ratio,
                speckle_window_size,
                speckle_range,
                p1,
                p2,
            });
            let gray = engine.compute(&left, &right).to_gray();
            engine.save(&dir)?;
            if let Some(path) = preview {
                let buffer = image::GrayImage::from_raw(
                    gray.width as u32,
                    gray.height as u32,
                    gray.data,
                )
                .ok_or_else(|| PipelineError::Precondition("empty disparity map".into()))?;
                buffer.save(&path)?;
                log::info!("disparity preview saved to {}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Cloud { dir, out } => {
            let builder = PointCloudBuilder::load(&dir)?;
            let count = builder.save_ply(&out)?;
            log::info!("wrote {count} points to {}", out.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = init_with_level(cli.log_level);
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
