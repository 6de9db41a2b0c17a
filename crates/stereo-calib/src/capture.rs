//! Frame acquisition boundary.

use std::path::PathBuf;

use image::ImageReader;
use stereo_calib_core::GrayImage;

use crate::error::PipelineError;

/// A blocking, sequentially advancing source of grayscale frames.
///
/// `grab` returns `Ok(None)` at end of source; preview stages treat that
/// as normal completion. `frame_count` is `None` for live devices.
pub trait FrameSource {
    fn grab(&mut self) -> Result<Option<GrayImage>, PipelineError>;

    /// Re-open against the original source identifier. Used for the single
    /// retry after a failed read and for re-walking frames in the
    /// rectified preview.
    fn reopen(&mut self) -> Result<(), PipelineError>;

    fn frame_count(&self) -> Option<usize>;

    /// Identifier for diagnostics (device index or path pattern).
    fn name(&self) -> String;
}

/// Grab a frame, retrying once through `reopen` on failure.
///
/// Returns `Ok(None)` when the source is genuinely exhausted and
/// `Err(FrameUnavailable)` when even the reopened source cannot read.
pub fn next_frame_with_retry<S: FrameSource>(
    source: &mut S,
) -> Result<Option<GrayImage>, PipelineError> {
    match source.grab() {
        Ok(frame) => Ok(frame),
        Err(err) => {
            log::warn!("frame read failed ({err}), reopening {}", source.name());
            source.reopen()?;
            source
                .grab()
                .map_err(|_| PipelineError::FrameUnavailable(Some(source.name())))
        }
    }
}

/// File-backed source reading an indexed image sequence through a
/// printf-style pattern such as `left_%02d.png`.
pub struct ImageSequenceSource {
    pattern: String,
    next_index: usize,
    count: usize,
}

impl ImageSequenceSource {
    /// Probes the pattern upward from index 0 to determine the frame count.
    pub fn open(pattern: &str) -> Result<Self, PipelineError> {
        let mut count = 0;
        while expand_pattern(pattern, count).exists() {
            count += 1;
        }
        log::info!("opened image sequence {pattern:?} with {count} frames");
        Ok(Self {
            pattern: pattern.to_string(),
            next_index: 0,
            count,
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn grab(&mut self) -> Result<Option<GrayImage>, PipelineError> {
        if self.next_index >= self.count {
            return Ok(None);
        }
        let path = expand_pattern(&self.pattern, self.next_index);
        self.next_index += 1;
        let img = ImageReader::open(&path)?.decode()?.to_luma8();
        Ok(Some(GrayImage {
            width: img.width() as usize,
            height: img.height() as usize,
            data: img.into_raw(),
        }))
    }

    fn reopen(&mut self) -> Result<(), PipelineError> {
        self.next_index = 0;
        Ok(())
    }

    fn frame_count(&self) -> Option<usize> {
        Some(self.count)
    }

    fn name(&self) -> String {
        self.pattern.clone()
    }
}

/// Expand `%0Nd` / `%d` in a printf-style pattern.
pub fn expand_pattern(pattern: &str, index: usize) -> PathBuf {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut digits = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() {
                digits.push(d);
                chars.next();
            } else {
                break;
            }
        }
        match chars.next() {
            Some('d') => {
                let width: usize = digits.parse().unwrap_or(0);
                out.push_str(&format!("{index:0width$}"));
            }
            Some(other) => {
                out.push('%');
                out.push_str(&digits);
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    PathBuf::from(out)
}

/// In-memory source used by tests and synthetic pipelines.
pub struct MemorySource {
    frames: Vec<GrayImage>,
    next_index: usize,
}

impl MemorySource {
    pub fn new(frames: Vec<GrayImage>) -> Self {
        Self {
            frames,
            next_index: 0,
        }
    }
}

impl FrameSource for MemorySource {
    fn grab(&mut self) -> Result<Option<GrayImage>, PipelineError> {
        let frame = self.frames.get(self.next_index).cloned();
        if frame.is_some() {
            self.next_index += 1;
        }
        Ok(frame)
    }

    fn reopen(&mut self) -> Result<(), PipelineError> {
        self.next_index = 0;
        Ok(())
    }

    fn frame_count(&self) -> Option<usize> {
        Some(self.frames.len())
    }

    fn name(&self) -> String {
        "<memory>".to_string()
    }
}
