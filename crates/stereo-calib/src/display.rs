//! Display and interactive-control boundary.
//!
//! Windows and trackbars belong to a display collaborator; the pipeline
//! only pushes frames at it and polls it for control events. The display
//! context is an explicit object owned by the stage that uses it, created
//! when the stage starts and dropped when it ends.

use stereo_calib_core::GrayImage;

use crate::disparity::TuningParam;

/// One polled control event, checked once per loop tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlEvent {
    /// Nothing pressed; the poll still paces the loop.
    None,
    /// Block until resumed or cancelled.
    Pause,
    /// Cooperative cancellation of the active stage.
    Cancel,
    /// Persist the current result (disparity tuning stage).
    Save,
    /// A named tuning slider moved.
    Adjust(TuningParam, i32),
}

/// Display collaborator: named windows plus a blocking event poll that
/// doubles as frame-rate pacing.
pub trait Display {
    fn show(&mut self, window: &str, image: &GrayImage);

    /// Poll for a control event, blocking up to `wait_ms`.
    fn poll(&mut self, wait_ms: u64) -> ControlEvent;

    /// Block until the pause is lifted or the stage is cancelled.
    /// Returns `Cancel` if the user cancelled while paused.
    fn wait_unpause(&mut self) -> ControlEvent {
        loop {
            match self.poll(250) {
                ControlEvent::Pause => return ControlEvent::None,
                ControlEvent::Cancel => return ControlEvent::Cancel,
                _ => {}
            }
        }
    }
}

/// Headless display: swallows frames, reports no events. Useful for
/// file-backed batch runs and tests.
#[derive(Default)]
pub struct NullDisplay;

impl Display for NullDisplay {
    fn show(&mut self, _window: &str, _image: &GrayImage) {}

    fn poll(&mut self, _wait_ms: u64) -> ControlEvent {
        ControlEvent::None
    }
}
