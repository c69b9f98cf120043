//! Presentation backends
//!
//! The compositor core only ever talks to a backend through
//! [`PresentationBackend`]; which windowing system sits behind it is picked
//! once at startup.

pub mod headless;
pub mod x11;

pub use headless::HeadlessBackend;
pub use x11::X11Backend;

use thiserror::Error;

/// Largest surface edge accepted by any backend
pub const MAX_DIMENSION: u32 = i16::MAX as u32;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to initialize presentation backend: {0}")]
    Init(String),
    #[error("failed to create {width}x{height} surface: {reason}")]
    CreateSurface {
        width: u32,
        height: u32,
        reason: String,
    },
    #[error("upload of {got} bytes rejected: surface holds {expected}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("display connection failed: {0}")]
    Connection(String),
}

/// Outcome of draining the backend's event queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Running,
    /// The user closed a window (or equivalent); the server should exit
    Shutdown,
}

/// The four operations the compositor needs from a windowing system
pub trait PresentationBackend {
    /// Backend-owned handle of one on-screen surface
    type Surface;

    fn create_surface(
        &mut self,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<Self::Surface, BackendError>;

    /// Copy a full frame of pixels into the surface's back buffer
    fn upload(&mut self, surface: &mut Self::Surface, pixels: &[u8]) -> Result<(), BackendError>;

    /// Put the last uploaded frame on screen
    fn present(&mut self, surface: &mut Self::Surface) -> Result<(), BackendError>;

    /// Handle every pending input/window event without blocking
    fn drain_events(&mut self) -> Result<EventStatus, BackendError>;
}

/// Bytes a surface of the given size expects per upload
pub(crate) fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * jw_ipc::BYTES_PER_PIXEL
}
