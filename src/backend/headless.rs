//! In-memory backend with no window system behind it.
//!
//! Keeps the last presented frame of every surface so it can be inspected.

use super::{frame_len, BackendError, EventStatus, PresentationBackend, MAX_DIMENSION};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct HeadlessSurface {
    id: u32,
    width: u32,
    height: u32,
    /// Allocated on first upload, handed over on present
    staged: Vec<u8>,
}

impl HeadlessSurface {
    #[cfg(test)]
    pub fn id(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Default)]
pub struct HeadlessBackend {
    next_id: u32,
    titles: HashMap<u32, String>,
    presented: HashMap<u32, Vec<u8>>,
    present_count: u64,
    max_surfaces: Option<usize>,
    shutdown: Arc<AtomicBool>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse surface creation once `limit` surfaces exist
    #[cfg(test)]
    pub fn with_surface_limit(mut self, limit: usize) -> Self {
        self.max_surfaces = Some(limit);
        self
    }

    /// Flag that makes the next drain report [`EventStatus::Shutdown`]
    #[cfg(test)]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Last frame presented on a surface
    #[cfg(test)]
    pub fn frame(&self, surface_id: u32) -> Option<&[u8]> {
        self.presented.get(&surface_id).map(Vec::as_slice)
    }

    #[cfg(test)]
    pub fn title(&self, surface_id: u32) -> Option<&str> {
        self.titles.get(&surface_id).map(String::as_str)
    }

    #[cfg(test)]
    pub fn present_count(&self) -> u64 {
        self.present_count
    }
}

impl PresentationBackend for HeadlessBackend {
    type Surface = HeadlessSurface;

    fn create_surface(
        &mut self,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<HeadlessSurface, BackendError> {
        let reason = if self
            .max_surfaces
            .is_some_and(|limit| self.titles.len() >= limit)
        {
            Some("surface limit reached".to_string())
        } else if width > MAX_DIMENSION || height > MAX_DIMENSION {
            Some(format!("dimensions exceed {}", MAX_DIMENSION))
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(BackendError::CreateSurface {
                width,
                height,
                reason,
            });
        }

        self.next_id += 1;
        self.titles.insert(self.next_id, title.to_string());
        debug!("Headless surface {} '{}' {}x{}", self.next_id, title, width, height);
        Ok(HeadlessSurface {
            id: self.next_id,
            width,
            height,
            staged: Vec::new(),
        })
    }

    fn upload(&mut self, surface: &mut HeadlessSurface, pixels: &[u8]) -> Result<(), BackendError> {
        let expected = frame_len(surface.width, surface.height);
        if pixels.len() != expected {
            return Err(BackendError::SizeMismatch {
                expected,
                got: pixels.len(),
            });
        }
        surface.staged.clear();
        surface.staged.extend_from_slice(pixels);
        Ok(())
    }

    fn present(&mut self, surface: &mut HeadlessSurface) -> Result<(), BackendError> {
        // Re-presenting without a new upload keeps the current frame
        if !surface.staged.is_empty() {
            let frame = std::mem::take(&mut surface.staged);
            self.presented.insert(surface.id, frame);
        }
        self.present_count += 1;
        trace!("Headless present #{} on surface {}", self.present_count, surface.id);
        Ok(())
    }

    fn drain_events(&mut self) -> Result<EventStatus, BackendError> {
        if self.shutdown.load(Ordering::Relaxed) {
            Ok(EventStatus::Shutdown)
        } else {
            Ok(EventStatus::Running)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_shows_last_upload() {
        let mut backend = HeadlessBackend::new();
        let mut surface = backend.create_surface("W", 2, 1).unwrap();

        backend.upload(&mut surface, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(backend.frame(surface.id()), None);
        backend.present(&mut surface).unwrap();
        assert_eq!(backend.frame(surface.id()), Some(&[1, 2, 3, 4, 5, 6, 7, 8][..]));
        assert_eq!(backend.title(surface.id()), Some("W"));

        assert!(matches!(
            backend.upload(&mut surface, &[0; 4]),
            Err(BackendError::SizeMismatch { expected: 8, got: 4 })
        ));
    }

    #[test]
    fn test_large_surface_allocates_on_upload() {
        let mut backend = HeadlessBackend::new();
        let mut surface = backend
            .create_surface("big", MAX_DIMENSION, MAX_DIMENSION)
            .unwrap();
        assert_eq!(surface.staged.capacity(), 0);

        // Presenting before any upload shows nothing
        backend.present(&mut surface).unwrap();
        assert_eq!(backend.frame(surface.id()), None);

        let mut small = backend.create_surface("small", 1, 1).unwrap();
        backend.upload(&mut small, &[9, 9, 9, 9]).unwrap();
        backend.present(&mut small).unwrap();
        backend.present(&mut small).unwrap();
        assert_eq!(backend.frame(small.id()), Some(&[9, 9, 9, 9][..]));
        assert_eq!(backend.present_count(), 3);
    }

    #[test]
    fn test_surface_limit_and_shutdown() {
        let mut backend = HeadlessBackend::new().with_surface_limit(1);
        backend.create_surface("a", 1, 1).unwrap();
        assert!(backend.create_surface("b", 1, 1).is_err());

        assert_eq!(backend.drain_events().unwrap(), EventStatus::Running);
        backend.shutdown_handle().store(true, Ordering::Relaxed);
        assert_eq!(backend.drain_events().unwrap(), EventStatus::Shutdown);
    }
}
