//! Surface state tracking for the compositor

use super::RequestError;
use crate::backend::PresentationBackend;
use jw_ipc::SharedBuffer;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// A server-owned presentation target
#[derive(Debug)]
pub struct Surface<S> {
    pub id: u32,
    pub title: String,
    pub width: u32,
    pub height: u32,
    handle: S,
    buffer: Option<SharedBuffer>,
    commits: u64,
}

impl<S> Surface<S> {
    #[cfg(test)]
    pub fn handle(&self) -> &S {
        &self.handle
    }

    pub fn buffer(&self) -> Option<&SharedBuffer> {
        self.buffer.as_ref()
    }

    /// Number of successful commits
    pub fn commits(&self) -> u64 {
        self.commits
    }
}

/// Live surfaces keyed by id
///
/// Ids start at 1 and only ever grow. There is no removal: a surface lives
/// until the server exits, even after the client that created it is gone.
pub struct SurfaceRegistry<S> {
    surfaces: BTreeMap<u32, Surface<S>>,
    last_id: u32,
}

impl<S> SurfaceRegistry<S> {
    pub fn new() -> Self {
        Self {
            surfaces: BTreeMap::new(),
            last_id: 0,
        }
    }

    /// Create a backend surface and register it under the next id.
    ///
    /// The id counter only advances once the backend succeeded.
    pub fn create<B>(
        &mut self,
        backend: &mut B,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<u32, RequestError>
    where
        B: PresentationBackend<Surface = S>,
    {
        let id = self.last_id.checked_add(1).ok_or(RequestError::IdsExhausted)?;
        let handle = backend.create_surface(title, width, height)?;
        self.last_id = id;
        self.surfaces.insert(
            id,
            Surface {
                id,
                title: title.to_string(),
                width,
                height,
                handle,
                buffer: None,
                commits: 0,
            },
        );
        Ok(id)
    }

    pub fn lookup(&self, id: u32) -> Result<&Surface<S>, RequestError> {
        self.surfaces.get(&id).ok_or(RequestError::NotFound(id))
    }

    /// Attach a canvas, releasing whatever was attached before
    pub fn attach_buffer(&mut self, id: u32, buffer: SharedBuffer) -> Result<(), RequestError> {
        let surface = self.surfaces.get_mut(&id).ok_or(RequestError::NotFound(id))?;
        if let Some(old) = surface.buffer.replace(buffer) {
            release_replaced(old, surface.buffer.as_ref());
        }
        Ok(())
    }

    /// Take the attached canvas out of a surface
    pub fn detach_buffer(&mut self, id: u32) -> Result<Option<SharedBuffer>, RequestError> {
        let surface = self.surfaces.get_mut(&id).ok_or(RequestError::NotFound(id))?;
        Ok(surface.buffer.take())
    }

    /// Copy the attached canvas onto the surface and present it.
    ///
    /// A canvas the client shrank behind our back is refused rather than
    /// read, since reading past its end would fault the whole server.
    pub fn commit<B>(&mut self, backend: &mut B, id: u32) -> Result<(), RequestError>
    where
        B: PresentationBackend<Surface = S>,
    {
        let surface = self.surfaces.get_mut(&id).ok_or(RequestError::NotFound(id))?;
        let Surface {
            handle,
            buffer,
            commits,
            ..
        } = surface;
        let buffer = buffer.as_ref().ok_or(RequestError::NoBuffer(id))?;
        buffer.check_len()?;

        backend.upload(handle, buffer.as_slice())?;
        backend.present(handle)?;
        *commits += 1;
        trace!("Committed surface {} ({} bytes)", id, buffer.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    /// Surfaces in id order
    pub fn iter(&self) -> impl Iterator<Item = &Surface<S>> {
        self.surfaces.values()
    }
}

impl<S> Default for SurfaceRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn release_replaced(old: SharedBuffer, current: Option<&SharedBuffer>) {
    // Re-created canvases reuse their name; unlinking would hide the new one
    if current.is_some_and(|new| new.name() == old.name()) {
        old.detach();
    } else if let Err(e) = old.release() {
        warn!("Failed to release replaced canvas: {}", e);
    }
}
