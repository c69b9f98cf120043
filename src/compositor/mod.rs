//! Compositor Module
//!
//! Owns the surface registry and the presentation backend, and turns decoded
//! requests into registry operations.

pub mod registry;

use crate::backend::{BackendError, EventStatus, PresentationBackend};
use jw_ipc::shm::{buffer_name, canvas_size};
use jw_ipc::{DecodeError, Request, Response, SharedBuffer, ShmError, Status};
use registry::SurfaceRegistry;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a request could not be carried out. Each variant maps onto one wire status.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Decode(#[from] DecodeError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("surface {0} not found")]
    NotFound(u32),
    #[error("surface {0} has no canvas attached")]
    NoBuffer(u32),
    #[error("surface ids exhausted")]
    IdsExhausted,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Shm(#[from] ShmError),
}

impl RequestError {
    pub fn status(&self) -> Status {
        match self {
            RequestError::Decode(_) | RequestError::BadRequest(_) => Status::BadRequest,
            RequestError::NotFound(_) => Status::NotFound,
            RequestError::NoBuffer(_) => Status::NoBuffer,
            RequestError::IdsExhausted | RequestError::Backend(_) | RequestError::Shm(_) => {
                Status::ResourceError
            }
        }
    }
}

pub struct Compositor<B: PresentationBackend> {
    backend: B,
    registry: SurfaceRegistry<B::Surface>,
    shm_prefix: String,
}

impl<B: PresentationBackend> Compositor<B> {
    pub fn new(backend: B, shm_prefix: impl Into<String>) -> Self {
        Self {
            backend,
            registry: SurfaceRegistry::new(),
            shm_prefix: shm_prefix.into(),
        }
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &SurfaceRegistry<B::Surface> {
        &self.registry
    }

    /// Decode one frame payload and produce exactly one response for it.
    ///
    /// Failures become error responses; nothing here closes the connection.
    pub fn handle_frame(&mut self, payload: &[u8]) -> Response {
        let opcode = payload.first().copied().unwrap_or(0);
        let result = Request::decode(payload)
            .map_err(RequestError::from)
            .and_then(|req| self.handle_request(req));

        match result {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Request failed: {}", e);
                Response::Error {
                    opcode,
                    status: e.status(),
                    message: e.to_string(),
                }
            }
        }
    }

    pub fn handle_request(&mut self, req: Request) -> Result<Response, RequestError> {
        match req {
            Request::CreateDisplay {
                name,
                width,
                height,
            } => {
                let id = self.registry.create(&mut self.backend, &name, width, height)?;
                info!("Created display {} '{}' ({}x{})", id, name, width, height);
                Ok(Response::DisplayCreated { id })
            }
            Request::CreateCanvas {
                display_id,
                width,
                height,
            } => {
                let name = self.create_canvas(display_id, width, height)?;
                Ok(Response::CanvasCreated { name })
            }
            Request::Commit { display_id } => {
                self.registry.commit(&mut self.backend, display_id)?;
                debug!("Committed display {}", display_id);
                Ok(Response::Committed)
            }
        }
    }

    fn create_canvas(&mut self, id: u32, width: u32, height: u32) -> Result<String, RequestError> {
        let surface = self.registry.lookup(id)?;
        if (width, height) != (surface.width, surface.height) {
            return Err(RequestError::BadRequest(format!(
                "canvas {}x{} does not match display {} ({}x{})",
                width, height, id, surface.width, surface.height
            )));
        }
        let size = canvas_size(width, height)
            .ok_or_else(|| RequestError::BadRequest(format!("canvas {}x{} too large", width, height)))?;

        // Unmap the previous canvas before its name is recycled
        if let Some(old) = self.registry.detach_buffer(id)? {
            old.release()?;
        }

        let name = buffer_name(&self.shm_prefix, id);
        let buffer = SharedBuffer::create(&name, size)?;
        self.registry.attach_buffer(id, buffer)?;
        info!("Allocated canvas {} for display {} ({} bytes)", name, id, size);
        Ok(name)
    }

    pub fn drain_backend_events(&mut self) -> Result<EventStatus, BackendError> {
        self.backend.drain_events()
    }
}
