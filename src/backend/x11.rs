//! X11 presentation backend
//!
//! One top-level window per surface, backed by a server-side pixmap of the
//! same size. Uploads go into the pixmap with `PutImage`; presenting copies
//! the pixmap onto the window, which also lets `Expose` be answered without
//! asking the client to redraw.

use super::{frame_len, BackendError, EventStatus, PresentationBackend, MAX_DIMENSION};
use std::collections::HashMap;
use tracing::{debug, info, trace, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::xproto::{
    AtomEnum, ConnectionExt as XprotoExt, CreateGCAux, CreateWindowAux, EventMask, ImageFormat,
    ImageOrder, PropMode, Rectangle, WindowClass,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as WrapperExt;

/// Fixed size of a PutImage request header
const PUT_IMAGE_HEADER: usize = 24;

/// X11 resources making up one surface
#[derive(Debug, Clone, Copy)]
pub struct X11Surface {
    window: u32,
    pixmap: u32,
    gc: u32,
    width: u16,
    height: u16,
}

/// Atoms needed for window titles and close requests
struct Atoms {
    wm_protocols: u32,
    wm_delete_window: u32,
    net_wm_name: u32,
    utf8_string: u32,
}

pub struct X11Backend {
    conn: RustConnection,
    root: u32,
    depth: u8,
    visual: u32,
    black_pixel: u32,
    atoms: Atoms,
    /// window -> surface, for repainting on Expose
    windows: HashMap<u32, X11Surface>,
    shutdown: bool,
}

fn conn_err(e: impl std::fmt::Display) -> BackendError {
    BackendError::Connection(e.to_string())
}

impl X11Backend {
    /// Connect to the X server and check that its default visual can show
    /// 32-bit ARGB pixels byte-for-byte.
    pub fn connect(display: Option<&str>) -> Result<Self, BackendError> {
        let (conn, screen_num) =
            x11rb::connect(display).map_err(|e| BackendError::Init(e.to_string()))?;

        let setup = conn.setup();
        let screen = &setup.roots[screen_num];
        let depth = screen.root_depth;

        let bpp = setup
            .pixmap_formats
            .iter()
            .find(|f| f.depth == depth)
            .map(|f| f.bits_per_pixel);
        if !matches!(depth, 24 | 32) || bpp != Some(32) {
            return Err(BackendError::Init(format!(
                "unsupported root visual: depth {} with {:?} bits per pixel",
                depth, bpp
            )));
        }

        let host_order = if cfg!(target_endian = "little") {
            ImageOrder::LSB_FIRST
        } else {
            ImageOrder::MSB_FIRST
        };
        if setup.image_byte_order != host_order {
            return Err(BackendError::Init(
                "X server image byte order differs from host".into(),
            ));
        }

        let root = screen.root;
        let visual = screen.root_visual;
        let black_pixel = screen.black_pixel;
        info!(
            "Connected to X server, screen {}, root window {}, depth {}",
            screen_num, root, depth
        );

        let atoms = Atoms {
            wm_protocols: intern(&conn, b"WM_PROTOCOLS")?,
            wm_delete_window: intern(&conn, b"WM_DELETE_WINDOW")?,
            net_wm_name: intern(&conn, b"_NET_WM_NAME")?,
            utf8_string: intern(&conn, b"UTF8_STRING")?,
        };

        Ok(Self {
            conn,
            root,
            depth,
            visual,
            black_pixel,
            atoms,
            windows: HashMap::new(),
            shutdown: false,
        })
    }

    fn create_resources(&mut self, title: &str, width: u16, height: u16) -> Result<X11Surface, String> {
        let window = self.conn.generate_id().map_err(|e| e.to_string())?;
        let pixmap = self.conn.generate_id().map_err(|e| e.to_string())?;
        let gc = self.conn.generate_id().map_err(|e| e.to_string())?;

        let aux = CreateWindowAux::new()
            .background_pixel(self.black_pixel)
            .event_mask(EventMask::EXPOSURE | EventMask::STRUCTURE_NOTIFY);
        self.conn
            .create_window(
                self.depth,
                window,
                self.root,
                0,
                0,
                width,
                height,
                0,
                WindowClass::INPUT_OUTPUT,
                self.visual,
                &aux,
            )
            .map_err(|e| e.to_string())?
            .check()
            .map_err(|e| e.to_string())?;

        let pixmap_created = self
            .conn
            .create_pixmap(self.depth, pixmap, window, width, height)
            .map_err(|e| e.to_string())
            .and_then(|cookie| cookie.check().map_err(|e| e.to_string()));
        if let Err(e) = pixmap_created {
            self.discard(window, None, None);
            return Err(e);
        }

        let mut gc_created = false;
        let mut set_up = || -> Result<(), x11rb::errors::ConnectionError> {
            self.conn
                .change_property8(PropMode::REPLACE, window, AtomEnum::WM_NAME, AtomEnum::STRING, title.as_bytes())?;
            self.conn.change_property8(
                PropMode::REPLACE,
                window,
                self.atoms.net_wm_name,
                self.atoms.utf8_string,
                title.as_bytes(),
            )?;
            self.conn.change_property32(
                PropMode::REPLACE,
                window,
                self.atoms.wm_protocols,
                AtomEnum::ATOM,
                &[self.atoms.wm_delete_window],
            )?;
            self.conn
                .create_gc(gc, pixmap, &CreateGCAux::new().foreground(self.black_pixel))?;
            gc_created = true;
            // Start from black rather than undefined pixmap contents
            self.conn.poly_fill_rectangle(
                pixmap,
                gc,
                &[Rectangle {
                    x: 0,
                    y: 0,
                    width,
                    height,
                }],
            )?;
            self.conn.map_window(window)?;
            self.conn.flush()?;
            Ok(())
        };
        if let Err(e) = set_up() {
            self.discard(window, Some(pixmap), gc_created.then_some(gc));
            return Err(e.to_string());
        }

        Ok(X11Surface {
            window,
            pixmap,
            gc,
            width,
            height,
        })
    }

    /// Best-effort release of a partially built surface
    fn discard(&self, window: u32, pixmap: Option<u32>, gc: Option<u32>) {
        let freed = || -> Result<(), x11rb::errors::ConnectionError> {
            if let Some(gc) = gc {
                self.conn.free_gc(gc)?;
            }
            if let Some(pixmap) = pixmap {
                self.conn.free_pixmap(pixmap)?;
            }
            self.conn.destroy_window(window)?;
            self.conn.flush()
        };
        if let Err(e) = freed() {
            warn!("Failed to free resources of window {}: {}", window, e);
        }
    }

    fn copy_to_window(&self, surface: &X11Surface) -> Result<(), BackendError> {
        self.conn
            .copy_area(
                surface.pixmap,
                surface.window,
                surface.gc,
                0,
                0,
                0,
                0,
                surface.width,
                surface.height,
            )
            .map_err(conn_err)?;
        Ok(())
    }
}

fn intern(conn: &RustConnection, name: &[u8]) -> Result<u32, BackendError> {
    let reply = conn
        .intern_atom(false, name)
        .map_err(|e| BackendError::Init(e.to_string()))?
        .reply()
        .map_err(|e| BackendError::Init(e.to_string()))?;
    Ok(reply.atom)
}

impl PresentationBackend for X11Backend {
    type Surface = X11Surface;

    fn create_surface(
        &mut self,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<X11Surface, BackendError> {
        let fail = |reason: String| BackendError::CreateSurface {
            width,
            height,
            reason,
        };
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(fail(format!("dimensions must be within 1..={}", MAX_DIMENSION)));
        }

        let surface = self
            .create_resources(title, width as u16, height as u16)
            .map_err(fail)?;
        debug!("Created X11 window {} for '{}'", surface.window, title);
        self.windows.insert(surface.window, surface);
        Ok(surface)
    }

    fn upload(&mut self, surface: &mut X11Surface, pixels: &[u8]) -> Result<(), BackendError> {
        let expected = frame_len(surface.width.into(), surface.height.into());
        if pixels.len() != expected {
            return Err(BackendError::SizeMismatch {
                expected,
                got: pixels.len(),
            });
        }

        // Split into row strips that fit within one request
        let stride = surface.width as usize * jw_ipc::BYTES_PER_PIXEL;
        let max_payload = self
            .conn
            .maximum_request_bytes()
            .saturating_sub(PUT_IMAGE_HEADER);
        let rows_per_strip = (max_payload / stride).max(1);

        for (i, strip) in pixels.chunks(rows_per_strip * stride).enumerate() {
            let rows = strip.len() / stride;
            let y = i * rows_per_strip;
            self.conn
                .put_image(
                    ImageFormat::Z_PIXMAP,
                    surface.pixmap,
                    surface.gc,
                    surface.width,
                    rows as u16,
                    0,
                    y as i16,
                    0,
                    self.depth,
                    strip,
                )
                .map_err(conn_err)?;
        }
        trace!("Uploaded {} bytes to pixmap {}", pixels.len(), surface.pixmap);
        Ok(())
    }

    fn present(&mut self, surface: &mut X11Surface) -> Result<(), BackendError> {
        self.copy_to_window(surface)?;
        self.conn.flush().map_err(conn_err)?;
        Ok(())
    }

    fn drain_events(&mut self) -> Result<EventStatus, BackendError> {
        while let Some(event) = self.conn.poll_for_event().map_err(conn_err)? {
            match event {
                Event::Expose(e) if e.count == 0 => {
                    if let Some(surface) = self.windows.get(&e.window) {
                        self.copy_to_window(surface)?;
                    }
                }
                Event::ClientMessage(e) => {
                    let data = e.data.as_data32();
                    if e.format == 32
                        && e.type_ == self.atoms.wm_protocols
                        && data[0] == self.atoms.wm_delete_window
                    {
                        info!("Window {} closed, shutting down", e.window);
                        self.shutdown = true;
                    }
                }
                Event::Error(e) => {
                    warn!("X11 error: {:?}", e);
                }
                other => {
                    trace!("Ignoring X11 event: {:?}", other);
                }
            }
        }
        self.conn.flush().map_err(conn_err)?;

        Ok(if self.shutdown {
            EventStatus::Shutdown
        } else {
            EventStatus::Running
        })
    }
}
