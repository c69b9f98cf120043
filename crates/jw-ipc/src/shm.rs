//! Named POSIX shared-memory canvases.
//!
//! The server creates a segment per surface and hands its name to the
//! client, which opens and maps the same segment. Neither side synchronizes
//! access: a reader copying while the writer draws can observe a torn frame.

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use thiserror::Error;
use tracing::{debug, warn};

/// Fixed pixel layout: one native-endian ARGB8888 `u32` per pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Name of the canvas segment belonging to a surface
pub fn buffer_name(prefix: &str, surface_id: u32) -> String {
    format!("{prefix}{surface_id}")
}

/// Byte size of a `width` x `height` canvas, `None` on overflow
pub fn canvas_size(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(BYTES_PER_PIXEL)
}

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory segment must not be empty")]
    ZeroSize,
    #[error("invalid segment name {0:?}: must be '/' followed by a non-empty name without '/'")]
    InvalidName(String),
    #[error("{op} failed for {name}: {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: Errno,
    },
    #[error("{op} failed for {name}: {source}")]
    Io {
        op: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mmap failed for {name}: {source}")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("segment {name} holds {actual} bytes, expected at least {expected}")]
    TooSmall {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Remove a segment name. A name that is already gone is not an error.
pub fn unlink(name: &str) -> Result<(), ShmError> {
    match shm_unlink(name) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(source) => Err(ShmError::Os {
            op: "shm_unlink",
            name: name.to_string(),
            source,
        }),
    }
}

/// A mapped shared-memory segment
pub struct SharedBuffer {
    name: String,
    map: MmapMut,
    /// Kept open so the segment's current size can be re-checked
    file: File,
    /// Whether this side created the segment and therefore unlinks it
    owner: bool,
}

impl SharedBuffer {
    /// Create a fresh zero-filled segment of exactly `size` bytes.
    ///
    /// Any stale segment of the same name is unlinked first, so neither old
    /// contents nor an old size survive a restart.
    pub fn create(name: &str, size: usize) -> Result<Self, ShmError> {
        validate_name(name)?;
        if size == 0 {
            return Err(ShmError::ZeroSize);
        }
        unlink(name)?;

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|source| ShmError::Os {
            op: "shm_open",
            name: name.to_string(),
            source,
        })?;

        let file = File::from(fd);
        let mapped = file
            .set_len(size as u64)
            .map_err(|source| ShmError::Io {
                op: "ftruncate",
                name: name.to_string(),
                source,
            })
            .and_then(|()| map_file(name, &file, size));

        match mapped {
            Ok(map) => {
                debug!("Created shared buffer {} ({} bytes)", name, size);
                Ok(Self {
                    name: name.to_string(),
                    map,
                    file,
                    owner: true,
                })
            }
            Err(e) => {
                // Don't leave a half-initialized name behind
                let _ = unlink(name);
                Err(e)
            }
        }
    }

    /// Open and map an existing segment created by another process
    pub fn open(name: &str, size: usize) -> Result<Self, ShmError> {
        validate_name(name)?;
        if size == 0 {
            return Err(ShmError::ZeroSize);
        }
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|source| ShmError::Os {
            op: "shm_open",
            name: name.to_string(),
            source,
        })?;

        let file = File::from(fd);
        ensure_len(name, &file, size)?;

        let map = map_file(name, &file, size)?;
        Ok(Self {
            name: name.to_string(),
            map,
            file,
            owner: false,
        })
    }

    /// Check that the segment still backs the whole mapping.
    ///
    /// Any process holding the name can `ftruncate` it, and touching mapped
    /// pages past the new end raises SIGBUS. Call this right before reading.
    /// A shrink between this check and the read is still possible; only
    /// cooperating clients are protected.
    pub fn check_len(&self) -> Result<(), ShmError> {
        ensure_len(&self.name, &self.file, self.map.len())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Read view over the whole segment
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// Write view over the whole segment
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Fill every pixel with one ARGB value
    pub fn fill(&mut self, argb: u32) {
        let px = argb.to_ne_bytes();
        for chunk in self.map.chunks_exact_mut(BYTES_PER_PIXEL) {
            chunk.copy_from_slice(&px);
        }
    }

    /// Unmap without unlinking, for when a newer segment already reuses the name
    pub fn detach(mut self) {
        self.owner = false;
    }

    /// Unmap, and unlink the name if this side created it
    pub fn release(mut self) -> Result<(), ShmError> {
        let result = if self.owner { unlink(&self.name) } else { Ok(()) };
        self.owner = false;
        result
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = unlink(&self.name) {
                warn!("Failed to unlink shared buffer: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("name", &self.name)
            .field("len", &self.map.len())
            .field("owner", &self.owner)
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), ShmError> {
    match name.strip_prefix('/') {
        Some(rest) if !rest.is_empty() && !rest.contains('/') => Ok(()),
        _ => Err(ShmError::InvalidName(name.to_string())),
    }
}

fn ensure_len(name: &str, file: &File, size: usize) -> Result<(), ShmError> {
    let metadata = file.metadata().map_err(|source| ShmError::Io {
        op: "fstat",
        name: name.to_string(),
        source,
    })?;
    let actual = usize::try_from(metadata.len()).unwrap_or(0);
    if actual < size {
        // Touching pages past the end of the segment would SIGBUS
        return Err(ShmError::TooSmall {
            name: name.to_string(),
            expected: size,
            actual,
        });
    }
    Ok(())
}

fn map_file(name: &str, file: &File, size: usize) -> Result<MmapMut, ShmError> {
    // SAFETY: the segment is at least `size` bytes long (sized by us or
    // checked with fstat). Other processes may write concurrently, which
    // callers accept as torn pixel data rather than memory unsafety.
    unsafe { MmapOptions::new().len(size).map_mut(file) }.map_err(|source| ShmError::Map {
        name: name.to_string(),
        source,
    })
}
