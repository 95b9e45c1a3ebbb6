//! File-backed mappings shared between the daemon and its clients.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::ShmError;

/// One mapped shared-memory file.
///
/// The creating side owns the file and unlinks it on drop; attaching sides
/// only unmap. Both sides get identical read/write mappings, the producer /
/// consumer split is enforced by the protocol layered on top.
pub struct ShmRegion {
    map: MmapMut,
    path: PathBuf,
    owned: bool,
}

impl ShmRegion {
    /// Create and map a fresh region of `len` bytes. Fails if the file
    /// already exists, which catches stale regions from a crashed daemon.
    pub fn create(path: &Path, len: usize) -> Result<Self, ShmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map,
            path: path.to_path_buf(),
            owned: true,
        })
    }

    /// Attach to an existing region.
    pub fn open(path: &Path) -> Result<Self, ShmError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map,
            path: path.to_path_buf(),
            owned: false,
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
