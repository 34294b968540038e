//! Read-only filesystem collaborator.
//!
//! The on-disk format is somebody else's problem; the kernel only ever
//! mounts, opens a program image by name, reads it chunk-wise, and closes
//! it. Here that contract runs over an in-memory name-to-image registry
//! populated at boot.

use alloc::borrow::ToOwned;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, info};

use crate::constants::{FS_READ_CHUNK, MAX_FILE_SIZE};
use crate::error::KernelError;

pub struct FileRegistry {
    mounted: bool,
    files: BTreeMap<String, Vec<u8>>,
}

/// An open read cursor.
pub(crate) struct OpenFile<'a> {
    data: &'a [u8],
    pos: usize,
}

impl FileRegistry {
    pub(crate) fn new() -> FileRegistry {
        FileRegistry {
            mounted: false,
            files: BTreeMap::new(),
        }
    }

    /// Register a program image under `name`. Oversized images are refused
    /// the same way the staging window would refuse them.
    pub fn install(&mut self, name: &str, image: Vec<u8>) -> Result<(), KernelError> {
        if image.len() as u64 > MAX_FILE_SIZE as u64 {
            return Err(KernelError::FileNotFound);
        }
        debug!("fs: install {} ({} bytes)", name, image.len());
        self.files.insert(name.to_owned(), image);
        Ok(())
    }

    pub(crate) fn mount(&mut self) {
        if !self.mounted {
            self.mounted = true;
            info!("fs: mounted, {} images", self.files.len());
        }
    }

    pub(crate) fn open(&self, name: &str) -> Result<OpenFile<'_>, KernelError> {
        if !self.mounted {
            return Err(KernelError::FileNotFound);
        }
        let data = self.files.get(name).ok_or(KernelError::FileNotFound)?;
        Ok(OpenFile { data, pos: 0 })
    }
}

impl<'a> OpenFile<'a> {
    pub(crate) fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Read up to one chunk; an empty slice means end of file.
    pub(crate) fn read_chunk(&mut self) -> &'a [u8] {
        let n = (FS_READ_CHUNK as usize).min(self.data.len() - self.pos);
        let chunk = &self.data[self.pos..self.pos + n];
        self.pos += n;
        chunk
    }
}
