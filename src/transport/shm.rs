//! Shared memory region transport
//!
//! Shared-memory channels carry no messages and raise no wakeups; they only
//! expose a mapped region both sides can address.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

#[cfg(target_os = "linux")]
use std::ffi::CString;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

#[cfg(target_os = "linux")]
use nix::{
    sys::memfd::{memfd_create, MemFdCreateFlag},
    unistd::ftruncate,
};

use super::traits::Transport;
use crate::error::{NeuronError, Result};

/// Configuration for a shared region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionConfig {
    /// Name, visible in `/proc/<pid>/fd` for memfd regions
    pub name: String,
    /// Size in bytes
    pub size: usize,
}

impl RegionConfig {
    /// Create a region configuration
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(NeuronError::invalid_parameter(
                "size",
                "Region size cannot be zero",
            ));
        }
        if self.name.contains('\0') {
            return Err(NeuronError::invalid_parameter(
                "name",
                "Name contains null bytes",
            ));
        }
        Ok(())
    }
}

/// A mapped memory region used as a `Bidirectional` shared-memory channel
#[derive(Debug)]
pub struct SharedRegion {
    name: String,
    size: usize,
    mmap: Mutex<MmapMut>,
    /// memfd backing; `None` for anonymous mappings
    fd: Option<OwnedFd>,
}

impl SharedRegion {
    /// Map a new region
    pub fn new(config: RegionConfig) -> Result<Self> {
        config.validate()?;
        let (mmap, fd) = Self::map(&config)?;

        Ok(Self {
            name: config.name,
            size: config.size,
            mmap: Mutex::new(mmap),
            fd,
        })
    }

    #[cfg(target_os = "linux")]
    fn map(config: &RegionConfig) -> Result<(MmapMut, Option<OwnedFd>)> {
        let name = CString::new(config.name.clone())
            .map_err(|_| NeuronError::invalid_parameter("name", "Name contains null bytes"))?;

        let fd = memfd_create(&name, MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(std::io::Error::from)?;
        ftruncate(&fd, config.size as i64).map_err(std::io::Error::from)?;

        // SAFETY: the memfd is private to this process until its fd is shared
        let mmap = unsafe { MmapOptions::new().len(config.size).map_mut(&fd)? };
        Ok((mmap, Some(fd)))
    }

    #[cfg(not(target_os = "linux"))]
    fn map(config: &RegionConfig) -> Result<(MmapMut, Option<OwnedFd>)> {
        let mmap = MmapOptions::new().len(config.size).map_anon()?;
        Ok((mmap, None))
    }

    /// Get the name of the region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of the region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Backing file descriptor, for handing the region to a peer
    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(NeuronError::invalid_parameter(
                "offset",
                format!("range {}+{} outside region of {}", offset, len, self.size),
            )),
        }
    }

    /// Copy `data` into the region at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        self.mmap.lock()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy bytes at `offset` into `out`
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check(offset, out.len())?;
        out.copy_from_slice(&self.mmap.lock()[offset..offset + out.len()]);
        Ok(())
    }

    /// Run `f` with exclusive access to the whole region
    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.mmap.lock()[..])
    }
}

impl Transport for SharedRegion {
    fn region(&self) -> Option<&SharedRegion> {
        Some(self)
    }
}
