use core::sync::atomic::AtomicU32;
use std::io;
use std::os::fd::AsRawFd;

use memmap2::MmapRaw;
use shmkv_fd::SharedFd;

/// A shared writable mapping of a whole descriptor.
///
/// Reads and writes go through raw pointers. Callers hold the inter-process lock that orders them
/// against writers in other processes.
pub(crate) struct Segment {
    map: MmapRaw,
}

impl Segment {
    /// Map all of `fd`, which must not be empty.
    pub(crate) fn map(fd: &SharedFd) -> Result<Self, io::Error> {
        let len = fd.len()?;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "can not map an empty segment",
            ));
        }

        let map = MmapRaw::map_raw(fd.as_raw_fd())?;
        Ok(Segment { map })
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Copy `len` bytes at `offset`, clamped to the mapping.
    pub(crate) fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let end = offset.saturating_add(len).min(self.len());
        let start = offset.min(end);
        let mut out = vec![0; end - start];
        // Safety: in bounds of the live mapping.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.map.as_ptr().add(start),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        out
    }

    /// Write `bytes` at `offset`, `false` if they do not fit.
    pub(crate) fn write(&self, offset: usize, bytes: &[u8]) -> bool {
        match offset.checked_add(bytes.len()) {
            Some(end) if end <= self.len() => {}
            _ => return false,
        }

        // Safety: in bounds of the live, writable mapping.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(offset),
                bytes.len(),
            );
        }
        true
    }

    /// A word of the mapping, shared with every other mapping of the same object.
    pub(crate) fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len());
        // Safety: aligned (page aligned base), in bounds, and only ever accessed atomically.
        unsafe { &*self.map.as_mut_ptr().add(offset).cast::<AtomicU32>() }
    }

    pub(crate) fn flush(&self) -> Result<(), io::Error> {
        self.map.flush()
    }
}
