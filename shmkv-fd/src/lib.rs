//! Descriptor plumbing for memory-resident stores shared between processes.
//!
//! A store that lives in anonymous shared memory has no path that another process could reopen.
//! The only way to reach it is through a file descriptor, so everything here revolves around an
//! owned descriptor ([`SharedFd`]), asking the kernel about it ([`stat`]), moving it to another
//! process ([`pass`]) and telling a child process where to ask for it ([`env`]).
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

pub mod env;
pub mod pass;
mod stat;

pub use env::BrokerEnv;
pub use stat::Stat;

/// An owned file descriptor referring to a shared memory object or a regular file.
///
/// Dropping it closes the descriptor. Other descriptors referring to the same object, in this or
/// another process, are unaffected.
#[derive(Debug)]
pub struct SharedFd {
    fd: OwnedFd,
}

impl SharedFd {
    /// Create an anonymous memory file of exactly `len` bytes.
    ///
    /// The file is sealed against growing and shrinking, its size is fixed for its lifetime.
    pub fn anonymous(name: &str, len: u64) -> Result<Self, io::Error> {
        let file = memfile::MemFile::create_sealable(name)?;
        // Safety: `into_raw_fd` hands us the sole ownership of the descriptor.
        let this = SharedFd {
            fd: unsafe { OwnedFd::from_raw_fd(file.into_raw_fd()) },
        };

        this.set_len(len)?;
        this.add_seals(libc::F_SEAL_GROW | libc::F_SEAL_SHRINK | libc::F_SEAL_SEAL)?;
        Ok(this)
    }

    /// Take ownership of a descriptor, typically one received from another process.
    pub fn from_owned(fd: OwnedFd) -> Self {
        SharedFd { fd }
    }

    /// Check if the descriptor refers to an anonymous memory file.
    ///
    /// Only memory files support seals, any other object rejects the query.
    pub fn is_anonymous(&self) -> bool {
        -1 != unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_GET_SEALS) }
    }

    pub fn stat(&self) -> Result<Stat, io::Error> {
        stat::fstat(self.fd.as_raw_fd())
    }

    /// The current size of the object, in bytes.
    pub fn len(&self) -> Result<u64, io::Error> {
        let size = self.stat()?.st_size;
        u64::try_from(size).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
    }

    /// Change the size of the object.
    ///
    /// This fails with `EPERM` on a sealed anonymous file.
    pub fn set_len(&self, len: u64) -> Result<(), io::Error> {
        let len = libc::off_t::try_from(len)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        loop {
            if 0 == unsafe { libc::ftruncate(self.fd.as_raw_fd(), len) } {
                return Ok(());
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Duplicate the descriptor, the copy refers to the same open file description.
    pub fn try_clone(&self) -> Result<Self, io::Error> {
        Ok(SharedFd {
            fd: self.fd.try_clone()?,
        })
    }

    fn add_seals(&self, seals: libc::c_int) -> Result<(), io::Error> {
        if -1 == unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_ADD_SEALS, seals) } {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl From<File> for SharedFd {
    fn from(file: File) -> Self {
        SharedFd { fd: file.into() }
    }
}

impl AsRawFd for SharedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for SharedFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl IntoRawFd for SharedFd {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::SharedFd;

    #[test]
    fn anonymous_is_sealed() {
        let fd = SharedFd::anonymous("sealed", 0x2000).unwrap();
        assert!(fd.is_anonymous());
        assert_eq!(fd.len().unwrap(), 0x2000);
        assert!(fd.set_len(0x4000).is_err(), "grow must be rejected");
        assert!(fd.set_len(0x1000).is_err(), "shrink must be rejected");
    }

    #[test]
    fn regular_file_is_not_anonymous() {
        let file = tempfile::tempfile().unwrap();
        let fd = SharedFd::from(file);
        assert!(!fd.is_anonymous());
        fd.set_len(0x100).unwrap();
        assert_eq!(fd.len().unwrap(), 0x100);
    }

    #[test]
    fn clone_refers_to_same_object() {
        let fd = SharedFd::anonymous("clone", 0x1000).unwrap();
        let copy = fd.try_clone().unwrap();
        let (a, b) = (fd.stat().unwrap(), copy.stat().unwrap());
        assert_eq!((a.st_dev, a.st_ino), (b.st_dev, b.st_ino));
    }
}
