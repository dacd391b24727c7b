use std::io;
use std::os::fd::RawFd;

/// *Fixed* type, not platform dependent.
type OffT = i64;

/// The part of `struct stat` that identifies and sizes a shared object.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_size: OffT,
}

impl Stat {
    /// Two descriptors refer to the same object iff device and inode agree.
    pub fn same_object(&self, other: &Stat) -> bool {
        self.st_dev == other.st_dev && self.st_ino == other.st_ino
    }
}

pub(crate) fn fstat(fd: RawFd) -> Result<Stat, io::Error> {
    let mut uninit = core::mem::MaybeUninit::<libc::stat>::zeroed();
    // Safety: passing the correct pointer to a struct of libc::stat.
    if -1 == unsafe { libc::fstat(fd, uninit.as_mut_ptr()) } {
        return Err(io::Error::last_os_error());
    }

    // Safety: always initialized on return with success.
    let lstat = unsafe { uninit.assume_init() };
    Ok(Stat {
        st_dev: lstat.st_dev as u64,
        st_ino: lstat.st_ino as u64,
        st_mode: lstat.st_mode as u32,
        st_size: lstat.st_size as OffT,
    })
}
