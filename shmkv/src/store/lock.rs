//! Inter-process locks on a store's segments.
//!
//! The kernel side is a POSIX record lock over the whole file. These belong to the process, not
//! to a descriptor or a thread. They are released when the process dies but also when it closes
//! *any* descriptor of the file. Within the process the locks here are recursive: they count
//! acquisitions and only talk to the kernel on the first acquisition and last release.
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LockType {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct Counts {
    shared: usize,
    exclusive: usize,
    /// A thread waits for the kernel, without holding the counts.
    waiting: bool,
    /// A thread waits for the shared acquisitions of the process to drain.
    upgrading: bool,
}

/// A recursive shared/exclusive record lock.
///
/// A disabled lock keeps its counts but never locks the file. The counts are never held across a
/// blocking `fcntl`, so non-blocking acquisitions stay non-blocking while another thread waits.
/// A blocking exclusive acquisition waits for the shared ones of other threads to end before it
/// asks the kernel: converting the record lock in place could deadlock against another process
/// doing the same, and releasing it first would expose readers of this process.
pub(crate) struct FileLock {
    enabled: bool,
    counts: Mutex<Counts>,
    changed: Condvar,
}

impl FileLock {
    pub(crate) fn new(enabled: bool) -> Self {
        FileLock {
            enabled,
            counts: Mutex::default(),
            changed: Condvar::new(),
        }
    }

    /// Block until the lock is held.
    ///
    /// A thread holding only the shared lock gets the exclusive one only if no other process
    /// reads, otherwise it waits for itself.
    pub(crate) fn lock(&self, fd: BorrowedFd<'_>, kind: LockType) -> Result<(), io::Error> {
        match kind {
            LockType::Shared => self.lock_shared(fd),
            LockType::Exclusive => self.lock_exclusive(fd),
        }
    }

    /// Try to take the lock, `false` if it is contended. Never blocks on the kernel.
    pub(crate) fn try_lock(&self, fd: BorrowedFd<'_>, kind: LockType) -> Result<bool, io::Error> {
        let mut counts = self.counts.lock();

        match kind {
            LockType::Shared => {
                if counts.exclusive > 0 || (counts.shared > 0 && !counts.upgrading) {
                    counts.shared += 1;
                    return Ok(true);
                }
                if counts.waiting || counts.upgrading {
                    return Ok(false);
                }
                if !self.set(fd, libc::F_RDLCK, false)? {
                    return Ok(false);
                }
                counts.shared += 1;
            }
            LockType::Exclusive => {
                if counts.exclusive > 0 {
                    counts.exclusive += 1;
                    return Ok(true);
                }
                if counts.waiting || counts.upgrading {
                    return Ok(false);
                }
                // Converts a held read lock atomically, or fails without touching it.
                if !self.set(fd, libc::F_WRLCK, false)? {
                    return Ok(false);
                }
                counts.exclusive += 1;
            }
        }

        Ok(true)
    }

    fn lock_shared(&self, fd: BorrowedFd<'_>) -> Result<(), io::Error> {
        let mut counts = self.counts.lock();

        loop {
            if counts.exclusive > 0 || (counts.shared > 0 && !counts.upgrading) {
                counts.shared += 1;
                return Ok(());
            }
            if !counts.waiting && !counts.upgrading {
                break;
            }
            self.changed.wait(&mut counts);
        }

        if self.set(fd, libc::F_RDLCK, false)? {
            counts.shared += 1;
            return Ok(());
        }

        counts.waiting = true;
        drop(counts);
        let locked = self.set(fd, libc::F_RDLCK, true);

        let mut counts = self.counts.lock();
        counts.waiting = false;
        if locked.is_ok() {
            counts.shared += 1;
        }
        self.changed.notify_all();
        locked.map(drop)
    }

    fn lock_exclusive(&self, fd: BorrowedFd<'_>) -> Result<(), io::Error> {
        let mut counts = self.counts.lock();

        loop {
            if counts.exclusive > 0 {
                counts.exclusive += 1;
                return Ok(());
            }
            if !counts.waiting {
                if self.set(fd, libc::F_WRLCK, false)? {
                    counts.exclusive += 1;
                    counts.upgrading = false;
                    self.changed.notify_all();
                    return Ok(());
                }
                if counts.shared == 0 {
                    break;
                }
                counts.upgrading = true;
            }
            self.changed.wait(&mut counts);
        }

        counts.waiting = true;
        drop(counts);
        let locked = self.set(fd, libc::F_WRLCK, true);

        let mut counts = self.counts.lock();
        counts.waiting = false;
        counts.upgrading = false;
        if locked.is_ok() {
            counts.exclusive += 1;
        }
        self.changed.notify_all();
        locked.map(drop)
    }

    /// Drop one acquisition, `false` if there was none to drop. Never blocks on the kernel.
    pub(crate) fn unlock(&self, fd: BorrowedFd<'_>, kind: LockType) -> Result<bool, io::Error> {
        let mut counts = self.counts.lock();

        match kind {
            LockType::Shared => {
                if counts.shared == 0 {
                    return Ok(false);
                }
                counts.shared -= 1;
                if counts.shared == 0 && counts.exclusive == 0 {
                    self.set(fd, libc::F_UNLCK, false)?;
                }
            }
            LockType::Exclusive => {
                if counts.exclusive == 0 {
                    return Ok(false);
                }
                counts.exclusive -= 1;
                if counts.exclusive == 0 {
                    // Fall back to the shared lock still held within the process.
                    let to = if counts.shared > 0 {
                        libc::F_RDLCK
                    } else {
                        libc::F_UNLCK
                    };
                    self.set(fd, to, false)?;
                }
            }
        }

        self.changed.notify_all();
        Ok(true)
    }

    /// Forget all acquisitions, without unlocking. For when the descriptor is closed.
    pub(crate) fn reset(&self) {
        let mut counts = self.counts.lock();
        counts.shared = 0;
        counts.exclusive = 0;
        self.changed.notify_all();
    }

    /// `false` only for contention when not waiting.
    fn set(&self, fd: BorrowedFd<'_>, kind: libc::c_int, wait: bool) -> Result<bool, io::Error> {
        if !self.enabled {
            return Ok(true);
        }

        set_record_lock(fd, kind, wait)
    }
}

pub(crate) fn set_record_lock(
    fd: BorrowedFd<'_>,
    kind: libc::c_int,
    wait: bool,
) -> Result<bool, io::Error> {
    // Safety: zero is a valid bit pattern for `flock`.
    let mut lock: libc::flock = unsafe { core::mem::zeroed() };
    lock.l_type = kind as _;
    lock.l_whence = libc::SEEK_SET as _;
    lock.l_start = 0;
    // Zero length extends to the end of the file, whatever its size.
    lock.l_len = 0;

    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };

    loop {
        if 0 == unsafe { libc::fcntl(fd.as_raw_fd(), cmd, &lock) } {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN | libc::EACCES) if !wait => return Ok(false),
            _ => return Err(err),
        }
    }
}

#[derive(Default)]
struct Holder {
    thread: Option<ThreadId>,
    depth: usize,
}

/// Makes an exclusive lock visible between threads of the same process.
///
/// Record locks never conflict within a process, so each acquisition first passes this
/// recursive per-thread gate.
#[derive(Default)]
pub(crate) struct ThreadGate {
    holder: Mutex<Holder>,
    released: Condvar,
}

impl ThreadGate {
    /// Wait for the gate. `true` if this is the outermost acquisition of the thread.
    pub(crate) fn enter(&self) -> bool {
        let me = thread::current().id();
        let mut holder = self.holder.lock();

        loop {
            match holder.thread {
                None => {
                    holder.thread = Some(me);
                    holder.depth = 1;
                    return true;
                }
                Some(owner) if owner == me => {
                    holder.depth += 1;
                    return false;
                }
                Some(_) => self.released.wait(&mut holder),
            }
        }
    }

    /// Like `enter`, but `None` if another thread is inside.
    pub(crate) fn try_enter(&self) -> Option<bool> {
        let me = thread::current().id();
        let mut holder = self.holder.lock();

        match holder.thread {
            None => {
                holder.thread = Some(me);
                holder.depth = 1;
                Some(true)
            }
            Some(owner) if owner == me => {
                holder.depth += 1;
                Some(false)
            }
            Some(_) => None,
        }
    }

    /// Leave the gate. `Some(true)` if this was the outermost acquisition, `None` if the calling
    /// thread was not inside.
    pub(crate) fn leave(&self) -> Option<bool> {
        let me = thread::current().id();
        let mut holder = self.holder.lock();

        if holder.thread != Some(me) {
            return None;
        }

        holder.depth -= 1;
        if holder.depth > 0 {
            return Some(false);
        }

        holder.thread = None;
        drop(holder);
        self.released.notify_one();
        Some(true)
    }
}
