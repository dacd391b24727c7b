//! Pass descriptors to another process over a Unix stream socket.
//!
//! The descriptors travel as `SCM_RIGHTS` *control* data, attached to the first byte of a regular
//! message. The kernel installs fresh descriptors in the receiving process which refer to the
//! same open file descriptions as the sender's. The sender keeps its own descriptors; the
//! receiver owns the new ones and must close them itself.
use std::io::{self, Write};
use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// The most descriptors a single message may carry.
pub const MAX_FDS: usize = 4;

/// A control buffer with the alignment `cmsghdr` requires.
struct Control {
    buf: Vec<u64>,
    len: usize,
}

impl Control {
    fn for_fds(count: usize) -> Self {
        let data_len = (count * size_of::<RawFd>()) as u32;
        // Safety: pure size computation.
        let len = unsafe { libc::CMSG_SPACE(data_len) } as usize;
        Control {
            buf: vec![0; len.div_ceil(size_of::<u64>())],
            len,
        }
    }
}

/// Send `data`, with `fds` attached to its first byte.
///
/// The whole of `data` is written before returning, a short `sendmsg` is completed with plain
/// writes that carry no further descriptors.
pub fn send_with_fds(
    sock: &UnixStream,
    data: &[u8],
    fds: &[BorrowedFd<'_>],
) -> Result<(), io::Error> {
    if data.is_empty() || fds.len() > MAX_FDS {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }

    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // Safety: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { core::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;

    let mut control = Control::for_fds(raw.len());
    if !raw.is_empty() {
        msghdr.msg_control = control.buf.as_mut_ptr().cast();
        msghdr.msg_controllen = control.len as _;

        // Safety: the control buffer is sized with CMSG_SPACE for `raw.len()` descriptors.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msghdr);
            if cmsg.is_null() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "control buffer too small for SCM_RIGHTS",
                ));
            }

            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN((raw.len() * size_of::<RawFd>()) as u32) as _;
            core::ptr::copy_nonoverlapping(
                raw.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                raw.len(),
            );
        }
    }

    let sent = loop {
        // Safety: msghdr points to live iov/control buffers.
        let n = unsafe { libc::sendmsg(sock.as_raw_fd(), &msghdr, libc::MSG_NOSIGNAL) };
        if n >= 0 {
            break n as usize;
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    };

    if sent == 0 {
        return Err(io::Error::from(io::ErrorKind::WriteZero));
    }

    if sent < data.len() {
        let mut sock = sock;
        sock.write_all(&data[sent..])?;
    }

    Ok(())
}

/// Receive into `buf`, collecting any descriptors attached to the received bytes.
///
/// Returns the number of bytes read (`0` at end of stream) and the descriptors, owned by the
/// caller from here on. Received descriptors are close-on-exec.
pub fn recv_with_fds(
    sock: &UnixStream,
    buf: &mut [u8],
) -> Result<(usize, Vec<OwnedFd>), io::Error> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let mut control = Control::for_fds(MAX_FDS);
    // Safety: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { core::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.buf.as_mut_ptr().cast();
    msghdr.msg_controllen = control.len as _;

    let received = loop {
        // Safety: msghdr points to live iov/control buffers.
        let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msghdr, libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n as usize;
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    };

    // Take ownership first, so that they are closed on every error path below.
    let fds = collect_fds(&msghdr);

    if msghdr.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "too many descriptors attached to message",
        ));
    }

    Ok((received, fds))
}

fn collect_fds(msghdr: &libc::msghdr) -> Vec<OwnedFd> {
    let mut out = Vec::new();
    // Safety: msghdr points at a valid control buffer filled in by the kernel.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let base_len = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize).saturating_sub(base_len) / size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    // The kernel installed these for us, nobody else owns them.
                    out.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }
    out
}
