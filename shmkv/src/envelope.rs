//! The unit that carries a store from one process to another.
//!
//! On the wire an envelope is a frame `magic[4] | u32 length | JSON body` with the descriptors
//! attached to its first byte. Everything else about the store, the records and the counters,
//! is reachable through the descriptors.
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

use serde::de::DeserializeOwned;
use serde::Serialize;
use shmkv_fd::pass::{recv_with_fds, send_with_fds};
use shmkv_fd::SharedFd;

use crate::error::{Error, Result};
use crate::{ProcessMode, StoreId};

/// Largest frame body accepted.
pub const MAX_FRAME: usize = 64 * 1024;
const HEADER: usize = 8;

/// A store's identity and descriptors, in transit.
///
/// Whoever holds the envelope owns its descriptors. They are closed when it is dropped unless
/// they were taken out to reconstruct a store.
#[derive(Debug)]
pub struct FdEnvelope {
    id: StoreId,
    mode: ProcessMode,
    data: Option<SharedFd>,
    meta: Option<SharedFd>,
    crypt_key: Option<String>,
}

impl FdEnvelope {
    pub fn new(
        id: StoreId,
        mode: ProcessMode,
        data: Option<SharedFd>,
        meta: Option<SharedFd>,
        crypt_key: Option<String>,
    ) -> Self {
        FdEnvelope {
            id,
            mode,
            data,
            meta,
            // An empty key is no key.
            crypt_key: crypt_key.filter(|key| !key.is_empty()),
        }
    }

    pub fn id(&self) -> &StoreId {
        &self.id
    }

    /// The mode the exporting process holds the store in.
    pub fn mode(&self) -> ProcessMode {
        self.mode
    }

    pub fn crypt_key(&self) -> Option<&str> {
        self.crypt_key.as_deref()
    }

    /// Take the data and metadata descriptors out, both or none.
    pub fn take_descriptors(&mut self) -> Result<(SharedFd, SharedFd)> {
        let name = self.id.name().to_owned();
        let invalid = |reason| Error::InvalidEnvelope {
            id: name.clone(),
            reason,
        };

        match (&self.data, &self.meta) {
            (None, _) => return Err(invalid("data descriptor missing")),
            (_, None) => return Err(invalid("metadata descriptor missing")),
            (Some(data), Some(meta)) => {
                if data.stat().is_err() {
                    return Err(invalid("data descriptor is not open"));
                }
                if meta.stat().is_err() {
                    return Err(invalid("metadata descriptor is not open"));
                }
            }
        }

        match (self.data.take(), self.meta.take()) {
            (Some(data), Some(meta)) => Ok((data, meta)),
            _ => Err(invalid("descriptors missing")),
        }
    }
}

/// Write one frame with `fds` attached.
pub(crate) fn send_frame(
    sock: &UnixStream,
    magic: &[u8; 4],
    body: &impl Serialize,
    fds: &[BorrowedFd<'_>],
) -> Result<()> {
    let body = serde_json::to_vec(body).map_err(|err| Error::Protocol(err.to_string()))?;
    if body.len() > MAX_FRAME {
        return Err(Error::Protocol(format!("frame of {} bytes too large", body.len())));
    }

    let mut frame = Vec::with_capacity(HEADER + body.len());
    frame.extend_from_slice(magic);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);

    send_with_fds(sock, &frame, fds)?;
    Ok(())
}

/// Read one frame and any descriptors that came with it.
///
/// `Ok(None)` if the peer closed the connection before sending anything.
pub(crate) fn recv_frame<T: DeserializeOwned>(
    sock: &UnixStream,
    magic: &[u8; 4],
) -> Result<Option<(T, Vec<OwnedFd>)>> {
    let mut fds = Vec::new();
    let mut header = [0u8; HEADER];

    if !recv_exact(sock, &mut header, &mut fds)? {
        return Ok(None);
    }

    if &header[..4] != magic {
        return Err(Error::Protocol(format!("bad frame magic {:?}", &header[..4])));
    }

    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_FRAME {
        return Err(Error::Protocol(format!("frame of {len} bytes too large")));
    }

    let mut body = vec![0; len];
    if !recv_exact(sock, &mut body, &mut fds)? {
        return Err(Error::Protocol("connection closed within a frame".into()));
    }

    let body = serde_json::from_slice(&body).map_err(|err| Error::Protocol(err.to_string()))?;
    Ok(Some((body, fds)))
}

/// Fill `buf`, `false` if the stream ended before the first byte.
fn recv_exact(sock: &UnixStream, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<bool> {
    let mut filled = 0;

    while filled < buf.len() {
        let (n, received) = recv_with_fds(sock, &mut buf[filled..])?;
        fds.extend(received);

        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        filled += n;
    }

    Ok(true)
}
