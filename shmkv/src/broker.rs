//! Requesting anonymous stores from the process that owns them.
//!
//! The owning process listens on a Unix stream socket. A request names the store and how it
//! should be created, one per connection. The answer carries the store's descriptors as
//! `SCM_RIGHTS`: the kernel installs copies in the requesting process, the owner's descriptors
//! are not touched.
use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shmkv_fd::SharedFd;

use crate::envelope::{recv_frame, send_frame, FdEnvelope};
use crate::error::{Error, Result};
use crate::{Context, ProcessMode, StoreId};

/// The one method a broker answers.
pub const METHOD: &str = "mmkvFromAshmemID";

const REQUEST_MAGIC: &[u8; 4] = b"SKQ1";
const RESPONSE_MAGIC: &[u8; 4] = b"SKR1";
const ACCEPT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    method: String,
    /// The store name.
    arg: String,
    extras: Extras,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Extras {
    size: u64,
    mode: i32,
    crypt_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Envelope {
        id: String,
        mode: i32,
        #[serde(rename = "cryptKey")]
        crypt_key: Option<String>,
    },
    Error {
        message: String,
    },
}

/// Where the broker of `owner` listens when no endpoint is configured.
pub fn default_endpoint(cache_dir: &Path, owner: &str) -> PathBuf {
    cache_dir.join(format!("{owner}.broker"))
}

/// Ask the broker at `endpoint` for the anonymous store `id`.
///
/// Blocks for at most `timeout` on each read and write.
pub(crate) fn request_ashmem(
    endpoint: &Path,
    timeout: Duration,
    id: &StoreId,
    size: usize,
    mode: ProcessMode,
    crypt_key: Option<&str>,
) -> Result<FdEnvelope> {
    let sock = UnixStream::connect(endpoint).map_err(|err| {
        Error::unreachable(
            format!("can not connect to broker at {}", endpoint.display()),
            Some(err),
        )
    })?;
    sock.set_read_timeout(Some(timeout))?;
    sock.set_write_timeout(Some(timeout))?;

    let request = Request {
        method: METHOD.to_owned(),
        arg: id.name().to_owned(),
        extras: Extras {
            size: size as u64,
            mode: mode.as_wire(),
            crypt_key: crypt_key.map(str::to_owned),
        },
    };
    send_frame(&sock, REQUEST_MAGIC, &request, &[]).map_err(timed_out)?;

    let Some((response, fds)) =
        recv_frame::<Response>(&sock, RESPONSE_MAGIC).map_err(timed_out)?
    else {
        return Err(Error::unreachable("broker closed the connection without answering", None));
    };

    match response {
        Response::Error { message } => {
            tracing::error!(id = %id, message = %message, "broker rejected the request");
            Err(Error::Rejected {
                id: id.name().to_owned(),
                message,
            })
        }
        Response::Envelope {
            id: name,
            mode,
            crypt_key,
        } => {
            if name != id.name() {
                return Err(Error::Protocol(format!(
                    "asked for store [{}] but got [{name}]",
                    id.name()
                )));
            }

            let mode = ProcessMode::from_wire(mode)
                .ok_or_else(|| Error::Protocol(format!("unknown process mode {mode}")))?;

            let mut fds = fds.into_iter().map(SharedFd::from_owned);
            let (data, meta) = (fds.next(), fds.next());
            Ok(FdEnvelope::new(id.clone(), mode, data, meta, crypt_key))
        }
    }
}

fn timed_out(err: Error) -> Error {
    match err {
        Error::Io(err)
            if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
        {
            Error::unreachable("broker did not answer in time", Some(err))
        }
        other => other,
    }
}

/// The owning process's end: creates stores on request and hands out their descriptors.
///
/// Requests are served on the calling thread.
pub struct BrokerServer {
    ctx: Arc<Context>,
    listener: UnixListener,
    path: PathBuf,
}

impl BrokerServer {
    /// Listen at `path`, replacing a socket left behind by an earlier run.
    pub fn bind(ctx: Arc<Context>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale broker socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::info!(path = %path.display(), "broker listening");
        Ok(BrokerServer {
            ctx,
            listener,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for one connection and answer its request.
    pub fn serve_one(&self) -> Result<()> {
        self.listener.set_nonblocking(false)?;
        let (stream, _) = self.listener.accept()?;
        self.handle(stream)
    }

    /// Answer requests until `stop` is set.
    ///
    /// A failing request is logged and does not end serving.
    pub fn serve_until(&self, stop: &AtomicBool) -> Result<()> {
        self.listener.set_nonblocking(true)?;

        while !stop.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    if let Err(err) = self.handle(stream) {
                        tracing::warn!(error = %err, "broker request failed");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    fn handle(&self, stream: UnixStream) -> Result<()> {
        let timeout = self.ctx.config().broker_timeout;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        // Requests carry no descriptors, anything attached is closed right away.
        let Some((request, _)) = recv_frame::<Request>(&stream, REQUEST_MAGIC)? else {
            return Ok(());
        };

        let reject = |message: String| {
            tracing::warn!(method = %request.method, name = %request.arg, message = %message, "rejecting broker request");
            send_frame(&stream, RESPONSE_MAGIC, &Response::Error { message }, &[])
        };

        if request.method != METHOD {
            return reject(format!("unknown method `{}`", request.method));
        }

        let Some(mode) = ProcessMode::from_wire(request.extras.mode) else {
            return reject(format!("unknown process mode {}", request.extras.mode));
        };

        let kv = match self.ctx.serve_ashmem(
            &request.arg,
            request.extras.size as usize,
            mode,
            request.extras.crypt_key.as_deref(),
        ) {
            Ok(kv) => kv,
            Err(err) => return reject(err.to_string()),
        };

        let response = Response::Envelope {
            id: request.arg.clone(),
            mode: kv.mode().as_wire(),
            crypt_key: kv.crypt_key()?,
        };

        kv.store().with_descriptors(|data, meta| {
            send_frame(&stream, RESPONSE_MAGIC, &response, &[data, meta])
        })??;
        tracing::info!(name = %request.arg, mode = %kv.mode(), "handed out anonymous store");
        Ok(())
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::{Request, Response, METHOD};

    #[test]
    fn wire_names() {
        let request: Request = serde_json::from_str(
            r#"{"method":"mmkvFromAshmemID","arg":"shared","extras":{"size":4096,"mode":2,"cryptKey":null}}"#,
        )
        .unwrap();
        assert_eq!(request.method, METHOD);
        assert_eq!(request.extras.size, 4096);

        let response = serde_json::to_value(Response::Error {
            message: "no".into(),
        })
        .unwrap();
        assert_eq!(response["status"], "error");
    }
}
