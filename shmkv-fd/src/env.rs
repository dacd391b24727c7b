//! Parse and set the broker environment variables.
//!
//! A process that owns anonymous stores tells its children where to ask for them: the path of
//! the broker socket, and the name the child should identify itself with. Names follow the
//! `<owner>:<suffix>` convention for sub-processes.
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;

/// Path of the owning process's broker socket.
pub const BROKER_VAR: &str = "SHMKV_BROKER";
/// Logical name of the current process.
pub const PROCESS_NAME_VAR: &str = "SHMKV_PROCESS_NAME";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrokerEnv {
    pub socket: Option<PathBuf>,
    pub process_name: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// The process name is not valid UTF-8.
    BadName,
    /// The socket variable was set but empty.
    BadSocket,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BadName => write!(f, "{PROCESS_NAME_VAR} is not valid UTF-8"),
            Error::BadSocket => write!(f, "{BROKER_VAR} is set but empty"),
        }
    }
}

impl std::error::Error for Error {}

impl BrokerEnv {
    /// Read both variables from the environment of this process.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_vars(
            std::env::var_os(BROKER_VAR),
            std::env::var_os(PROCESS_NAME_VAR),
        )
    }

    fn from_vars(socket: Option<OsString>, name: Option<OsString>) -> Result<Self, Error> {
        let socket = match socket {
            None => None,
            Some(socket) if socket.is_empty() => return Err(Error::BadSocket),
            Some(socket) => Some(PathBuf::from(socket)),
        };

        let process_name = match name {
            None => None,
            Some(name) => {
                let Ok(name) = name.into_string() else {
                    return Err(Error::BadName);
                };
                // An empty name is as good as none, resolution falls through to the next source.
                Some(name).filter(|name| !name.is_empty())
            }
        };

        Ok(BrokerEnv {
            socket,
            process_name,
        })
    }

    /// The environment for a sub-process of `owner`, reaching the broker at `socket`.
    pub fn for_child(socket: impl Into<PathBuf>, owner: &str, suffix: &str) -> Self {
        BrokerEnv {
            socket: Some(socket.into()),
            process_name: Some(format!("{owner}:{suffix}")),
        }
    }

    /// Prepare `proc` to be started with this environment.
    ///
    /// Unset fields are removed from the child's environment instead of being inherited.
    pub fn wrap_proc(&self, proc: &mut Command) {
        match &self.socket {
            Some(socket) => proc.env(BROKER_VAR, socket),
            None => proc.env_remove(BROKER_VAR),
        };

        match &self.process_name {
            Some(name) => proc.env(PROCESS_NAME_VAR, name),
            None => proc.env_remove(PROCESS_NAME_VAR),
        };
    }
}
