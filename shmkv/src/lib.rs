//! Key-value stores shared between processes.
//!
//! A store is either backed by files below a root directory, which any process can open by
//! path, or by anonymous shared memory, which exists only as descriptors. The latter are created
//! by one owning process. Every other process asks the owner's [`BrokerServer`] for them and
//! receives the descriptors in an [`FdEnvelope`].
//!
//! All state of a process lives in its [`Context`]:
//!
//! ```no_run
//! use shmkv::{Config, Context, ProcessMode};
//!
//! let ctx = Context::initialize(Config::from_env());
//! let kv = ctx.obtain_ashmem("shared", 4096, ProcessMode::Multi, None)?;
//! kv.set_bool("bool", true)?;
//! # Ok::<(), shmkv::Error>(())
//! ```
//!
//! Opening a store in a process mode other than the one another process holds it in fails with
//! [`Error::ModeMismatch`], as long as the process mode checker is enabled. It is by default in
//! debug builds and not in release builds.
mod broker;
mod config;
mod context;
mod envelope;
mod error;
mod id;
mod kv;
mod notify;
mod process;
mod rekey;
mod store;
mod table;

pub use broker::{default_endpoint, BrokerServer, METHOD};
pub use config::{Config, LogLevel, UnknownLevel, CACHE_VAR, LOG_VAR, ROOT_VAR};
pub use context::{Context, DEFAULT_CAPACITY, DEFAULT_STORE};
pub use envelope::{FdEnvelope, MAX_FRAME};
pub use error::{Error, Result};
pub use id::{ProcessMode, StoreId};
pub use kv::Kv;
pub use notify::{ChangeNotifier, ContentChangeListener};
pub use process::{EnvVar, Fixed, NameStrategy, OwnerRule, ProcCmdline, ProcComm, ProcessIdentifier};
pub use rekey::PendingRekey;
pub use table::NativeHandle;
