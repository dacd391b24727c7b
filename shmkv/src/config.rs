use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use shmkv_fd::BrokerEnv;

pub const ROOT_VAR: &str = "SHMKV_ROOT";
pub const CACHE_VAR: &str = "SHMKV_CACHE";
pub const LOG_VAR: &str = "SHMKV_LOG";

/// Settings supplied once, when the process-scoped [`Context`](crate::Context) is built.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory of file-backed stores without an explicit root.
    pub root_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub log_level: LogLevel,
    /// Use this name instead of detecting the process name.
    pub process_name: Option<String>,
    /// Name of the process owning anonymous stores.
    ///
    /// When unset, any process whose name carries no `:<suffix>` is the owner.
    pub owner_process: Option<String>,
    /// Socket of the owning process's broker.
    pub broker_endpoint: Option<PathBuf>,
    /// Reject opens under a process mode other than the one the store is held in.
    pub process_mode_checker: bool,
    /// How long a broker request may block on the owning process.
    pub broker_timeout: Duration,
}

impl Config {
    pub const DEFAULT_BROKER_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        let root_dir = root_dir.into();
        Config {
            cache_dir: root_dir.join(".cache"),
            root_dir,
            log_level: LogLevel::default(),
            process_name: None,
            owner_process: None,
            broker_endpoint: None,
            process_mode_checker: cfg!(debug_assertions),
            broker_timeout: Self::DEFAULT_BROKER_TIMEOUT,
        }
    }

    /// Defaults, overridden by the `SHMKV_*` environment variables that are set.
    ///
    /// An unparsable `SHMKV_LOG` is ignored, as are broker variables [`BrokerEnv`] rejects.
    pub fn from_env() -> Self {
        let var = |name| std::env::var_os(name).filter(|val| !val.is_empty());

        let root = var(ROOT_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("shmkv"));
        let mut config = Config::new(root);

        if let Some(cache) = var(CACHE_VAR) {
            config.cache_dir = cache.into();
        }

        if let Some(level) = var(LOG_VAR).and_then(|level| level.into_string().ok()) {
            if let Ok(level) = level.parse() {
                config.log_level = level;
            }
        }

        match BrokerEnv::from_env() {
            Ok(env) => config.with_broker_env(env),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring the broker environment");
                config
            }
        }
    }

    /// Reach the broker and take the name handed down by an owning process.
    pub fn with_broker_env(mut self, env: BrokerEnv) -> Self {
        self.broker_endpoint = env.socket;
        self.process_name = env.process_name;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    None,
}

impl LogLevel {
    /// The equivalent `tracing` filter directive.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::None => "off",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownLevel(String);

impl fmt::Display for UnknownLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown log level `{}`", self.0)
    }
}

impl std::error::Error for UnknownLevel {}

impl FromStr for LogLevel {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            "none" | "off" => LogLevel::None,
            _ => return Err(UnknownLevel(s.to_owned())),
        })
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Warning => "warning",
            LogLevel::None => "none",
            other => other.directive(),
        })
    }
}
