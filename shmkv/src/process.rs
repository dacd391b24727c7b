//! Find the logical name of the current process.
//!
//! Sub-processes of an application are named `<main>:<suffix>`. The name decides whether this
//! process owns anonymous stores and can create them, or has to ask the owner for them.
use std::path::Path;

use parking_lot::Mutex;
use shmkv_fd::env::PROCESS_NAME_VAR;

use crate::error::{Error, Result};
use crate::Config;

/// One way of finding the process name.
pub trait NameStrategy: Send + Sync {
    /// The name, if this strategy knows it. Empty names count as unknown.
    fn name(&self) -> Option<String>;
}

/// A name given by configuration.
pub struct Fixed(pub String);

impl NameStrategy for Fixed {
    fn name(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// The value of an environment variable.
pub struct EnvVar(pub &'static str);

impl NameStrategy for EnvVar {
    fn name(&self) -> Option<String> {
        std::env::var(self.0).ok()
    }
}

/// The file name of `argv[0]`, as the kernel reports it.
pub struct ProcCmdline;

impl NameStrategy for ProcCmdline {
    fn name(&self) -> Option<String> {
        let cmdline = std::fs::read("/proc/self/cmdline").ok()?;
        let argv0 = cmdline.split(|&b| b == 0).next()?;
        let argv0 = std::str::from_utf8(argv0).ok()?;
        let name = Path::new(argv0).file_name()?.to_str()?;
        Some(name.to_owned())
    }
}

/// The short command name of the thread group.
pub struct ProcComm;

impl NameStrategy for ProcComm {
    fn name(&self) -> Option<String> {
        let comm = std::fs::read_to_string("/proc/self/comm").ok()?;
        Some(comm.trim_end().to_owned())
    }
}

/// Which process owns anonymous stores.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnerRule {
    /// The one without a `:<suffix>` in its name.
    MainProcess,
    Named(String),
}

impl OwnerRule {
    pub fn is_owner(&self, name: &str) -> bool {
        match self {
            OwnerRule::MainProcess => !name.contains(':'),
            OwnerRule::Named(owner) => owner == name,
        }
    }

    /// The name of the owner, as seen from a process called `name`.
    pub fn owner_of<'n>(&'n self, name: &'n str) -> &'n str {
        match self {
            OwnerRule::MainProcess => name.split(':').next().unwrap_or(name),
            OwnerRule::Named(owner) => owner,
        }
    }
}

/// Tries its strategies in order, the first non-empty name wins and is kept.
pub struct ProcessIdentifier {
    strategies: Vec<Box<dyn NameStrategy>>,
    owner: OwnerRule,
    cached: Mutex<Option<String>>,
}

impl ProcessIdentifier {
    pub fn new(strategies: Vec<Box<dyn NameStrategy>>, owner: OwnerRule) -> Self {
        ProcessIdentifier {
            strategies,
            owner,
            cached: Mutex::new(None),
        }
    }

    /// Configured name, then `SHMKV_PROCESS_NAME`, then `/proc/self/cmdline`, then `/proc/self/comm`.
    pub fn from_config(config: &Config) -> Self {
        let mut strategies: Vec<Box<dyn NameStrategy>> = Vec::new();
        if let Some(name) = &config.process_name {
            strategies.push(Box::new(Fixed(name.clone())));
        }
        strategies.push(Box::new(EnvVar(PROCESS_NAME_VAR)));
        strategies.push(Box::new(ProcCmdline));
        strategies.push(Box::new(ProcComm));

        let owner = match &config.owner_process {
            Some(owner) => OwnerRule::Named(owner.clone()),
            None => OwnerRule::MainProcess,
        };

        ProcessIdentifier::new(strategies, owner)
    }

    /// The name of this process.
    ///
    /// Fails with [`Error::ProcessNameUnavailable`] while no strategy knows it. That may change,
    /// the next call tries again.
    pub fn current_name(&self) -> Result<String> {
        let mut cached = self.cached.lock();
        if let Some(name) = cached.as_ref() {
            return Ok(name.clone());
        }

        let name = self
            .strategies
            .iter()
            .filter_map(|strategy| strategy.name())
            .find(|name| !name.is_empty())
            .ok_or(Error::ProcessNameUnavailable)?;

        tracing::debug!(name = %name, "resolved process name");
        *cached = Some(name.clone());
        Ok(name)
    }

    pub fn is_owner(&self) -> Result<bool> {
        Ok(self.owner.is_owner(&self.current_name()?))
    }

    pub fn owner_name(&self) -> Result<String> {
        let name = self.current_name()?;
        Ok(self.owner.owner_of(&name).to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::{Fixed, NameStrategy, OwnerRule, ProcComm, ProcessIdentifier};
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Knows no name for the first `empty_for` calls.
    struct Late {
        calls: Arc<AtomicUsize>,
        empty_for: usize,
    }

    impl NameStrategy for Late {
        fn name(&self) -> Option<String> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            Some(if call < self.empty_for { String::new() } else { "app:late".to_owned() })
        }
    }

    #[test]
    fn first_non_empty_wins() {
        let id = ProcessIdentifier::new(
            vec![
                Box::new(Fixed(String::new())),
                Box::new(Fixed("app:remote".into())),
                Box::new(Fixed("app".into())),
            ],
            OwnerRule::MainProcess,
        );

        assert_eq!(id.current_name().unwrap(), "app:remote");
        assert!(!id.is_owner().unwrap());
        assert_eq!(id.owner_name().unwrap(), "app");
    }

    #[test]
    fn empty_name_is_retryable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let id = ProcessIdentifier::new(
            vec![Box::new(Late {
                calls: Arc::clone(&calls),
                empty_for: 1,
            })],
            OwnerRule::MainProcess,
        );

        let err = id.current_name().unwrap_err();
        assert!(matches!(err, Error::ProcessNameUnavailable));
        assert!(err.is_retryable());

        assert_eq!(id.current_name().unwrap(), "app:late");
        // Cached from here on.
        assert_eq!(id.current_name().unwrap(), "app:late");
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn named_owner() {
        let rule = OwnerRule::Named("host".into());
        assert!(rule.is_owner("host"));
        assert!(!rule.is_owner("app"));
        assert_eq!(rule.owner_of("app:x"), "host");
    }

    #[test]
    fn kernel_knows_our_name() {
        assert!(ProcComm.name().is_some_and(|name| !name.is_empty()));
    }
}
