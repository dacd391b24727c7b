use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Logical identity of a store.
///
/// Two opens with equal ids resolve to the same native handle within one process.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    name: String,
    root: Option<PathBuf>,
}

impl StoreId {
    pub fn new(name: impl Into<String>) -> Self {
        StoreId {
            name: name.into(),
            root: None,
        }
    }

    /// A file-backed store living below `root` instead of the configured root directory.
    pub fn with_root(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        StoreId {
            name: name.into(),
            root: Some(root.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            None => f.write_str(&self.name),
            Some(root) => write!(f, "{} (in {})", self.name, root.display()),
        }
    }
}

impl From<&str> for StoreId {
    fn from(name: &str) -> Self {
        StoreId::new(name)
    }
}

/// Whether a store is declared for use by one process or by several concurrently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessMode {
    Single,
    Multi,
}

impl ProcessMode {
    /// The integer used on the broker wire.
    pub fn as_wire(self) -> i32 {
        match self {
            ProcessMode::Single => 1 << 0,
            ProcessMode::Multi => 1 << 1,
        }
    }

    pub fn from_wire(mode: i32) -> Option<Self> {
        match mode {
            1 => Some(ProcessMode::Single),
            2 => Some(ProcessMode::Multi),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            ProcessMode::Single => ProcessMode::Multi,
            ProcessMode::Multi => ProcessMode::Single,
        }
    }
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessMode::Single => f.write_str("single-process"),
            ProcessMode::Multi => f.write_str("multi-process"),
        }
    }
}

#[test]
fn wire_modes() {
    for mode in [ProcessMode::Single, ProcessMode::Multi] {
        assert_eq!(ProcessMode::from_wire(mode.as_wire()), Some(mode));
    }
    assert_eq!(ProcessMode::from_wire(0), None);
    assert_eq!(ProcessMode::from_wire(3), None);
}
