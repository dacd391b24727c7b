//! Process-local bookkeeping of open stores.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store::MappedStore;
use crate::{ProcessMode, StoreId};

/// Opaque reference to an open store, valid within the context that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(u64);

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) struct Entry {
    pub(crate) id: StoreId,
    pub(crate) mode: ProcessMode,
    pub(crate) store: Arc<MappedStore>,
}

/// Maps handles to the stores they refer to, and ids to the handle already held for them.
#[derive(Default)]
pub(crate) struct HandleTable {
    next: u64,
    entries: HashMap<NativeHandle, Entry>,
    by_id: HashMap<StoreId, NativeHandle>,
}

impl HandleTable {
    pub(crate) fn lookup(&self, id: &StoreId) -> Option<(NativeHandle, &Entry)> {
        let handle = *self.by_id.get(id)?;
        Some((handle, self.entries.get(&handle)?))
    }

    pub(crate) fn insert(&mut self, mode: ProcessMode, store: Arc<MappedStore>) -> NativeHandle {
        self.next += 1;
        let handle = NativeHandle(self.next);
        let id = store.id().clone();

        self.by_id.insert(id.clone(), handle);
        self.entries.insert(handle, Entry { id, mode, store });
        handle
    }

    pub(crate) fn remove(&mut self, handle: NativeHandle) -> Option<Entry> {
        let entry = self.entries.remove(&handle)?;
        if self.by_id.get(&entry.id) == Some(&handle) {
            self.by_id.remove(&entry.id);
        }
        Some(entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// What the checker needs to know about a store.
pub(crate) trait ModeProbe {
    fn id(&self) -> &StoreId;

    /// Ask the store which mode it is held in. May be costly.
    fn actual_process_mode(&self) -> Result<ProcessMode>;
}

impl ModeProbe for MappedStore {
    fn id(&self) -> &StoreId {
        MappedStore::id(self)
    }

    fn actual_process_mode(&self) -> Result<ProcessMode> {
        MappedStore::actual_process_mode(self)
    }
}

/// Remembers the handles whose process mode was already verified.
pub(crate) struct ModeChecker {
    enabled: bool,
    validated: HashSet<NativeHandle>,
}

impl ModeChecker {
    pub(crate) fn new(enabled: bool) -> Self {
        ModeChecker {
            enabled,
            validated: HashSet::new(),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether the store behind `handle` is held in the mode it was opened with.
    ///
    /// Only the first check of a handle asks the store.
    pub(crate) fn check_process_mode(
        &mut self,
        handle: NativeHandle,
        store: &dyn ModeProbe,
        requested: ProcessMode,
    ) -> Result<bool> {
        if self.validated.contains(&handle) {
            return Ok(true);
        }

        if store.actual_process_mode()? != requested {
            return Ok(false);
        }

        self.validated.insert(handle);
        Ok(true)
    }

    /// Fail with [`Error::ModeMismatch`] if the store is held in the other mode.
    ///
    /// Always succeeds while the checker is disabled.
    pub(crate) fn verify(
        &mut self,
        handle: NativeHandle,
        store: &dyn ModeProbe,
        requested: ProcessMode,
    ) -> Result<()> {
        if !self.enabled || self.check_process_mode(handle, store, requested)? {
            return Ok(());
        }

        tracing::error!(id = %store.id(), %requested, "process mode mismatch");
        Err(Error::ModeMismatch {
            id: store.id().clone(),
            requested,
            actual: requested.other(),
        })
    }

    pub(crate) fn forget(&mut self, handle: NativeHandle) {
        self.validated.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::{ModeChecker, ModeProbe, NativeHandle};
    use crate::error::Result;
    use crate::{Error, ProcessMode, StoreId};
    use std::cell::Cell;

    struct Probe {
        id: StoreId,
        held_as: ProcessMode,
        asked: Cell<usize>,
    }

    impl Probe {
        fn new(held_as: ProcessMode) -> Self {
            Probe {
                id: StoreId::new("probe"),
                held_as,
                asked: Cell::new(0),
            }
        }
    }

    impl ModeProbe for Probe {
        fn id(&self) -> &StoreId {
            &self.id
        }

        fn actual_process_mode(&self) -> Result<ProcessMode> {
            self.asked.set(self.asked.get() + 1);
            Ok(self.held_as)
        }
    }

    #[test]
    fn validated_handles_are_not_asked_again() {
        let mut checker = ModeChecker::new(true);
        let probe = Probe::new(ProcessMode::Multi);
        let handle = NativeHandle(1);

        for _ in 0..3 {
            checker.verify(handle, &probe, ProcessMode::Multi).unwrap();
        }
        assert_eq!(probe.asked.get(), 1);

        checker.forget(handle);
        checker.verify(handle, &probe, ProcessMode::Multi).unwrap();
        assert_eq!(probe.asked.get(), 2);
    }

    #[test]
    fn mismatch_both_ways() {
        let mut checker = ModeChecker::new(true);

        let err = checker
            .verify(NativeHandle(1), &Probe::new(ProcessMode::Multi), ProcessMode::Single)
            .unwrap_err();
        assert!(err.to_string().contains("opened as multi-process by someone else"));

        let err = checker
            .verify(NativeHandle(2), &Probe::new(ProcessMode::Single), ProcessMode::Multi)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ModeMismatch {
                actual: ProcessMode::Single,
                ..
            }
        ));
    }

    #[test]
    fn disabled_checker_never_asks() {
        let mut checker = ModeChecker::new(false);
        let probe = Probe::new(ProcessMode::Multi);

        checker
            .verify(NativeHandle(1), &probe, ProcessMode::Single)
            .unwrap();
        assert_eq!(probe.asked.get(), 0);

        // The raw check still reports the truth.
        assert!(!checker
            .check_process_mode(NativeHandle(1), &probe, ProcessMode::Single)
            .unwrap());
    }
}
