//! The native layer: a mapped key-value store over a data and a metadata segment.
//!
//! The data segment holds the record log (see [`codec`]). The metadata segment is one page of
//! counters that every process mapping the store watches:
//!
//! | offset | field       | changes when                                   |
//! |--------|-------------|------------------------------------------------|
//! | 0      | magic       | the segment is formatted                        |
//! | 4      | version     | never                                           |
//! | 8      | sequence    | the log is rewritten from the start             |
//! | 12     | actual size | any record is written                           |
//! | 16     | generation  | a record is appended                            |
//! | 20     | key epoch   | the values are re-encrypted under another key   |
//!
//! File-backed stores keep both in files and grow the data file as needed. Anonymous stores live
//! in two sealed memory files whose size is fixed at creation.
pub(crate) mod codec;
mod crypt;
mod lock;
mod segment;

use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use shmkv_fd::SharedFd;

use crate::error::{Error, Result};
use crate::{ProcessMode, StoreId};
use crypt::{conceal, reveal, Crypter};
use lock::{FileLock, LockType, ThreadGate};
use segment::Segment;

const MAGIC: u32 = u32::from_le_bytes(*b"SKV1");
const VERSION: u32 = 1;

const MAGIC_AT: usize = 0;
const VERSION_AT: usize = 4;
const SEQUENCE_AT: usize = 8;
const ACTUAL_SIZE_AT: usize = 12;
const GENERATION_AT: usize = 16;
const KEY_EPOCH_AT: usize = 20;
const META_LEN: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Backing {
    File,
    Anonymous,
}

/// How the segments are expected to look when attaching to them.
#[derive(Clone, Copy)]
enum Layout {
    /// Files that may be empty, grown to `capacity` and formatted if so.
    Grow { capacity: usize },
    /// Freshly created, always formatted.
    Fresh,
    /// Received from elsewhere, must already be formatted.
    Adopt,
}

pub(crate) struct MappedStore {
    id: StoreId,
    mode: ProcessMode,
    backing: Backing,
    page_size: usize,
    open: RwLock<Option<Open>>,
    gate: ThreadGate,
    /// Guards the segments against other processes, only in multi-process mode.
    meta_lock: FileLock,
    /// Advertises the process mode on the data segment.
    mode_lock: FileLock,
    changed: AtomicBool,
}

struct Open {
    fds: Descriptors,
    /// Further descriptors of the same objects. Closing them would drop our record locks.
    parked: Mutex<Vec<SharedFd>>,
    held_as: ProcessMode,
    state: Mutex<State>,
}

struct Descriptors {
    data: SharedFd,
    meta: SharedFd,
}

struct State {
    data: Segment,
    meta: Segment,
    /// Stored values, still encrypted.
    entries: HashMap<String, Vec<u8>>,
    crypter: Option<Crypter>,
    seen: Seen,
    /// Whether `entries` reflects the log, false after the cache was dropped.
    cached: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Seen {
    sequence: u32,
    generation: u32,
    actual_size: u32,
}

impl MappedStore {
    fn new(id: StoreId, mode: ProcessMode, backing: Backing, page_size: usize) -> Self {
        MappedStore {
            id,
            mode,
            backing,
            page_size,
            open: RwLock::new(None),
            gate: ThreadGate::default(),
            meta_lock: FileLock::new(mode == ProcessMode::Multi),
            mode_lock: FileLock::new(true),
            changed: AtomicBool::new(false),
        }
    }

    /// Open or create the store files `<root>/<name>` and `<root>/<name>.crc`.
    pub(crate) fn open_file(
        id: StoreId,
        root: &Path,
        mode: ProcessMode,
        key: Option<&str>,
        capacity: usize,
        page_size: usize,
    ) -> Result<Self> {
        let files = (|| -> io::Result<Descriptors> {
            std::fs::create_dir_all(root)?;
            let open = |path: &Path| {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
            };

            let (data, meta) = file_paths(root, id.name());
            Ok(Descriptors {
                data: open(&data)?.into(),
                meta: open(&meta)?.into(),
            })
        })();

        let fds = match files {
            Ok(fds) => fds,
            Err(err) => {
                tracing::error!(id = %id, root = %root.display(), error = %err, "can not open store files");
                return Err(Error::CreationError {
                    id,
                    source: Some(err),
                });
            }
        };

        let mut store = MappedStore::new(id, mode, Backing::File, page_size);
        let capacity = page_align(capacity, page_size);
        match store.attach(fds, key, Layout::Grow { capacity }) {
            Ok(open) => store.open = RwLock::new(Some(open)),
            Err(err) => {
                return Err(Error::CreationError {
                    id: store.id,
                    source: Some(err),
                })
            }
        }

        tracing::info!(id = %store.id, mode = %mode, "opened file-backed store");
        Ok(store)
    }

    /// Create a store in anonymous shared memory of at least `size` bytes.
    pub(crate) fn create_anonymous(
        id: StoreId,
        size: usize,
        mode: ProcessMode,
        key: Option<&str>,
        page_size: usize,
    ) -> Result<Self> {
        let size = page_align(size, page_size);
        let fds = (|| -> io::Result<Descriptors> {
            Ok(Descriptors {
                data: SharedFd::anonymous(id.name(), size as u64)?,
                meta: SharedFd::anonymous(&format!("{}.crc", id.name()), page_size as u64)?,
            })
        })();

        let mut store = MappedStore::new(id, mode, Backing::Anonymous, page_size);
        match fds.and_then(|fds| store.attach(fds, key, Layout::Fresh)) {
            Ok(open) => store.open = RwLock::new(Some(open)),
            Err(err) => {
                tracing::error!(id = %store.id, size, error = %err, "can not create anonymous store");
                return Err(Error::CreationError {
                    id: store.id,
                    source: Some(err),
                });
            }
        }

        tracing::info!(id = %store.id, size, mode = %mode, "created anonymous store");
        Ok(store)
    }

    /// Take over the segments of a store created elsewhere.
    pub(crate) fn adopt(
        id: StoreId,
        mode: ProcessMode,
        data: SharedFd,
        meta: SharedFd,
        key: Option<&str>,
        page_size: usize,
    ) -> Result<Self> {
        let invalid = |reason| Error::InvalidEnvelope {
            id: id.name().to_owned(),
            reason,
        };

        if !matches!(data.len(), Ok(len) if len > 0) {
            return Err(invalid("data descriptor is empty or unusable"));
        }

        if !matches!(meta.len(), Ok(len) if len >= META_LEN as u64) {
            return Err(invalid("metadata descriptor is too small or unusable"));
        }

        let mut store = MappedStore::new(id.clone(), mode, Backing::Anonymous, page_size);
        match store.attach(Descriptors { data, meta }, key, Layout::Adopt) {
            Ok(open) => store.open = RwLock::new(Some(open)),
            Err(err) => {
                tracing::warn!(id = %id, error = %err, "received descriptors do not hold a store");
                return Err(invalid("descriptors do not hold a store"));
            }
        }

        tracing::info!(id = %store.id, mode = %mode, "adopted anonymous store");
        Ok(store)
    }

    fn attach(&self, fds: Descriptors, key: Option<&str>, layout: Layout) -> io::Result<Open> {
        let meta = fds.meta.as_fd();
        self.meta_lock.lock(meta, LockType::Exclusive)?;
        let state = self.prepare(&fds, key, layout);
        let unlocked = self.meta_lock.unlock(meta, LockType::Exclusive);
        let state = state?;
        unlocked?;

        let held_as = self.probe_mode(fds.data.as_fd());
        Ok(Open {
            fds,
            parked: Mutex::default(),
            held_as,
            state: Mutex::new(state),
        })
    }

    fn prepare(&self, fds: &Descriptors, key: Option<&str>, layout: Layout) -> io::Result<State> {
        if let Layout::Grow { capacity } = layout {
            if fds.meta.len()? < self.page_size as u64 {
                fds.meta.set_len(self.page_size as u64)?;
            }

            if fds.data.len()? == 0 {
                fds.data.set_len(capacity as u64)?;
            }
        }

        let meta = Segment::map(&fds.meta)?;
        if meta.len() < META_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "metadata segment too small",
            ));
        }

        let mut state = State {
            data: Segment::map(&fds.data)?,
            meta,
            entries: HashMap::new(),
            crypter: key.and_then(Crypter::new),
            seen: Seen::default(),
            cached: true,
        };

        let magic = state.word(MAGIC_AT);
        match layout {
            Layout::Fresh => state.format(),
            Layout::Grow { .. } if magic == 0 => state.format(),
            Layout::Grow { .. } if magic != MAGIC => {
                tracing::warn!(id = %self.id, magic, "unknown metadata, discarding store content");
                state.format();
            }
            Layout::Adopt if magic != MAGIC => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "metadata segment is not formatted",
                ));
            }
            _ => {}
        }

        state.reload_all();
        Ok(state)
    }

    /// Advertise our mode on the data segment, and find the mode others hold it in.
    fn probe_mode(&self, data: BorrowedFd<'_>) -> ProcessMode {
        let probe = |kind| match self.mode_lock.try_lock(data, kind) {
            Ok(locked) => Some(locked),
            Err(err) => {
                // Not contention, the filesystem can not tell us.
                tracing::warn!(id = %self.id, error = %err, "process mode probe failed, assuming it matches");
                None
            }
        };

        match self.mode {
            ProcessMode::Single => match probe(LockType::Shared) {
                Some(false) => ProcessMode::Multi,
                _ => ProcessMode::Single,
            },
            ProcessMode::Multi => match probe(LockType::Exclusive) {
                Some(false) => match probe(LockType::Shared) {
                    Some(true) => {
                        let _ = self.mode_lock.unlock(data, LockType::Shared);
                        ProcessMode::Single
                    }
                    // Another multi-process holder has the exclusive lock.
                    _ => ProcessMode::Multi,
                },
                _ => ProcessMode::Multi,
            },
        }
    }

    pub(crate) fn id(&self) -> &StoreId {
        &self.id
    }

    pub(crate) fn mode(&self) -> ProcessMode {
        self.mode
    }

    pub(crate) fn backing(&self) -> Backing {
        self.backing
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.open.read().is_none()
    }

    /// The process mode the store is actually held in by other processes.
    pub(crate) fn actual_process_mode(&self) -> Result<ProcessMode> {
        let open = self.open.read();
        let open = open.as_ref().ok_or_else(|| self.closed())?;
        Ok(open.held_as)
    }

    fn closed(&self) -> Error {
        Error::Closed(self.id.clone())
    }

    /// Run `f` on the current content, ordered against writers in other processes.
    fn shared<R>(&self, f: impl FnOnce(&Open, &mut State) -> Result<R>) -> Result<R> {
        let open = self.open.read();
        let open = open.as_ref().ok_or_else(|| self.closed())?;
        let meta = open.fds.meta.as_fd();

        self.meta_lock.lock(meta, LockType::Shared)?;
        let result = (|| -> Result<R> {
            let mut state = open.state.lock();
            self.refresh(open, &mut state)?;
            f(open, &mut state)
        })();
        self.meta_lock.unlock(meta, LockType::Shared)?;

        result
    }

    /// Run `f` as the only writer, in this and any other process.
    fn exclusive<R>(&self, f: impl FnOnce(&Open, &mut State) -> Result<R>) -> Result<R> {
        self.gate.enter();
        let _gate = Leave(&self.gate);

        let open = self.open.read();
        let open = open.as_ref().ok_or_else(|| self.closed())?;
        let meta = open.fds.meta.as_fd();

        self.meta_lock.lock(meta, LockType::Exclusive)?;
        let result = (|| -> Result<R> {
            let mut state = open.state.lock();
            self.refresh(open, &mut state)?;
            f(open, &mut state)
        })();
        self.meta_lock.unlock(meta, LockType::Exclusive)?;

        result
    }

    /// Without any inter-process ordering, for process-local state.
    fn local<R>(&self, f: impl FnOnce(&Open, &mut State) -> R) -> Result<R> {
        let open = self.open.read();
        let open = open.as_ref().ok_or_else(|| self.closed())?;
        let mut state = open.state.lock();
        Ok(f(open, &mut state))
    }

    fn refresh(&self, open: &Open, state: &mut State) -> io::Result<()> {
        let now = state.read_seen();
        let external = now != state.seen;
        if !external && state.cached {
            return Ok(());
        }

        if self.backing == Backing::File {
            let len = open.fds.data.len()?;
            if len != state.data.len() as u64 {
                tracing::debug!(id = %self.id, from = state.data.len(), to = len, "remapping data segment");
                state.data = Segment::map(&open.fds.data)?;
            }
        }

        if !state.cached
            || now.sequence != state.seen.sequence
            || now.actual_size < state.seen.actual_size
        {
            state.reload_all();
        } else {
            let from = state.seen.actual_size as usize;
            let tail = state.data.read(from, now.actual_size as usize - from);
            codec::decode_into(&tail, &mut state.entries);
            state.seen = now;
        }

        if external {
            self.changed.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Drop the decoded entries. The next access decodes them from the segment again.
    pub(crate) fn clear_memory_cache(&self) -> Result<()> {
        self.local(|_, state| {
            state.entries = HashMap::new();
            state.cached = false;
        })?;
        tracing::debug!(id = %self.id, "cleared memory cache");
        Ok(())
    }

    /// Whether content written by someone else was loaded since the last call.
    pub(crate) fn take_change(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    /// Look for changes by other processes without reading anything.
    pub(crate) fn check_external_change(&self) -> Result<bool> {
        self.shared(|_, _| Ok(()))?;
        Ok(self.take_change())
    }

    /// Write `value` under `key`, or remove `key` if `value` is `None`.
    pub(crate) fn encode(&self, key: &str, value: Option<&[u8]>) -> Result<()> {
        self.exclusive(|open, state| {
            let stored = match value {
                Some(value) => Some(
                    conceal(state.crypter.as_ref(), value)
                        .ok_or_else(|| io::Error::other("value encryption failed"))?,
                ),
                None if !state.entries.contains_key(key) => return Ok(()),
                None => None,
            };

            let mut record = Vec::with_capacity(codec::encoded_len(key, stored.as_deref()));
            codec::encode(&mut record, key, stored.as_deref());

            if state.seen.actual_size as usize + record.len() <= state.data.len() {
                state.append(&record)?;
                apply(&mut state.entries, key, stored);
                return Ok(());
            }

            let mut entries = state.entries.clone();
            apply(&mut entries, key, stored);
            let log = codec::encode_all(&entries);
            self.make_room(open, state, log.len())?;
            state.rewrite(&log)?;
            state.entries = entries;
            Ok(())
        })
    }

    /// The plain value under `key`.
    ///
    /// A value that does not decrypt under the current key reads as absent.
    pub(crate) fn decode(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.shared(|_, state| {
            let Some(stored) = state.entries.get(key) else {
                return Ok(None);
            };

            let plain = reveal(state.crypter.as_ref(), stored);
            if plain.is_none() {
                tracing::warn!(id = %self.id, key, "value does not decrypt under the current key");
            }
            Ok(plain)
        })
    }

    pub(crate) fn contains(&self, key: &str) -> Result<bool> {
        self.shared(|_, state| Ok(state.entries.contains_key(key)))
    }

    pub(crate) fn keys(&self) -> Result<Vec<String>> {
        self.shared(|_, state| {
            let mut keys: Vec<_> = state.entries.keys().cloned().collect();
            keys.sort();
            Ok(keys)
        })
    }

    pub(crate) fn count(&self) -> Result<usize> {
        self.shared(|_, state| Ok(state.entries.len()))
    }

    /// Bytes the record of `key` takes in the log, 0 if absent.
    pub(crate) fn record_len(&self, key: &str) -> Result<usize> {
        self.shared(|_, state| {
            Ok(state
                .entries
                .get(key)
                .map_or(0, |stored| codec::encoded_len(key, Some(stored))))
        })
    }

    /// Size of the data segment.
    pub(crate) fn total_size(&self) -> Result<usize> {
        self.shared(|_, state| Ok(state.data.len()))
    }

    /// Bytes of the data segment in use by the log.
    pub(crate) fn actual_size(&self) -> Result<usize> {
        self.shared(|_, state| Ok(state.seen.actual_size as usize))
    }

    pub(crate) fn clear_all(&self) -> Result<()> {
        self.exclusive(|open, state| {
            state.rewrite(&[])?;
            state.entries.clear();
            self.shrink(open, state, self.page_size)
        })
    }

    /// Rewrite the log without superseded records, and give back unused space.
    pub(crate) fn trim(&self) -> Result<()> {
        self.exclusive(|open, state| {
            let log = codec::encode_all(&state.entries);
            state.rewrite(&log)?;
            let len = page_align(log.len() + log.len() / 2, self.page_size);
            self.shrink(open, state, len)
        })
    }

    /// Copy both segments to `<dst>/<name>` and `<dst>/<name>.crc`.
    ///
    /// The copies are taken under the shared lock, so they are consistent with each other.
    pub(crate) fn backup_to(&self, dst: &Path) -> Result<()> {
        self.require_file("backed up")?;
        self.shared(|_, state| -> Result<()> {
            std::fs::create_dir_all(dst)?;
            let (data, meta) = file_paths(dst, self.id.name());
            std::fs::write(data, state.data.read(0, state.data.len()))?;
            std::fs::write(meta, state.meta.read(0, state.meta.len()))?;
            Ok(())
        })?;

        tracing::info!(id = %self.id, dst = %dst.display(), "backed up store");
        Ok(())
    }

    /// Replace the whole content with the backup in `src`.
    ///
    /// The backup is validated first and left untouched. Its values keep the encryption they
    /// were written with.
    pub(crate) fn restore_from(&self, src: &Path) -> Result<()> {
        self.require_file("restored")?;
        let log = validate_files(src, self.id.name())?;
        let mut entries = HashMap::new();
        codec::decode_into(&log, &mut entries);

        self.exclusive(|open, state| {
            let log = codec::encode_all(&entries);
            self.make_room(open, state, log.len())?;
            state.rewrite(&log)?;
            state.entries = entries;
            Ok(())
        })?;

        tracing::info!(id = %self.id, src = %src.display(), "restored store");
        Ok(())
    }

    fn require_file(&self, what: &str) -> Result<()> {
        if self.backing == Backing::Anonymous {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("anonymous store [{}] can not be {what}", self.id),
            )));
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.local(|_, state| -> io::Result<()> {
            state.data.flush()?;
            state.meta.flush()
        })??;
        Ok(())
    }

    fn make_room(&self, open: &Open, state: &mut State, required: usize) -> Result<()> {
        match self.backing {
            Backing::Anonymous if required > state.data.len() => Err(Error::FixedSizeExceeded {
                id: self.id.clone(),
                capacity: state.data.len(),
                required,
            }),
            Backing::Anonymous => Ok(()),
            Backing::File => {
                let wanted = required + required / 2;
                if wanted <= state.data.len() {
                    return Ok(());
                }

                let mut len = state.data.len().max(self.page_size);
                while len < wanted {
                    len *= 2;
                }

                open.fds.data.set_len(len as u64)?;
                state.data = Segment::map(&open.fds.data)?;
                tracing::info!(id = %self.id, len, "grew data segment");
                Ok(())
            }
        }
    }

    fn shrink(&self, open: &Open, state: &mut State, len: usize) -> Result<()> {
        if self.backing == Backing::Anonymous || len >= state.data.len() {
            return Ok(());
        }

        open.fds.data.set_len(len as u64)?;
        state.data = Segment::map(&open.fds.data)?;
        Ok(())
    }

    pub(crate) fn crypt_key(&self) -> Result<Option<String>> {
        self.local(|_, state| state.crypter.as_ref().map(|c| c.key().to_owned()))
    }

    /// Re-encrypt all values under `new_key`, or decrypt them for an empty key.
    ///
    /// Returns the key epoch the store is at afterwards.
    pub(crate) fn rekey(&self, new_key: &str) -> Result<u32> {
        self.exclusive(|open, state| {
            let crypter = Crypter::new(new_key);
            let mut entries = HashMap::with_capacity(state.entries.len());

            for (key, stored) in &state.entries {
                let Some(plain) = reveal(state.crypter.as_ref(), stored) else {
                    tracing::warn!(id = %self.id, key, "dropping value that does not decrypt");
                    continue;
                };

                let sealed = conceal(crypter.as_ref(), &plain)
                    .ok_or_else(|| io::Error::other("value encryption failed"))?;
                entries.insert(key.clone(), sealed);
            }

            let log = codec::encode_all(&entries);
            self.make_room(open, state, log.len())?;
            state.rewrite(&log)?;
            state.entries = entries;
            state.crypter = crypter;

            let epoch = state
                .meta
                .word(KEY_EPOCH_AT)
                .fetch_add(1, Ordering::AcqRel)
                .wrapping_add(1);
            Ok(epoch)
        })
    }

    /// Use `new_key` for subsequent reads and writes, without touching stored values.
    pub(crate) fn reset_key(&self, new_key: &str) -> Result<()> {
        self.shared(|_, state| {
            state.crypter = Crypter::new(new_key);
            state.reload_all();
            Ok(())
        })
    }

    pub(crate) fn key_epoch(&self) -> Result<u32> {
        self.local(|_, state| state.word(KEY_EPOCH_AT))
    }

    /// Take the inter-process lock, blocking until it is available.
    pub(crate) fn lock(&self) -> Result<()> {
        if !self.gate.enter() {
            return Ok(());
        }

        let locked = self.with_meta(|meta| self.meta_lock.lock(meta, LockType::Exclusive));
        if locked.is_err() {
            self.gate.leave();
        }
        locked
    }

    pub(crate) fn try_lock(&self) -> Result<bool> {
        match self.gate.try_enter() {
            None => return Ok(false),
            Some(false) => return Ok(true),
            Some(true) => {}
        }

        let locked = self.with_meta(|meta| self.meta_lock.try_lock(meta, LockType::Exclusive));
        if !matches!(locked, Ok(true)) {
            self.gate.leave();
        }
        locked
    }

    pub(crate) fn unlock(&self) -> Result<()> {
        match self.gate.leave() {
            None => {
                tracing::warn!(id = %self.id, "unlock without holding the lock");
                Ok(())
            }
            Some(false) => Ok(()),
            Some(true) => match self.with_meta(|meta| self.meta_lock.unlock(meta, LockType::Exclusive)) {
                // Closing released it already.
                Err(Error::Closed(_)) => Ok(()),
                other => other.map(drop),
            },
        }
    }

    fn with_meta<R>(&self, f: impl FnOnce(BorrowedFd<'_>) -> io::Result<R>) -> Result<R> {
        let open = self.open.read();
        let open = open.as_ref().ok_or_else(|| self.closed())?;
        Ok(f(open.fds.meta.as_fd())?)
    }

    pub(crate) fn raw_fds(&self) -> Result<(RawFd, RawFd)> {
        let open = self.open.read();
        let open = open.as_ref().ok_or_else(|| self.closed())?;
        Ok((open.fds.data.as_raw_fd(), open.fds.meta.as_raw_fd()))
    }

    /// Run `f` with the data and meta descriptors, keeping them open meanwhile.
    pub(crate) fn with_descriptors<R>(
        &self,
        f: impl FnOnce(BorrowedFd<'_>, BorrowedFd<'_>) -> R,
    ) -> Result<R> {
        let open = self.open.read();
        let open = open.as_ref().ok_or_else(|| self.closed())?;
        Ok(f(open.fds.data.as_fd(), open.fds.meta.as_fd()))
    }

    /// Keep further descriptors of this store's segments open until it is closed.
    pub(crate) fn park(&self, fds: impl IntoIterator<Item = SharedFd>) -> Result<()> {
        let open = self.open.read();
        let open = open.as_ref().ok_or_else(|| self.closed())?;
        open.parked.lock().extend(fds);
        Ok(())
    }

    /// Unmap the segments and close every descriptor.
    ///
    /// This drops all record locks of the process on the store.
    pub(crate) fn close(&self) {
        let Some(open) = self.open.write().take() else {
            return;
        };

        if let Err(err) = open.state.lock().data.flush() {
            tracing::warn!(id = %self.id, error = %err, "flush on close failed");
        }

        drop(open);
        self.meta_lock.reset();
        self.mode_lock.reset();
        tracing::info!(id = %self.id, "closed store");
    }
}

struct Leave<'a>(&'a ThreadGate);

impl Drop for Leave<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

impl State {
    fn word(&self, at: usize) -> u32 {
        self.meta.word(at).load(Ordering::Acquire)
    }

    fn read_seen(&self) -> Seen {
        Seen {
            sequence: self.word(SEQUENCE_AT),
            generation: self.word(GENERATION_AT),
            actual_size: self.word(ACTUAL_SIZE_AT),
        }
    }

    fn format(&mut self) {
        for at in [SEQUENCE_AT, ACTUAL_SIZE_AT, GENERATION_AT, KEY_EPOCH_AT] {
            self.meta.word(at).store(0, Ordering::Relaxed);
        }
        self.meta.word(SEQUENCE_AT).store(1, Ordering::Relaxed);
        self.meta.word(VERSION_AT).store(VERSION, Ordering::Relaxed);
        self.meta.word(MAGIC_AT).store(MAGIC, Ordering::Release);
    }

    fn reload_all(&mut self) {
        let seen = self.read_seen();
        let log = self.data.read(0, seen.actual_size as usize);
        self.entries.clear();
        codec::decode_into(&log, &mut self.entries);
        self.seen = seen;
    }

    fn append(&mut self, record: &[u8]) -> io::Result<()> {
        let at = self.seen.actual_size as usize;
        let size = log_size(at + record.len())?;
        if !self.data.write(at, record) {
            return Err(io::Error::other("record does not fit the data segment"));
        }

        self.meta.word(ACTUAL_SIZE_AT).store(size, Ordering::Release);
        let generation = self
            .meta
            .word(GENERATION_AT)
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);

        self.seen.actual_size = size;
        self.seen.generation = generation;
        Ok(())
    }

    /// Replace the whole log, which must fit the data segment.
    fn rewrite(&mut self, log: &[u8]) -> io::Result<()> {
        let size = log_size(log.len())?;
        if !self.data.write(0, log) {
            return Err(io::Error::other("log does not fit the data segment"));
        }

        self.meta.word(ACTUAL_SIZE_AT).store(size, Ordering::Release);
        self.meta.word(SEQUENCE_AT).fetch_add(1, Ordering::AcqRel);
        self.seen = self.read_seen();
        Ok(())
    }
}

fn log_size(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "log does not fit the 32 bit size field",
        )
    })
}

/// The data and metadata files of store `name` below `root`.
pub(crate) fn file_paths(root: &Path, name: &str) -> (PathBuf, PathBuf) {
    (root.join(name), root.join(format!("{name}.crc")))
}

/// Check that the files of store `name` below `root` hold a complete log, and return it.
///
/// Reads without taking any lock, a store being written meanwhile may fail the check.
pub(crate) fn validate_files(root: &Path, name: &str) -> io::Result<Vec<u8>> {
    let invalid = |reason: &'static str| io::Error::new(io::ErrorKind::InvalidData, reason);
    let (data_path, meta_path) = file_paths(root, name);

    let meta = std::fs::read(meta_path)?;
    if meta.len() < META_LEN {
        return Err(invalid("metadata file is too small"));
    }

    let word = |at: usize| {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&meta[at..at + 4]);
        u32::from_ne_bytes(bytes)
    };

    if word(MAGIC_AT) != MAGIC || word(VERSION_AT) != VERSION {
        return Err(invalid("metadata file is not formatted"));
    }

    let mut log = std::fs::read(data_path)?;
    let actual_size = word(ACTUAL_SIZE_AT) as usize;
    if actual_size > log.len() {
        return Err(invalid("log extends past the data file"));
    }

    log.truncate(actual_size);
    if codec::decode_into(&log, &mut HashMap::new()) != actual_size {
        return Err(invalid("log holds a malformed record"));
    }

    Ok(log)
}

fn apply(entries: &mut HashMap<String, Vec<u8>>, key: &str, stored: Option<Vec<u8>>) {
    match stored {
        Some(stored) => entries.insert(key.to_owned(), stored),
        None => entries.remove(key),
    };
}

pub(crate) fn page_align(len: usize, page_size: usize) -> usize {
    len.max(1).div_ceil(page_size) * page_size
}

pub(crate) fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}
