use std::collections::BTreeSet;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use shmkv_fd::SharedFd;

use crate::envelope::FdEnvelope;
use crate::error::{Error, Result};
use crate::rekey::{self, PendingRekey};
use crate::store::{Backing, MappedStore};
use crate::table::NativeHandle;
use crate::{Context, ProcessMode, StoreId};

/// An open store.
///
/// Clones refer to the same handle. Closing any of them closes all.
#[derive(Clone)]
pub struct Kv {
    ctx: Arc<Context>,
    handle: NativeHandle,
    store: Arc<MappedStore>,
}

impl Kv {
    pub(crate) fn new(ctx: Arc<Context>, handle: NativeHandle, store: Arc<MappedStore>) -> Self {
        Kv { ctx, handle, store }
    }

    pub(crate) fn store(&self) -> &Arc<MappedStore> {
        &self.store
    }

    pub fn id(&self) -> &StoreId {
        self.store.id()
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn mode(&self) -> ProcessMode {
        self.store.mode()
    }

    /// Whether the store lives in anonymous shared memory.
    pub fn is_anonymous(&self) -> bool {
        self.store.backing() == Backing::Anonymous
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_closed()
    }

    /// Pass `result` on, after reporting content that another process changed meanwhile.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if self.store.take_change() {
            self.ctx.notifier().notify(self.id());
        }
        result
    }

    pub fn set_bytes(&self, key: &str, value: &[u8]) -> Result<()> {
        self.observe(self.store.encode(key, Some(value)))
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.observe(self.store.decode(key))
    }

    fn get_array<const N: usize>(&self, key: &str) -> Result<Option<[u8; N]>> {
        Ok(self.get_bytes(key)?.and_then(|bytes| bytes.try_into().ok()))
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set_bytes(key, &[u8::from(value)])
    }

    /// `None` if absent or not a bool.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.get_array::<1>(key)?.and_then(|[b]| match b {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }))
    }

    pub fn set_i32(&self, key: &str, value: i32) -> Result<()> {
        self.set_bytes(key, &value.to_le_bytes())
    }

    pub fn get_i32(&self, key: &str) -> Result<Option<i32>> {
        Ok(self.get_array(key)?.map(i32::from_le_bytes))
    }

    pub fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        self.set_bytes(key, &value.to_le_bytes())
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.get_array(key)?.map(i64::from_le_bytes))
    }

    pub fn set_f64(&self, key: &str, value: f64) -> Result<()> {
        self.set_bytes(key, &value.to_le_bytes())
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.get_array(key)?.map(f64::from_le_bytes))
    }

    pub fn set_str(&self, key: &str, value: &str) -> Result<()> {
        self.set_bytes(key, value.as_bytes())
    }

    /// `None` if absent or not UTF-8.
    pub fn get_str(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_bytes(key)?.and_then(|bytes| String::from_utf8(bytes).ok()))
    }

    pub fn set_string_set<S: AsRef<str>>(
        &self,
        key: &str,
        values: impl IntoIterator<Item = S>,
    ) -> Result<()> {
        let values: BTreeSet<String> = values
            .into_iter()
            .map(|value| value.as_ref().to_owned())
            .collect();

        let bytes = serde_json::to_vec(&values).map_err(|err| Error::Io(err.into()))?;
        self.set_bytes(key, &bytes)
    }

    /// The strings stored under `key`, collected into any container the caller picks.
    pub fn get_string_set<C: FromIterator<String>>(&self, key: &str) -> Result<Option<C>> {
        let Some(bytes) = self.get_bytes(key)? else {
            return Ok(None);
        };

        match serde_json::from_slice::<Vec<String>>(&bytes) {
            Ok(values) => Ok(Some(values.into_iter().collect())),
            Err(err) => {
                tracing::warn!(id = %self.id(), key, error = %err, "value is not a string set");
                Ok(None)
            }
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        self.observe(self.store.contains(key))
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.observe(self.store.encode(key, None))
    }

    pub fn remove_values<'k>(&self, keys: impl IntoIterator<Item = &'k str>) -> Result<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.observe(self.store.keys())
    }

    pub fn count(&self) -> Result<usize> {
        self.observe(self.store.count())
    }

    /// Length of the plain value under `key`, 0 if absent.
    pub fn value_size(&self, key: &str) -> Result<usize> {
        Ok(self.get_bytes(key)?.map_or(0, |value| value.len()))
    }

    /// Bytes the record of `key` takes in the data segment, including any encryption overhead.
    pub fn stored_size(&self, key: &str) -> Result<usize> {
        self.observe(self.store.record_len(key))
    }

    /// Size of the data segment in bytes.
    pub fn total_size(&self) -> Result<usize> {
        self.observe(self.store.total_size())
    }

    /// Bytes of the data segment in use.
    pub fn actual_size(&self) -> Result<usize> {
        self.observe(self.store.actual_size())
    }

    pub fn clear_all(&self) -> Result<()> {
        self.observe(self.store.clear_all())
    }

    /// Drop superseded records and give back unused space of file-backed stores.
    pub fn trim(&self) -> Result<()> {
        self.observe(self.store.trim())
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    /// Free the decoded entries held in memory. They are read back from the store on next use.
    pub fn clear_memory_cache(&self) -> Result<()> {
        self.store.clear_memory_cache()
    }

    /// Close the store for every holder of this handle in the process.
    pub fn close(self) {
        self.ctx.close(self.handle);
    }

    /// Block until this process holds the store's inter-process lock.
    ///
    /// The lock is recursive for the calling thread and excludes other threads as well as other
    /// processes. It is released if the process dies.
    pub fn lock(&self) -> Result<()> {
        self.store.lock()
    }

    /// Take the lock if it is free, never blocking.
    pub fn try_lock(&self) -> Result<bool> {
        self.store.try_lock()
    }

    pub fn unlock(&self) -> Result<()> {
        self.store.unlock()
    }

    pub fn crypt_key(&self) -> Result<Option<String>> {
        self.store.crypt_key()
    }

    /// Re-encrypt the store under `new_key`, or decrypt it for an empty key.
    ///
    /// Other processes holding the store must then [`reset_key_only`](Kv::reset_key_only), for
    /// example by [applying](PendingRekey::apply) the returned rotation.
    pub fn rotate_key(&self, new_key: &str) -> Result<PendingRekey> {
        self.observe(rekey::rotate_key(self, new_key))
    }

    /// Read and write with `new_key` from now on, leaving stored values untouched.
    pub fn reset_key_only(&self, new_key: &str) -> Result<()> {
        self.observe(rekey::reset_key_only(self, new_key))
    }

    /// Check for content written by other processes, notifying the listener if there is some.
    pub fn check_content_changed(&self) -> Result<bool> {
        let changed = self.store.check_external_change()?;
        if changed {
            self.ctx.notifier().notify(self.id());
        }
        Ok(changed)
    }

    /// The data segment's descriptor, owned by the store.
    pub fn ashmem_fd(&self) -> Result<RawFd> {
        Ok(self.store.raw_fds()?.0)
    }

    /// The metadata segment's descriptor, owned by the store.
    pub fn ashmem_meta_fd(&self) -> Result<RawFd> {
        Ok(self.store.raw_fds()?.1)
    }

    /// Copies of the store's descriptors, for another process to [adopt](Context::adopt).
    ///
    /// Dropping the envelope in this process closes the copies, which also drops every record
    /// lock this process holds on the store.
    pub fn export_envelope(&self) -> Result<FdEnvelope> {
        let (data, meta) = self
            .store
            .with_descriptors(|data, meta| -> io::Result<_> {
                Ok((data.try_clone_to_owned()?, meta.try_clone_to_owned()?))
            })??;

        Ok(FdEnvelope::new(
            self.id().clone(),
            self.mode(),
            Some(SharedFd::from_owned(data)),
            Some(SharedFd::from_owned(meta)),
            self.crypt_key()?,
        ))
    }
}

impl core::fmt::Debug for Kv {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kv")
            .field("id", self.id())
            .field("handle", &self.handle)
            .field("mode", &self.mode())
            .finish()
    }
}
