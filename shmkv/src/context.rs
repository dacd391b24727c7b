use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::broker;
use crate::envelope::FdEnvelope;
use crate::error::{Error, Result};
use crate::notify::ChangeNotifier;
use crate::process::ProcessIdentifier;
use crate::store::{self, MappedStore};
use crate::table::{HandleTable, ModeChecker, NativeHandle};
use crate::{Config, Kv, ProcessMode, StoreId};

/// Name of the store behind [`Context::default_store`].
pub const DEFAULT_STORE: &str = "default";

/// Initial data size of file-backed stores.
pub const DEFAULT_CAPACITY: usize = 4096;

/// All state of one process's store layer.
///
/// Built once at process start and shared by every store it opens. Contexts are independent of
/// each other: two contexts in one process behave like two processes, except that record locks
/// never conflict between them.
pub struct Context {
    config: Config,
    identity: ProcessIdentifier,
    registry: Mutex<Registry>,
    notifier: ChangeNotifier,
    page_size: usize,
}

struct Registry {
    table: HandleTable,
    checker: ModeChecker,
}

impl Context {
    pub fn initialize(config: Config) -> Arc<Self> {
        let identity = ProcessIdentifier::from_config(&config);
        Self::with_identity(config, identity)
    }

    /// Use `identity` instead of the one derived from the configuration.
    pub fn with_identity(config: Config, identity: ProcessIdentifier) -> Arc<Self> {
        tracing::info!(
            root = %config.root_dir.display(),
            checker = config.process_mode_checker,
            "initializing store context"
        );

        Arc::new(Context {
            registry: Mutex::new(Registry {
                table: HandleTable::default(),
                checker: ModeChecker::new(config.process_mode_checker),
            }),
            identity,
            notifier: ChangeNotifier::default(),
            page_size: store::page_size(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn root_dir(&self) -> &std::path::Path {
        &self.config.root_dir
    }

    /// Open the file-backed store `id`, creating it if needed.
    pub fn open(
        self: &Arc<Self>,
        id: impl Into<StoreId>,
        mode: ProcessMode,
        crypt_key: Option<&str>,
    ) -> Result<Kv> {
        self.open_with_capacity(id, mode, crypt_key, DEFAULT_CAPACITY)
    }

    /// Like [`Context::open`], reserving `capacity` bytes when the store is created.
    pub fn open_with_capacity(
        self: &Arc<Self>,
        id: impl Into<StoreId>,
        mode: ProcessMode,
        crypt_key: Option<&str>,
        capacity: usize,
    ) -> Result<Kv> {
        let id = id.into();
        let root = self.store_root(&id);

        let mut registry = self.registry.lock();
        self.resolve(&mut registry, id.clone(), mode, || {
            MappedStore::open_file(id, &root, mode, crypt_key, capacity, self.page_size)
        })
    }

    pub fn default_store(self: &Arc<Self>, mode: ProcessMode, crypt_key: Option<&str>) -> Result<Kv> {
        self.open(DEFAULT_STORE, mode, crypt_key)
    }

    /// Get the anonymous store `id` of fixed `size`.
    ///
    /// The owning process creates it. Any other process asks the owner's broker and adopts the
    /// descriptors it answers with. The registry stays locked during that request, so at most
    /// one request per store is in flight.
    pub fn obtain_ashmem(
        self: &Arc<Self>,
        id: impl Into<StoreId>,
        size: usize,
        mode: ProcessMode,
        crypt_key: Option<&str>,
    ) -> Result<Kv> {
        let id = id.into();

        if self.identity.is_owner()? {
            let mut registry = self.registry.lock();
            return self.resolve(&mut registry, id.clone(), mode, || {
                MappedStore::create_anonymous(id, size, mode, crypt_key, self.page_size)
            });
        }

        let mut registry = self.registry.lock();
        if let Some(kv) = self.reuse(&mut registry, &id, mode)? {
            return Ok(kv);
        }

        let endpoint = self.broker_endpoint()?;
        tracing::debug!(id = %id, endpoint = %endpoint.display(), "requesting anonymous store from owner");
        let mut envelope = broker::request_ashmem(
            &endpoint,
            self.config.broker_timeout,
            &id,
            size,
            mode,
            crypt_key,
        )?;

        let (data, meta) = envelope.take_descriptors()?;
        self.resolve(&mut registry, id.clone(), mode, || {
            MappedStore::adopt(id, mode, data, meta, envelope.crypt_key(), self.page_size)
        })
    }

    /// Reconstruct a store from descriptors exported by another process.
    ///
    /// If this context already holds the store, its key is reset to the envelope's and the
    /// received descriptors are kept open alongside the existing ones. This is how peers learn
    /// about a rotated key.
    pub fn adopt(self: &Arc<Self>, mut envelope: FdEnvelope) -> Result<Kv> {
        let (data, meta) = envelope.take_descriptors()?;
        let id = envelope.id().clone();
        let mode = envelope.mode();
        let crypt_key = envelope.crypt_key();

        let mut registry = self.registry.lock();
        if let Some(kv) = self.reuse(&mut registry, &id, mode)? {
            kv.store().park([data, meta])?;
            if kv.crypt_key()?.as_deref() != crypt_key {
                tracing::info!(id = %id, "taking over the key of the received store");
                kv.reset_key_only(crypt_key.unwrap_or(""))?;
            }
            return Ok(kv);
        }

        self.resolve(&mut registry, id.clone(), mode, || {
            MappedStore::adopt(id, mode, data, meta, crypt_key, self.page_size)
        })
    }

    /// Create or look up an anonymous store for another process.
    pub(crate) fn serve_ashmem(
        self: &Arc<Self>,
        name: &str,
        size: usize,
        mode: ProcessMode,
        crypt_key: Option<&str>,
    ) -> Result<Kv> {
        let id = StoreId::new(name);
        let mut registry = self.registry.lock();
        self.resolve(&mut registry, id.clone(), mode, || {
            MappedStore::create_anonymous(id, size, mode, crypt_key, self.page_size)
        })
    }

    /// The store held for `id`, or a new one from `create`.
    fn resolve(
        self: &Arc<Self>,
        registry: &mut Registry,
        id: StoreId,
        mode: ProcessMode,
        create: impl FnOnce() -> Result<MappedStore>,
    ) -> Result<Kv> {
        if let Some(kv) = self.reuse(registry, &id, mode)? {
            return Ok(kv);
        }

        let store = Arc::new(create()?);
        let handle = registry.table.insert(mode, Arc::clone(&store));

        if let Err(err) = registry.checker.verify(handle, &*store, mode) {
            registry.table.remove(handle);
            registry.checker.forget(handle);
            store.close();
            return Err(err);
        }

        Ok(Kv::new(Arc::clone(self), handle, store))
    }

    /// The handle already held for `id`, as it is.
    ///
    /// Its key stays untouched: only the process rotating a key changes it for its peers.
    fn reuse(
        self: &Arc<Self>,
        registry: &mut Registry,
        id: &StoreId,
        mode: ProcessMode,
    ) -> Result<Option<Kv>> {
        let Some((handle, entry)) = registry.table.lookup(id) else {
            return Ok(None);
        };
        let (held, store) = (entry.mode, Arc::clone(&entry.store));

        if held != mode && registry.checker.is_enabled() {
            tracing::error!(id = %id, requested = %mode, held = %held, "process mode mismatch");
            return Err(Error::ModeMismatch {
                id: id.clone(),
                requested: mode,
                actual: held,
            });
        }
        registry.checker.verify(handle, &*store, held)?;

        Ok(Some(Kv::new(Arc::clone(self), handle, store)))
    }

    fn store_root(&self, id: &StoreId) -> PathBuf {
        id.root()
            .map_or_else(|| self.config.root_dir.clone(), PathBuf::from)
    }

    /// The store this context holds for `id`, if any.
    fn held(&self, id: &StoreId) -> Option<Arc<MappedStore>> {
        let registry = self.registry.lock();
        registry
            .table
            .lookup(id)
            .map(|(_, entry)| Arc::clone(&entry.store))
    }

    /// Run `f` on the store `id`, opened just for that if this context does not hold it.
    fn with_file_store<R>(
        &self,
        id: StoreId,
        f: impl FnOnce(&MappedStore) -> Result<R>,
    ) -> Result<R> {
        if let Some(store) = self.held(&id) {
            return f(&store);
        }

        let root = self.store_root(&id);
        let store = MappedStore::open_file(id, &root, ProcessMode::Multi, None, 0, self.page_size)?;
        let result = f(&store);
        store.close();
        result
    }

    /// Whether the files of store `id` hold a complete, readable log.
    ///
    /// Missing files are not valid. Only meaningful while no process writes to the store.
    pub fn is_file_valid(&self, id: impl Into<StoreId>) -> bool {
        let id = id.into();
        match store::validate_files(&self.store_root(&id), id.name()) {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(id = %id, error = %err, "store files are not valid");
                false
            }
        }
    }

    /// Copy the files of store `id` into `dst`.
    ///
    /// Stores this context does not hold must exist and be valid. They are opened for the copy
    /// and closed again, which drops any record lock other contexts of this process hold on them.
    pub fn backup_one_to_directory(&self, id: impl Into<StoreId>, dst: &Path) -> Result<()> {
        let id = id.into();
        if self.held(&id).is_none() {
            store::validate_files(&self.store_root(&id), id.name())?;
        }
        self.with_file_store(id, |store| store.backup_to(dst))
    }

    /// Replace the content of store `id` with its backup in `src`, creating the store if needed.
    pub fn restore_one_from_directory(&self, id: impl Into<StoreId>, src: &Path) -> Result<()> {
        let id = id.into();
        store::validate_files(src, id.name())?;
        self.with_file_store(id, |store| store.restore_from(src))
    }

    /// Back up every store of the root directory into `dst`, returning how many were copied.
    ///
    /// Stores that fail are logged and skipped.
    pub fn backup_all_to_directory(&self, dst: &Path) -> Result<usize> {
        let names = store_names(&self.config.root_dir)?;
        let count = names
            .into_iter()
            .filter(|name| match self.backup_one_to_directory(name.as_str(), dst) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(id = %name, error = %err, "skipping store in backup");
                    false
                }
            })
            .count();
        Ok(count)
    }

    /// Restore every store backed up in `src` into the root directory, returning how many were.
    pub fn restore_all_from_directory(&self, src: &Path) -> Result<usize> {
        let names = store_names(src)?;
        let count = names
            .into_iter()
            .filter(|name| match self.restore_one_from_directory(name.as_str(), src) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(id = %name, error = %err, "skipping store in restore");
                    false
                }
            })
            .count();
        Ok(count)
    }

    fn broker_endpoint(&self) -> Result<PathBuf> {
        if let Some(endpoint) = &self.config.broker_endpoint {
            return Ok(endpoint.clone());
        }

        let owner = self.identity.owner_name()?;
        let endpoint = broker::default_endpoint(&self.config.cache_dir, &owner);
        if !endpoint.exists() {
            return Err(Error::unreachable(
                format!("no broker registered for owner process `{owner}`"),
                None,
            ));
        }

        Ok(endpoint)
    }

    /// Where this process's broker listens when no endpoint is configured.
    pub fn default_broker_endpoint(&self) -> Result<PathBuf> {
        let owner = self.identity.owner_name()?;
        Ok(broker::default_endpoint(&self.config.cache_dir, &owner))
    }

    /// Close `handle` and release its store.
    ///
    /// All copies of the handle are invalid afterwards, their operations fail with
    /// [`Error::Closed`].
    pub fn close(&self, handle: NativeHandle) {
        let entry = {
            let mut registry = self.registry.lock();
            registry.checker.forget(handle);
            registry.table.remove(handle)
        };

        if let Some(entry) = entry {
            entry.store.close();
        }
    }

    /// Number of stores currently open.
    pub fn open_count(&self) -> usize {
        self.registry.lock().table.len()
    }

    pub fn enable_process_mode_checker(&self) {
        self.registry.lock().checker.set_enabled(true);
    }

    pub fn disable_process_mode_checker(&self) {
        self.registry.lock().checker.set_enabled(false);
    }

    pub fn is_process_mode_checker_enabled(&self) -> bool {
        self.registry.lock().checker.is_enabled()
    }

    /// Install the listener for content changed by other processes, replacing the previous one.
    pub fn register_content_change_listener(
        &self,
        listener: impl Fn(&StoreId) + Send + Sync + 'static,
    ) {
        self.notifier.register(listener);
    }

    pub fn unregister_content_change_listener(&self) {
        self.notifier.unregister();
    }

    pub(crate) fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn process_name(&self) -> Result<String> {
        self.identity.current_name()
    }

    /// Whether this process creates anonymous stores itself.
    pub fn is_owner(&self) -> Result<bool> {
        self.identity.is_owner()
    }
}

/// Names of the stores in `dir`: every file with a `<name>.crc` sibling.
fn store_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.ends_with(".crc") && dir.join(format!("{name}.crc")).is_file() {
            names.push(name);
        }
    }

    names.sort();
    Ok(names)
}
