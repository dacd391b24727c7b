use std::sync::Arc;

use parking_lot::RwLock;

use crate::StoreId;

/// Callback for content written to a store by another process.
pub type ContentChangeListener = Arc<dyn Fn(&StoreId) + Send + Sync>;

/// Hands external-change events to the one listener of a context.
///
/// Nothing is delivered in the background. Events surface inside calls the application makes on
/// a store, on the calling thread.
#[derive(Default)]
pub struct ChangeNotifier {
    listener: RwLock<Option<ContentChangeListener>>,
}

impl ChangeNotifier {
    /// Install `listener`, replacing any previous one.
    pub fn register(&self, listener: impl Fn(&StoreId) + Send + Sync + 'static) {
        *self.listener.write() = Some(Arc::new(listener));
    }

    pub fn unregister(&self) {
        *self.listener.write() = None;
    }

    pub fn is_registered(&self) -> bool {
        self.listener.read().is_some()
    }

    /// Tell the listener about `id`. Returns whether there was one.
    pub fn notify(&self, id: &StoreId) -> bool {
        // Not called under the lock, the listener may well register another one.
        let listener = self.listener.read().clone();

        match listener {
            Some(listener) => {
                tracing::debug!(id = %id, "content changed by another process");
                listener(id);
                true
            }
            None => false,
        }
    }
}
