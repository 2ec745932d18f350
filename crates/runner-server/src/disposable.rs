//! Ownership list of resources released exactly once on teardown.

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// A resource that must be released on teardown.
pub trait Disposable: Send {
    /// Release the resource.
    fn dispose(&mut self);
}

impl<T: Send> Disposable for JoinHandle<T> {
    fn dispose(&mut self) {
        self.abort();
    }
}

/// Closure-backed disposable; the closure runs at most once.
pub struct DisposeFn(Option<Box<dyn FnOnce() + Send>>);

impl DisposeFn {
    /// Wrap `f`.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }
}

impl Disposable for DisposeFn {
    fn dispose(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Set of registered disposables, drained exactly once.
pub struct DisposableSet {
    items: Mutex<Option<Vec<Box<dyn Disposable>>>>,
}

impl DisposableSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Some(Vec::new())),
        }
    }

    /// Register a resource.
    ///
    /// Once the set has been drained, the resource is released immediately
    /// and `false` is returned.
    pub fn register(&self, mut item: Box<dyn Disposable>) -> bool {
        let mut items = self.items.lock();
        match items.as_mut() {
            Some(list) => {
                list.push(item);
                true
            }
            None => {
                drop(items);
                item.dispose();
                false
            }
        }
    }

    /// Release every registered resource, newest first.
    ///
    /// Returns the number released, or `None` if the set was already drained.
    pub fn dispose_all(&self) -> Option<usize> {
        let drained = self.items.lock().take()?;
        let count = drained.len();
        for mut item in drained.into_iter().rev() {
            item.dispose();
        }
        debug!("Released {} disposable resource(s)", count);
        Some(count)
    }

    /// Whether the set has been drained.
    pub fn is_disposed(&self) -> bool {
        self.items.lock().is_none()
    }

    /// Number of resources currently held.
    pub fn len(&self) -> usize {
        self.items.lock().as_ref().map_or(0, Vec::len)
    }

    /// Whether no resources are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DisposableSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DisposableSet {
    fn drop(&mut self) {
        self.dispose_all();
    }
}
