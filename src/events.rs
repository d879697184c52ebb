use std::sync::{Arc, Mutex};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Registered-callback list for one event type.
///
/// Callbacks run in registration order. The list is snapshotted before
/// invoking, so a callback may subscribe further listeners without deadlocking.
pub struct Listeners<T> {
    callbacks: Mutex<Vec<Callback<T>>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Listeners<T> {
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.lock().push(Arc::new(callback));
    }

    pub fn notify(&self, event: &T) {
        let callbacks = self.lock().clone();

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Callback<T>>> {
        // a panicking listener never leaves the list itself inconsistent
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
