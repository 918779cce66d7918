use std::{
    panic::{self, AssertUnwindSafe},
    sync::RwLock,
};

use crate::models::LifecycleEvent;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A lifecycle event listener.
pub type EventListener = Box<dyn Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync>;

/// Delivers lifecycle events to listeners, synchronously and in registration order.
///
/// A listener that fails or panics is logged and skipped. It never stops delivery to the
/// listeners after it, nor the operation that emitted the event.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<EventListener>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EventBus {
    /// Creates a bus without listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.push(Box::new(listener));
    }

    /// Delivers `event` to every listener.
    pub fn emit(&self, event: &LifecycleEvent) {
        let listeners = match self.listeners.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for (index, listener) in listeners.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    listener = index,
                    container_id = event.container_id(),
                    error = %e,
                    "lifecycle listener failed"
                ),
                Err(_) => tracing::error!(
                    listener = index,
                    container_id = event.container_id(),
                    "lifecycle listener panicked"
                ),
            }
        }
    }

    /// The number of registered listeners.
    pub fn len(&self) -> usize {
        match self.listeners.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
