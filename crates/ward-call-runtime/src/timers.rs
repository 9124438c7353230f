//! Per-call response timers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    abort: AbortHandle,
}

/// Registry of armed response timers keyed by call id.
///
/// A firing timer removes its own entry before running the fire action, so a
/// disarm issued from inside that action never aborts it.
#[derive(Debug, Default)]
pub struct ResponseTimers {
    armed: Arc<Mutex<HashMap<String, ArmedTimer>>>,
    next_generation: AtomicU64,
}

impl ResponseTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms (or re-arms) the timer for `call_id`. Must run inside a tokio runtime.
    pub fn arm<F>(&self, call_id: &str, window: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let armed = Arc::clone(&self.armed);
        let key = call_id.to_string();

        // Hold the lock across spawn so a zero-length window cannot fire before insert.
        let mut timers = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tokio::spawn({
            let key = key.clone();
            async move {
                tokio::time::sleep(window).await;
                let still_current = {
                    let mut timers = armed.lock().unwrap_or_else(PoisonError::into_inner);
                    match timers.get(&key) {
                        Some(timer) if timer.generation == generation => {
                            timers.remove(&key);
                            true
                        }
                        _ => false,
                    }
                };
                if still_current {
                    on_fire.await;
                }
            }
        });
        if let Some(previous) = timers.insert(
            key,
            ArmedTimer {
                generation,
                abort: task.abort_handle(),
            },
        ) {
            previous.abort.abort();
        }
    }

    /// Cancels the timer for `call_id`; returns false when none was armed.
    pub fn disarm(&self, call_id: &str) -> bool {
        let removed = self
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(call_id);
        match removed {
            Some(timer) => {
                timer.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, call_id: &str) -> bool {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(call_id)
    }

    pub fn armed_count(&self) -> usize {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
