/*!
Idle-timeout watchdog.

Owns a map from container name to absolute expiry instant, mutated by the
API (set/reset/remove) and read by a dedicated sweep thread. Expired entries
are removed from the map *before* the stop callback runs, so a callback fires
at most once per expiry; a failing callback is logged and never retried.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Stop routine invoked for each expired container; returns false when the
/// stop itself failed.
pub type ExpiryCallback = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct Inner {
    entries: Mutex<HashMap<String, Instant>>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle; all clones share the same map and sweep thread.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    /// Start the sweep thread. It wakes every `poll_interval`, collects
    /// entries whose expiry has passed, and invokes `callback` for each of
    /// them outside the lock.
    pub fn spawn(poll_interval: Duration, callback: ExpiryCallback) -> Watchdog {
        let inner = Arc::new(Inner {
            entries: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            handle: Mutex::new(None),
        });
        let sweep_inner = inner.clone();
        let handle = std::thread::spawn(move || {
            sweep_loop(&sweep_inner, poll_interval, callback);
        });
        *inner.handle.lock().expect("watchdog handle lock") = Some(handle);
        Watchdog { inner }
    }

    /// Insert or overwrite the entry for `name` to expire `ttl` from now.
    pub fn set(&self, name: &str, ttl: Duration) {
        let mut entries = self.lock_entries();
        entries.insert(name.to_string(), Instant::now() + ttl);
        debug!(container = name, ttl_secs = ttl.as_secs(), "watchdog entry set");
    }

    /// Heartbeat from the client; same effect as [`Watchdog::set`].
    pub fn reset(&self, name: &str, ttl: Duration) {
        self.set(name, ttl);
    }

    /// Drop the entry if present; absent is not an error.
    pub fn remove(&self, name: &str) {
        let mut entries = self.lock_entries();
        if entries.remove(name).is_some() {
            debug!(container = name, "watchdog entry removed");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock_entries().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Stop the sweep loop and join the thread. Idempotent.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let handle = self.inner.handle.lock().expect("watchdog handle lock").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("watchdog sweep thread panicked");
            }
        }
        info!("watchdog stopped");
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.inner.entries.lock().expect("watchdog entries lock")
    }
}

fn sweep_loop(inner: &Inner, poll_interval: Duration, callback: ExpiryCallback) {
    while inner.running.load(Ordering::SeqCst) {
        let now = Instant::now();
        // Snapshot and remove expired entries under the lock; run the stop
        // callback outside it so a slow runtime call cannot stall set/reset.
        let expired: Vec<String> = {
            let mut entries = inner.entries.lock().expect("watchdog entries lock");
            let names: Vec<String> = entries
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                entries.remove(name);
            }
            names
        };
        for name in expired {
            info!(container = %name, "idle timeout expired, stopping container");
            if !callback(&name) {
                warn!(container = %name, "expiry stop failed; entry dropped without retry");
            }
        }
        // Sleep in small slices so shutdown is prompt.
        let mut slept = Duration::ZERO;
        while slept < poll_interval && inner.running.load(Ordering::SeqCst) {
            let slice = Duration::from_millis(50).min(poll_interval - slept);
            std::thread::sleep(slice);
            slept += slice;
        }
    }
}
