//! Ordered startup/shutdown hooks and the global stop latch.
//!
//! Startup hooks run in ascending priority; shutdown hooks run in
//! descending priority with panics caught and logged.  The [`Stopped`]
//! latch is cleared before startup hooks run and set before shutdown hooks
//! run, so every background loop observes the stop signal regardless of
//! hook ordering.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::warn;

// ---------------------------------------------------------------------------
// Stopped latch
// ---------------------------------------------------------------------------

/// A settable/clearable latch observed by all background loops.
///
/// Unlike a cancellation token this latch can be cleared again, which is
/// what lets a host be started, stopped, and restarted in one process.
#[derive(Clone)]
pub struct Stopped {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Stopped {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Stopped { tx: std::sync::Arc::new(tx) }
    }

    pub fn set(&self) {
        let _ = self.tx.send(true);
    }

    pub fn clear(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the latch is set.  Callers race this against their work
    /// in a `select!`.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped: the host is gone, treat as stopped.
                return;
            }
        }
    }
}

impl Default for Stopped {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Hook registries
// ---------------------------------------------------------------------------

type Hook = Box<dyn Fn() + Send + Sync>;

pub const DEFAULT_PRIORITY: i32 = 50;

pub struct Lifecycle {
    startup: Mutex<Vec<(i32, Hook)>>,
    shutdown: Mutex<Vec<(i32, Hook)>>,
    pub stopped: Stopped,
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle {
            startup: Mutex::new(Vec::new()),
            shutdown: Mutex::new(Vec::new()),
            stopped: Stopped::new(),
        }
    }

    pub fn on_startup(&self, priority: i32, hook: impl Fn() + Send + Sync + 'static) {
        self.startup.lock().expect("startup registry lock").push((priority, Box::new(hook)));
    }

    pub fn on_shutdown(&self, priority: i32, hook: impl Fn() + Send + Sync + 'static) {
        self.shutdown.lock().expect("shutdown registry lock").push((priority, Box::new(hook)));
    }

    /// Clear the stop latch, then run startup hooks in ascending priority.
    /// A startup hook that panics aborts startup; broken startup should be
    /// loud, not swallowed.
    pub fn run_startup(&self) {
        self.stopped.clear();
        let hooks = self.startup.lock().expect("startup registry lock");
        let mut order: Vec<usize> = (0..hooks.len()).collect();
        order.sort_by_key(|&i| hooks[i].0);
        for i in order {
            (hooks[i].1)();
        }
    }

    /// Set the stop latch, then run shutdown hooks in descending priority.
    /// Shutdown hook panics are caught and logged so that every hook gets
    /// its chance to run.
    pub fn run_shutdown(&self) {
        self.stopped.set();
        let hooks = self.shutdown.lock().expect("shutdown registry lock");
        let mut order: Vec<usize> = (0..hooks.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(hooks[i].0));
        for i in order {
            if catch_unwind(AssertUnwindSafe(|| (hooks[i].1)())).is_err() {
                warn!("ignored panic in shutdown hook");
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
