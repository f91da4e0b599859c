use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

pub type WatchdogId = u32;

/// Callback invoked when a watchdog expires
pub trait TimeoutHandler: Send + Sync {
    fn on_timeout(&self, id: WatchdogId);
}

struct Entry {
    timeout_ms: i64,
    deadline: i64,
    active: bool,
    handler: Arc<dyn TimeoutHandler>,
}

/// Registry of periodic, pingable timeouts.
///
/// Times are milliseconds supplied by the caller, so the same registry runs
/// against the wall clock ([`spawn_ticker`]) or against replayed trace time.
pub struct Watchdog {
    offset: WatchdogId,
    entries: Mutex<HashMap<WatchdogId, Entry>>,
}

impl Watchdog {
    pub fn new(offset: WatchdogId) -> Self {
        Watchdog {
            offset,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<WatchdogId, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an inactive watchdog; returns its handle
    pub fn register(&self, handler: Arc<dyn TimeoutHandler>, timeout_ms: i64) -> WatchdogId {
        let mut entries = self.entries();
        let mut id = self.offset + 1;
        while entries.contains_key(&id) {
            id += 1;
        }
        entries.insert(
            id,
            Entry {
                timeout_ms,
                deadline: 0,
                active: false,
                handler,
            },
        );
        log::debug!("[WD] registered {} ({} ms)", id, timeout_ms);
        id
    }

    /// Begin counting down; no effect on a running watchdog
    pub fn start(&self, id: WatchdogId, now: i64) -> bool {
        match self.entries().get_mut(&id) {
            Some(entry) if !entry.active => {
                entry.active = true;
                entry.deadline = now + entry.timeout_ms;
                true
            }
            _ => false,
        }
    }

    pub fn pause(&self, id: WatchdogId) -> bool {
        match self.entries().get_mut(&id) {
            Some(entry) if entry.active => {
                entry.active = false;
                true
            }
            _ => false,
        }
    }

    /// Restart the countdown of a running watchdog
    pub fn ping(&self, id: WatchdogId, now: i64) -> bool {
        match self.entries().get_mut(&id) {
            Some(entry) if entry.active => {
                entry.deadline = now + entry.timeout_ms;
                true
            }
            _ => false,
        }
    }

    /// Restart the countdown of a running watchdog with a new duration
    pub fn ping_with(&self, id: WatchdogId, now: i64, timeout_ms: i64) -> bool {
        match self.entries().get_mut(&id) {
            Some(entry) if entry.active => {
                entry.timeout_ms = timeout_ms;
                entry.deadline = now + timeout_ms;
                true
            }
            _ => false,
        }
    }

    pub fn kill(&self, id: WatchdogId) -> bool {
        self.entries().remove(&id).is_some()
    }

    pub fn is_active(&self, id: WatchdogId) -> bool {
        self.entries().get(&id).map_or(false, |e| e.active)
    }

    /// Fire every expired watchdog; returns how many fired.
    ///
    /// Expired entries are re-armed before their handlers run, and handlers are
    /// called with the registry unlocked so they may call back into it.
    pub fn poll(&self, now: i64) -> usize {
        let expired: Vec<(WatchdogId, Arc<dyn TimeoutHandler>)> = {
            let mut entries = self.entries();
            let mut expired: Vec<_> = entries
                .iter_mut()
                .filter(|(_, e)| e.active && e.deadline <= now)
                .map(|(id, e)| {
                    e.deadline = now + e.timeout_ms;
                    (*id, e.handler.clone())
                })
                .collect();
            expired.sort_by_key(|(id, _)| *id);
            expired
        };
        for (id, handler) in &expired {
            log::debug!("[WD] {} expired", id);
            handler.on_timeout(*id);
        }
        expired.len()
    }
}

/// Poll `watchdog` against the wall clock every `period`
pub fn spawn_ticker(watchdog: Arc<Watchdog>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            watchdog.poll(Utc::now().timestamp_millis());
        }
    })
}
