//! Slow-network watchdog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

/// How long a download may run before the network counts as slow.
pub const SLOW_NETWORK_AFTER: Duration = Duration::from_secs(5);

/// One-shot timer armed for the duration of a download.
///
/// On expiry it raises a flag and runs its callback on the timer thread, so
/// the notice goes out while the download is still stalled. It never
/// interrupts the download.
#[derive(Debug)]
pub struct Watchdog {
    expired: Arc<AtomicBool>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Arm a watchdog that runs `on_expire` once `interval` elapses.
    pub fn start(interval: Duration, on_expire: impl FnOnce() + Send + 'static) -> Self {
        let expired = Arc::new(AtomicBool::new(false));
        let stop = Arc::new((Mutex::new(false), Condvar::new()));

        let thread_expired = Arc::clone(&expired);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("hwauth-watchdog".into())
            .spawn(move || {
                let fired = {
                    let (lock, cvar) = &*thread_stop;
                    let stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
                    let (stopped, timeout) = cvar
                        .wait_timeout_while(stopped, interval, |stopped| !*stopped)
                        .unwrap_or_else(PoisonError::into_inner);
                    timeout.timed_out() && !*stopped
                };
                if fired {
                    debug!("Watchdog expired after {interval:?}");
                    thread_expired.store(true, Ordering::SeqCst);
                    on_expire();
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Could not start slow-network watchdog: {e}");
                None
            },
        };

        Self {
            expired,
            stop,
            handle,
        }
    }

    /// Whether the interval elapsed.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Disarm and return whether it had expired.
    pub fn stop(mut self) -> bool {
        self.disarm();
        self.is_expired()
    }

    fn disarm(&mut self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}
