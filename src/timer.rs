use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Handle for an armed refresh timer.
pub trait IdleRefreshTimer: Send {
    /// Prevent the callback from running if it has not fired yet.
    fn cancel(&self);
}

/// Arms one-shot timers. Callbacks run at most once, on an unspecified thread.
pub trait IdleRefreshManager: Send + Sync {
    fn start_timer(
        &self,
        timeout: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Box<dyn IdleRefreshTimer>;
}

enum TimerSignal {
    Cancel,
    FireNow,
}

type ArmedTimers = Arc<Mutex<HashMap<u64, mpsc::Sender<TimerSignal>>>>;

fn lock_timers(timers: &ArmedTimers) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<TimerSignal>>> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs every armed timer on its own short-lived thread.
#[derive(Default)]
pub struct ThreadRefreshManager {
    armed: ArmedTimers,
    next_id: AtomicU64,
}

impl ThreadRefreshManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire all armed timers now. Used when the network changed and every
    /// IDLE connection should be re-established.
    pub fn reset_timers(&self) {
        let senders: Vec<_> = lock_timers(&self.armed).drain().map(|(_, tx)| tx).collect();
        log::debug!("Firing {} armed refresh timer(s) early", senders.len());
        for tx in senders {
            let _ = tx.send(TimerSignal::FireNow);
        }
    }

    pub fn armed_count(&self) -> usize {
        lock_timers(&self.armed).len()
    }
}

struct ThreadTimer {
    tx: mpsc::Sender<TimerSignal>,
}

impl IdleRefreshTimer for ThreadTimer {
    fn cancel(&self) {
        // The thread may already be gone after firing.
        let _ = self.tx.send(TimerSignal::Cancel);
    }
}

impl IdleRefreshManager for ThreadRefreshManager {
    fn start_timer(
        &self,
        timeout: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Box<dyn IdleRefreshTimer> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        lock_timers(&self.armed).insert(id, tx.clone());

        let armed = Arc::clone(&self.armed);
        thread::spawn(move || {
            let fire = match rx.recv_timeout(timeout) {
                Ok(TimerSignal::FireNow) | Err(RecvTimeoutError::Timeout) => true,
                Ok(TimerSignal::Cancel) | Err(RecvTimeoutError::Disconnected) => false,
            };
            lock_timers(&armed).remove(&id);
            if fire {
                log::trace!("Refresh timer {} fired", id);
                callback();
            }
        });

        Box::new(ThreadTimer { tx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> Box<dyn FnOnce() + Send> {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn timer_fires_once_after_timeout() {
        let manager = ThreadRefreshManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let _timer = manager.start_timer(Duration::from_millis(20), counting_callback(&fired));
        thread::sleep(Duration::from_millis(300));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.armed_count(), 0);
    }

    #[test]
    fn canceled_timer_never_fires() {
        let manager = ThreadRefreshManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = manager.start_timer(Duration::from_millis(100), counting_callback(&fired));
        timer.cancel();
        thread::sleep(Duration::from_millis(300));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reset_timers_fires_early() {
        let manager = ThreadRefreshManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let _timer = manager.start_timer(Duration::from_secs(3600), counting_callback(&fired));
        manager.reset_timers();
        thread::sleep(Duration::from_millis(200));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
