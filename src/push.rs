use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::MailError;
use crate::idle::{FolderIdler, IdleResult};
use crate::remote::IdleStore;
use crate::timer::IdleRefreshManager;
use crate::wakelock::WakeLock;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Receives what the push threads observe.
pub trait PushCallback: Send + Sync {
    /// The folder changed on the server. Called on the folder's push thread;
    /// IDLE resumes once this returns.
    fn on_push_event(&self, folder_server_id: &str);
    fn on_push_error(&self, folder_server_id: &str, error: &MailError);
    fn on_push_not_supported(&self, folder_server_id: &str);
}

/// Doubles the delay after each failure, up to a limit.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

/// A stop flag a sleeping thread can be woken from.
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop(&self) {
        *self.lock() = true;
        self.cond.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.lock()
    }

    /// Sleep for `duration` unless stopped first. Returns whether stopped.
    fn wait(&self, duration: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, duration, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Keeps one folder in IDLE on its own thread.
pub struct FolderPusher {
    idler: FolderIdler,
    callback: Arc<dyn PushCallback>,
    backoff: Backoff,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl FolderPusher {
    pub fn new(idler: FolderIdler, callback: Arc<dyn PushCallback>) -> Self {
        Self {
            idler,
            callback,
            backoff: Backoff::default(),
            signal: Arc::new(StopSignal::default()),
            handle: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn folder_server_id(&self) -> &str {
        self.idler.folder_server_id()
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let idler = self.idler.clone();
        let callback = Arc::clone(&self.callback);
        let signal = Arc::clone(&self.signal);
        let mut backoff = self.backoff.clone();

        self.handle = Some(thread::spawn(move || {
            let folder = idler.folder_server_id().to_string();
            log::debug!("Push thread for {} started", folder);

            while !signal.is_stopped() {
                match idler.idle() {
                    Ok(IdleResult::Sync) => {
                        backoff.reset();
                        if !signal.is_stopped() {
                            callback.on_push_event(&folder);
                        }
                    }
                    Ok(IdleResult::Stopped) => break,
                    Ok(IdleResult::NotSupported) => {
                        callback.on_push_not_supported(&folder);
                        break;
                    }
                    Err(e) => {
                        if signal.is_stopped() {
                            break;
                        }
                        callback.on_push_error(&folder, &e);
                        let delay = backoff.next_delay();
                        log::info!("Retrying IDLE on {} in {:?}", folder, delay);
                        if signal.wait(delay) {
                            break;
                        }
                    }
                }
            }

            log::debug!("Push thread for {} stopped", folder);
        }));
    }

    /// Ends the current IDLE round so a fresh one starts.
    pub fn refresh(&self) {
        self.idler.refresh();
    }

    pub fn stop(&mut self) {
        self.signal.stop();
        self.idler.stop();

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                log::error!("Error joining push thread for {}: {:?}", self.folder_server_id(), e);
            }
        }
    }
}

impl Drop for FolderPusher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Manages the folder pushers of one account.
pub struct AccountPusher {
    idle_store: Arc<dyn IdleStore>,
    refresh_manager: Arc<dyn IdleRefreshManager>,
    wake_lock: Arc<dyn WakeLock>,
    callback: Arc<dyn PushCallback>,
    idle_refresh_timeout: Duration,
    pushers: HashMap<String, FolderPusher>,
}

impl AccountPusher {
    pub fn new(
        idle_store: Arc<dyn IdleStore>,
        refresh_manager: Arc<dyn IdleRefreshManager>,
        wake_lock: Arc<dyn WakeLock>,
        callback: Arc<dyn PushCallback>,
        idle_refresh_timeout: Duration,
    ) -> Self {
        Self {
            idle_store,
            refresh_manager,
            wake_lock,
            callback,
            idle_refresh_timeout,
            pushers: HashMap::new(),
        }
    }

    pub fn start(&mut self, folder_server_ids: &[String]) {
        self.update_folders(folder_server_ids);
    }

    /// Start pushers for new folders and stop the ones no longer listed.
    pub fn update_folders(&mut self, folder_server_ids: &[String]) {
        let removed: Vec<String> = self
            .pushers
            .keys()
            .filter(|id| !folder_server_ids.contains(id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(mut pusher) = self.pushers.remove(&id) {
                log::info!("Stopping push for {}", id);
                pusher.stop();
            }
        }

        for id in folder_server_ids {
            if self.pushers.contains_key(id) {
                continue;
            }
            log::info!("Starting push for {}", id);
            let idler = FolderIdler::new(
                id,
                Arc::clone(&self.idle_store),
                Arc::clone(&self.refresh_manager),
                Arc::clone(&self.wake_lock),
                self.idle_refresh_timeout,
            );
            let mut pusher = FolderPusher::new(idler, Arc::clone(&self.callback));
            pusher.start();
            self.pushers.insert(id.clone(), pusher);
        }
    }

    pub fn folders(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pushers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ask every folder to start a fresh IDLE round.
    pub fn reconnect(&self) {
        for pusher in self.pushers.values() {
            pusher.refresh();
        }
    }

    pub fn stop(&mut self) {
        for (_, mut pusher) in self.pushers.drain() {
            pusher.stop();
        }
    }
}

impl Drop for AccountPusher {
    fn drop(&mut self) {
        self.stop();
    }
}
