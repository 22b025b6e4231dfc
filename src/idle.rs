use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::error::MailError;
use crate::remote::{IdleConnection, IdleStore, ImapResponse, OpenMode};
use crate::timer::{IdleRefreshManager, IdleRefreshTimer};
use crate::wakelock::{WakeLock, WakeLockRelease};

/// Added to the refresh interval to get the socket read timeout while idling.
pub const SOCKET_EXTRA_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Outcome of one `idle()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleResult {
    /// The server reported a change; run a sync pass and idle again.
    Sync,
    Stopped,
    /// The server does not support IDLE; fall back to polling.
    NotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePhase {
    NotStarted,
    CapabilityCheck,
    SendingIdle,
    AwaitingContinuation,
    InIdle,
    SendingDone,
    Stopped,
    NotSupported,
}

impl IdlePhase {
    pub fn can_transition_to(self, next: IdlePhase) -> bool {
        use IdlePhase::*;

        match (self, next) {
            (NotStarted | Stopped, CapabilityCheck) => true,
            (CapabilityCheck, SendingIdle | NotSupported) => true,
            (SendingIdle, AwaitingContinuation) => true,
            (AwaitingContinuation, InIdle | SendingDone | NotSupported) => true,
            (InIdle, SendingDone) => true,
            // The server may end IDLE on its own, so a round can end without DONE.
            (InIdle | SendingDone, SendingIdle) => true,
            (NotSupported | Stopped, _) => false,
            (_, Stopped) => true,
            _ => false,
        }
    }

    /// DONE may be sent once IDLE went out and until DONE went out.
    fn accepts_done(self) -> bool {
        matches!(self, IdlePhase::AwaitingContinuation | IdlePhase::InIdle)
    }
}

impl fmt::Display for IdlePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct IdlerState {
    phase: IdlePhase,
    stop_requested: bool,
    result: IdleResult,
    timer: Option<Box<dyn IdleRefreshTimer>>,
    connection: Option<Arc<dyn IdleConnection>>,
}

impl IdlerState {
    fn transition(&mut self, next: IdlePhase) -> Result<(), MailError> {
        if !self.phase.can_transition_to(next) {
            return Err(MailError::InvalidState(format!(
                "illegal IDLE transition {} -> {}",
                self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }
}

struct Inner {
    folder_server_id: String,
    log_tag: String,
    idle_store: Arc<dyn IdleStore>,
    refresh_manager: Arc<dyn IdleRefreshManager>,
    wake_lock: Arc<dyn WakeLock>,
    refresh_timeout: Duration,
    state: Mutex<IdlerState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, IdlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// End the current round by sending DONE, at most once per round.
    ///
    /// Failing to send is not fatal here: the idling thread's next read sees
    /// the broken connection.
    fn send_done(&self, state: &mut IdlerState, reason: &str) {
        if !state.phase.accepts_done() {
            log::trace!("{}: not sending DONE ({}), phase is {}", self.log_tag, reason, state.phase);
            return;
        }
        let Some(connection) = state.connection.clone() else {
            return;
        };
        if !connection.is_connected() {
            log::debug!("{}: connection gone, DONE not sent ({})", self.log_tag, reason);
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        if let Err(e) = state.transition(IdlePhase::SendingDone) {
            log::warn!("{}: {}", self.log_tag, e);
            return;
        }

        log::debug!("{}: sending DONE ({})", self.log_tag, reason);
        if let Err(e) = connection.set_socket_default_read_timeout() {
            log::debug!("{}: failed to restore read timeout: {}", self.log_tag, e);
        }
        if let Err(e) = connection.send_continuation("DONE") {
            log::debug!("{}: I/O error while sending DONE: {}", self.log_tag, e);
        }
    }

    fn end_round(&self, reason: &str) {
        let mut state = self.lock();
        self.send_done(&mut state, reason);
    }
}

/// Keeps one folder in IMAP IDLE and reports when a sync pass is due.
///
/// `idle()` blocks its thread. `stop()` and `refresh()` may be called from any
/// other thread while it is blocked.
#[derive(Clone)]
pub struct FolderIdler {
    inner: Arc<Inner>,
}

impl FolderIdler {
    pub fn new(
        folder_server_id: &str,
        idle_store: Arc<dyn IdleStore>,
        refresh_manager: Arc<dyn IdleRefreshManager>,
        wake_lock: Arc<dyn WakeLock>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                folder_server_id: folder_server_id.to_string(),
                log_tag: format!("ImapFolderIdler[{}]", folder_server_id),
                idle_store,
                refresh_manager,
                wake_lock,
                refresh_timeout,
                state: Mutex::new(IdlerState {
                    phase: IdlePhase::NotStarted,
                    stop_requested: false,
                    result: IdleResult::Stopped,
                    timer: None,
                    connection: None,
                }),
            }),
        }
    }

    pub fn folder_server_id(&self) -> &str {
        &self.inner.folder_server_id
    }

    pub fn phase(&self) -> IdlePhase {
        self.inner.lock().phase
    }

    /// Run IDLE rounds until a change is seen or `stop()` is called.
    ///
    /// `NotSupported` is final: the idler stays in that phase and every later
    /// call fails with `InvalidState`.
    pub fn idle(&self) -> Result<IdleResult, MailError> {
        log::trace!("{}.idle()", self.inner.log_tag);
        {
            let mut state = self.inner.lock();
            state.transition(IdlePhase::CapabilityCheck)?;
            state.result = IdleResult::Stopped;
        }

        let result = self.run();
        self.finish(&result);

        match &result {
            Ok(r) => log::debug!("{}.idle(): result={:?}", self.inner.log_tag, r),
            Err(e) => log::warn!("{}.idle() failed: {}", self.inner.log_tag, e),
        }
        result
    }

    /// Stop idling. `idle()` returns after the current round, or right
    /// after opening the folder if it was not running yet.
    pub fn stop(&self) {
        log::trace!("{}.stop()", self.inner.log_tag);
        let mut state = self.inner.lock();
        state.stop_requested = true;
        self.inner.send_done(&mut state, "stop");
    }

    /// End the current IDLE round and start a new one.
    pub fn refresh(&self) {
        log::trace!("{}.refresh()", self.inner.log_tag);
        self.inner.end_round("refresh");
    }

    fn run(&self) -> Result<IdleResult, MailError> {
        let connection = self.inner.idle_store.idle_connection(&self.inner.folder_server_id)?;
        self.inner.lock().connection = Some(Arc::clone(&connection));

        connection.open(OpenMode::ReadOnly)?;

        if !connection.is_idle_capable()? {
            log::warn!("{}: IDLE not supported by server", self.inner.log_tag);
            self.inner.lock().transition(IdlePhase::NotSupported)?;
            return Ok(IdleResult::NotSupported);
        }

        loop {
            let Some(tag) = self.start_round(&connection)? else {
                break;
            };
            if let Some(result) = self.run_round(&connection, &tag)? {
                return Ok(result);
            }
            if self.inner.lock().stop_requested {
                break;
            }
        }

        Ok(self.inner.lock().result)
    }

    /// Send IDLE unless a stop is pending. The lock is held across the send so
    /// `stop()` either sees the round before IDLE went out or after.
    fn start_round(&self, connection: &Arc<dyn IdleConnection>) -> Result<Option<String>, MailError> {
        let mut state = self.inner.lock();
        if state.stop_requested {
            return Ok(None);
        }
        state.transition(IdlePhase::SendingIdle)?;
        let tag = connection.send_command("IDLE")?;
        state.transition(IdlePhase::AwaitingContinuation)?;
        Ok(Some(tag))
    }

    /// Read responses until the IDLE command completes.
    ///
    /// Returns `Some` when `idle()` should return right away.
    fn run_round(
        &self,
        connection: &Arc<dyn IdleConnection>,
        tag: &str,
    ) -> Result<Option<IdleResult>, MailError> {
        let mut granted = false;

        loop {
            let response = self.read_next(connection, granted)?;
            let mut state = self.inner.lock();

            if response.is_continuation() {
                granted = true;
                if state.phase == IdlePhase::AwaitingContinuation {
                    state.transition(IdlePhase::InIdle)?;
                    connection.set_socket_read_timeout(self.inner.refresh_timeout + SOCKET_EXTRA_TIMEOUT)?;
                }
                continue;
            }

            if response.is_tagged_with(tag) {
                if state.phase == IdlePhase::AwaitingContinuation {
                    log::warn!(
                        "{}: IDLE command completed without a continuation request",
                        self.inner.log_tag
                    );
                    state.transition(IdlePhase::NotSupported)?;
                    return Ok(Some(IdleResult::NotSupported));
                }
                if !response.is_ok() {
                    return Err(MailError::Protocol(format!(
                        "Received non-OK response to IDLE command: {}",
                        response
                    )));
                }
                return Ok(None);
            }

            if response.is_relevant() && !state.stop_requested {
                state.stop_requested = true;
                state.result = IdleResult::Sync;
                if !granted {
                    log::debug!(
                        "{}: relevant untagged response right after sending IDLE",
                        self.inner.log_tag
                    );
                    self.inner.send_done(&mut state, "relevant response");
                    return Ok(Some(IdleResult::Sync));
                }
                log::debug!("{}: relevant untagged response during IDLE", self.inner.log_tag);
                self.inner.send_done(&mut state, "relevant response");
            } else {
                log::trace!("{}: ignoring response {}", self.inner.log_tag, response);
            }
        }
    }

    /// One blocking read. While idling, the refresh timer is armed and the
    /// wake lock is released for exactly the duration of the read.
    fn read_next(&self, connection: &Arc<dyn IdleConnection>, granted: bool) -> Result<ImapResponse, MailError> {
        if !granted {
            return connection.read_response();
        }

        // Armed outside the lock: a timer may fire before start_timer returns.
        if self.phase() == IdlePhase::InIdle {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let timer = self.inner.refresh_manager.start_timer(
                self.inner.refresh_timeout,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.end_round("refresh timer");
                    }
                }),
            );
            self.inner.lock().timer = Some(timer);
        }

        let response = {
            let _released = WakeLockRelease::new(self.inner.wake_lock.as_ref());
            connection.read_response()
        };

        if let Some(timer) = self.inner.lock().timer.take() {
            timer.cancel();
        }
        response
    }

    fn finish(&self, result: &Result<IdleResult, MailError>) {
        let connection = {
            let mut state = self.inner.lock();
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            // A stop() issued while no idle() runs applies to the next call.
            state.stop_requested = false;
            if !matches!(result, Ok(IdleResult::NotSupported)) {
                if let Err(e) = state.transition(IdlePhase::Stopped) {
                    log::debug!("{}: {}", self.inner.log_tag, e);
                }
            }
            state.connection.take()
        };

        if let Some(connection) = connection {
            connection.close();
        }
    }
}
