#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset};

use mailsync::error::MailError;
use mailsync::listener::{ChannelListener, SyncEvent};
use mailsync::message::{Flag, RemoteMessageSummary};
use mailsync::remote::{
    FetchMode, IdleConnection, IdleStore, ImapResponse, OpenMode, RemoteFolder, RemoteStore,
};
use mailsync::timer::{IdleRefreshManager, IdleRefreshTimer};

pub const DEFAULT_DATE: &str = "Tue, 04 Jan 2022 10:00:00 +0100";

pub fn date(rfc2822: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc2822(rfc2822).unwrap()
}

pub fn raw_message(uid: u32, rfc2822_date: &str) -> Vec<u8> {
    format!(
        "From: alice@domain.example\r\n\
         To: bob@domain.example\r\n\
         Subject: Test Message\r\n\
         Date: {}\r\n\
         Message-ID: <{}@domain.example>\r\n\
         \r\n\
         Body of message {}\r\n",
        rfc2822_date, uid, uid
    )
    .into_bytes()
}

pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn drain(rx: &Receiver<SyncEvent>) -> Vec<SyncEvent> {
    rx.try_iter().collect()
}

pub fn channel() -> (ChannelListener, Receiver<SyncEvent>) {
    ChannelListener::channel()
}

#[derive(Clone)]
pub struct RemoteMessage {
    pub flags: HashSet<Flag>,
    pub date: DateTime<FixedOffset>,
    pub size: u32,
    pub raw: Vec<u8>,
}

#[derive(Default)]
pub struct RemoteState {
    pub messages: BTreeMap<u32, RemoteMessage>,
    pub count_override: Option<i64>,
    pub uid_validity: Option<u64>,
    pub opened: Vec<OpenMode>,
    pub listed: Vec<(u32, u32, Option<DateTime<FixedOffset>>)>,
    pub fetched: Vec<(u32, FetchMode)>,
    pub expunged: usize,
    pub closed: usize,
    pub fail_open: bool,
}

/// An in-memory server folder. Sequence numbers follow UID order.
#[derive(Clone, Default)]
pub struct FakeRemoteStore {
    pub state: Arc<Mutex<RemoteState>>,
}

impl FakeRemoteStore {
    pub fn new() -> Self {
        let store = Self::default();
        store.state().uid_validity = Some(1);
        store
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    pub fn add_message(&self, uid: u32) {
        self.add_message_dated(uid, DEFAULT_DATE);
    }

    pub fn add_message_dated(&self, uid: u32, rfc2822_date: &str) {
        let raw = raw_message(uid, rfc2822_date);
        self.state().messages.insert(
            uid,
            RemoteMessage {
                flags: HashSet::new(),
                date: date(rfc2822_date),
                size: raw.len() as u32,
                raw,
            },
        );
    }

    pub fn set_flags(&self, uid: u32, flags: &[Flag]) {
        if let Some(message) = self.state().messages.get_mut(&uid) {
            message.flags = flags.iter().cloned().collect();
        }
    }

    pub fn set_size(&self, uid: u32, size: u32) {
        if let Some(message) = self.state().messages.get_mut(&uid) {
            message.size = size;
        }
    }
}

impl RemoteStore for FakeRemoteStore {
    fn folder(&self, server_id: &str) -> Result<Box<dyn RemoteFolder>, MailError> {
        Ok(Box::new(FakeRemoteFolder {
            server_id: server_id.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeRemoteFolder {
    server_id: String,
    state: Arc<Mutex<RemoteState>>,
}

impl RemoteFolder for FakeRemoteFolder {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn open(&mut self, mode: OpenMode) -> Result<(), MailError> {
        let mut state = self.state.lock().unwrap();
        state.opened.push(mode);
        if state.fail_open {
            return Err(MailError::Imap("SELECT failed: no such mailbox".to_string()));
        }
        Ok(())
    }

    fn message_count(&self) -> Result<i64, MailError> {
        let state = self.state.lock().unwrap();
        Ok(state.count_override.unwrap_or(state.messages.len() as i64))
    }

    fn uid_validity(&self) -> Option<u64> {
        self.state.lock().unwrap().uid_validity
    }

    fn list_messages(
        &mut self,
        start: u32,
        end: u32,
        earliest_date: Option<DateTime<FixedOffset>>,
    ) -> Result<Vec<RemoteMessageSummary>, MailError> {
        let mut state = self.state.lock().unwrap();
        state.listed.push((start, end, earliest_date));

        let first = start.max(1) as usize - 1;
        let take = (end as usize + 1).saturating_sub(start.max(1) as usize);
        Ok(state
            .messages
            .iter()
            .skip(first)
            .take(take)
            // SINCE has day granularity on real servers.
            .filter(|(_, m)| match earliest_date {
                Some(cutoff) => m.date.date_naive() >= cutoff.date_naive(),
                None => true,
            })
            .map(|(uid, m)| RemoteMessageSummary {
                uid: *uid,
                flags: m.flags.clone(),
                date: Some(m.date),
                size: Some(m.size),
            })
            .collect())
    }

    fn fetch_message(&mut self, uid: u32, mode: FetchMode) -> Result<Vec<u8>, MailError> {
        let mut state = self.state.lock().unwrap();
        state.fetched.push((uid, mode));
        let raw = state
            .messages
            .get(&uid)
            .map(|m| m.raw.clone())
            .ok_or_else(|| MailError::Imap(format!("no message with UID {}", uid)))?;
        match mode {
            FetchMode::Full => Ok(raw),
            FetchMode::Header => {
                let text = String::from_utf8_lossy(&raw).to_string();
                let header = text.split("\r\n\r\n").next().unwrap_or_default();
                Ok(format!("{}\r\n\r\n", header).into_bytes())
            }
        }
    }

    fn expunge(&mut self) -> Result<(), MailError> {
        let mut state = self.state.lock().unwrap();
        state.expunged += 1;
        state.messages.retain(|_, m| !m.flags.contains(&Flag::Deleted));
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed += 1;
    }
}

/// What the fake server answers after it receives IDLE.
#[derive(Clone, Debug)]
pub enum Reply {
    Continue,
    Untagged(Vec<String>),
    /// Tagged completion of the IDLE command with the given items.
    Complete(Vec<String>),
}

impl Reply {
    pub fn untagged(items: &[&str]) -> Self {
        Reply::Untagged(items.iter().map(|s| s.to_string()).collect())
    }

    pub fn complete(items: &[&str]) -> Self {
        Reply::Complete(items.iter().map(|s| s.to_string()).collect())
    }
}

/// A scripted server connection.
///
/// Every IDLE pops the next script entry, or answers with a plain
/// continuation when the script is empty. DONE is answered with a tagged OK.
pub struct FakeIdleConnection {
    pub idle_capable: AtomicBool,
    scripts: Mutex<VecDeque<Vec<Reply>>>,
    tx: Mutex<Sender<ImapResponse>>,
    rx: Mutex<Receiver<ImapResponse>>,
    sent: Mutex<Vec<String>>,
    read_timeouts: Mutex<Vec<Duration>>,
    last_tag: Mutex<Option<String>>,
    next_tag: AtomicU32,
    reads: AtomicUsize,
    connected: AtomicBool,
    closed: AtomicUsize,
    fail_done: AtomicBool,
}

impl FakeIdleConnection {
    pub fn new(idle_capable: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::channel();
        Arc::new(Self {
            idle_capable: AtomicBool::new(idle_capable),
            scripts: Mutex::new(VecDeque::new()),
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            read_timeouts: Mutex::new(Vec::new()),
            last_tag: Mutex::new(None),
            next_tag: AtomicU32::new(1),
            reads: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicUsize::new(0),
            fail_done: AtomicBool::new(false),
        })
    }

    pub fn script(&self, replies: Vec<Reply>) {
        self.scripts.lock().unwrap().push_back(replies);
    }

    /// Deliver an untagged response as if the server pushed it.
    pub fn push_untagged(&self, items: &[&str]) {
        self.deliver(&format!("* {}", items.join(" ")));
    }

    pub fn fail_done(&self) {
        self.fail_done.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_sent(&self, line: &str) -> usize {
        self.sent.lock().unwrap().iter().filter(|s| s.as_str() == line).count()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn read_timeouts(&self) -> Vec<Duration> {
        self.read_timeouts.lock().unwrap().clone()
    }

    /// Parse `line` the way the real transport would and queue it.
    fn deliver(&self, line: &str) {
        let response = ImapResponse::parse(format!("{}\r\n", line).as_bytes()).unwrap();
        let _ = self.tx.lock().unwrap().send(response);
    }

    fn current_tag(&self) -> String {
        self.last_tag.lock().unwrap().clone().unwrap_or_default()
    }
}

impl IdleConnection for FakeIdleConnection {
    fn open(&self, _mode: OpenMode) -> Result<(), MailError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_idle_capable(&self) -> Result<bool, MailError> {
        Ok(self.idle_capable.load(Ordering::SeqCst))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_command(&self, command: &str) -> Result<String, MailError> {
        let tag = format!("A{}", self.next_tag.fetch_add(1, Ordering::SeqCst));
        self.sent.lock().unwrap().push(command.to_string());
        *self.last_tag.lock().unwrap() = Some(tag.clone());

        if command == "IDLE" {
            let replies = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![Reply::Continue]);
            for reply in replies {
                let line = match reply {
                    Reply::Continue => "+ idling".to_string(),
                    Reply::Untagged(items) => format!("* {}", items.join(" ")),
                    Reply::Complete(items) => format!("{} {}", tag, items.join(" ")),
                };
                self.deliver(&line);
            }
        }
        Ok(tag)
    }

    fn send_continuation(&self, text: &str) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(text.to_string());
        if self.fail_done.load(Ordering::SeqCst) {
            return Err(MailError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection reset",
            )));
        }
        if text == "DONE" {
            let tag = self.current_tag();
            self.deliver(&format!("{} OK IDLE terminated", tag));
        }
        Ok(())
    }

    fn read_response(&self) -> Result<ImapResponse, MailError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.rx
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| {
                MailError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"))
            })
    }

    fn set_socket_read_timeout(&self, timeout: Duration) -> Result<(), MailError> {
        self.read_timeouts.lock().unwrap().push(timeout);
        Ok(())
    }

    fn set_socket_default_read_timeout(&self) -> Result<(), MailError> {
        Ok(())
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out the same scripted connection for every folder.
pub struct FakeIdleStore {
    pub connection: Arc<FakeIdleConnection>,
}

impl IdleStore for FakeIdleStore {
    fn idle_connection(&self, _folder_server_id: &str) -> Result<Arc<dyn IdleConnection>, MailError> {
        Ok(self.connection.clone())
    }
}

struct ArmedTimer {
    timeout: Duration,
    callback: Option<Box<dyn FnOnce() + Send>>,
    cancelled: Arc<AtomicBool>,
}

/// Timers that only fire when the test says so.
#[derive(Default)]
pub struct ManualRefreshManager {
    timers: Mutex<Vec<ArmedTimer>>,
}

impl ManualRefreshManager {
    pub fn started(&self) -> usize {
        self.timers.lock().unwrap().len()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.timers.lock().unwrap().iter().map(|t| t.timeout).collect()
    }

    pub fn all_cancelled(&self) -> bool {
        self.timers
            .lock()
            .unwrap()
            .iter()
            .all(|t| t.callback.is_none() || t.cancelled.load(Ordering::SeqCst))
    }

    /// Fire the most recently armed timer unless it was cancelled.
    pub fn fire_latest(&self) -> bool {
        let callback = {
            let mut timers = self.timers.lock().unwrap();
            match timers.last_mut() {
                Some(timer) if !timer.cancelled.load(Ordering::SeqCst) => timer.callback.take(),
                _ => None,
            }
        };
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

struct ManualTimer {
    cancelled: Arc<AtomicBool>,
}

impl IdleRefreshTimer for ManualTimer {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl IdleRefreshManager for ManualRefreshManager {
    fn start_timer(
        &self,
        timeout: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Box<dyn IdleRefreshTimer> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.timers.lock().unwrap().push(ArmedTimer {
            timeout,
            callback: Some(callback),
            cancelled: Arc::clone(&cancelled),
        });
        Box::new(ManualTimer { cancelled })
    }
}

/// Counts wake lock calls.
#[derive(Default)]
pub struct CountingWakeLock {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl mailsync::wakelock::WakeLock for CountingWakeLock {
    fn acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
