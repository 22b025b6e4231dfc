//! Line level IMAP transport for IDLE sessions.
//!
//! The `imap` crate's session owns its stream, so a second thread could not
//! send DONE while another is blocked reading. This transport keeps the stream
//! behind a mutex and reads in short poll slices, releasing the mutex between
//! slices. A writer waiting for the stream holds readers back, and an overall
//! deadline bounds how long a read may take. Responses are framed and parsed
//! by `imap-proto`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, LockResult, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use native_tls::{HandshakeError, TlsConnector, TlsStream};

use crate::config::{ImapSecurity, ServerSettings};
use crate::error::MailError;
use crate::remote::{
    parse_next, Framed, IdleConnection, IdleStore, ImapResponse, OpenMode, ResponseKind, ResponseStatus,
};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
const HANDSHAKE_TIMEOUT: Duration = DEFAULT_READ_TIMEOUT;
const POLL_SLICE: Duration = Duration::from_millis(250);

enum ImapStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ImapStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            ImapStream::Plain(s) => s,
            ImapStream::Tls(s) => s.get_ref(),
        }
    }
}

impl Read for ImapStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ImapStream::Plain(s) => s.read(buf),
            ImapStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for ImapStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ImapStream::Plain(s) => s.write(buf),
            ImapStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ImapStream::Plain(s) => s.flush(),
            ImapStream::Tls(s) => s.flush(),
        }
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn recover<'a, T>(result: LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// Counts writers waiting for the stream. Readers do not start a new poll
/// slice while the count is non-zero.
#[derive(Default)]
struct WriterGate {
    waiting: Mutex<usize>,
    clear: Condvar,
}

struct WriterTicket<'a> {
    gate: &'a WriterGate,
}

impl WriterGate {
    fn enter(&self) -> WriterTicket<'_> {
        *recover(self.waiting.lock()) += 1;
        WriterTicket { gate: self }
    }

    fn wait_clear(&self) {
        let waiting = recover(self.waiting.lock());
        let _clear = recover(self.clear.wait_while(waiting, |n| *n > 0));
    }
}

impl Drop for WriterTicket<'_> {
    fn drop(&mut self) {
        let mut waiting = recover(self.gate.waiting.lock());
        *waiting -= 1;
        if *waiting == 0 {
            self.gate.clear.notify_all();
        }
    }
}

/// One connection to one folder, used only for IDLE.
pub struct ImapConnection {
    settings: ServerSettings,
    folder: String,
    stream: Mutex<Option<ImapStream>>,
    pending: Mutex<Vec<u8>>,
    writers: WriterGate,
    next_tag: AtomicU32,
    read_timeout: Mutex<Duration>,
    capabilities: Mutex<Vec<String>>,
}

impl ImapConnection {
    pub fn new(settings: ServerSettings, folder: &str) -> Self {
        Self {
            settings,
            folder: folder.to_string(),
            stream: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            writers: WriterGate::default(),
            next_tag: AtomicU32::new(1),
            read_timeout: Mutex::new(DEFAULT_READ_TIMEOUT),
            capabilities: Mutex::new(Vec::new()),
        }
    }

    fn connect(&self) -> Result<(), MailError> {
        let host = self.settings.host.as_str();
        log::debug!("Connecting to {}:{} for IDLE on {}", host, self.settings.port, self.folder);

        let tcp = TcpStream::connect((host, self.settings.port))?;

        let stream = match self.settings.security {
            ImapSecurity::SSL => ImapStream::Tls(Box::new(Self::tls_handshake(host, tcp)?)),
            ImapSecurity::StartTLS | ImapSecurity::None => ImapStream::Plain(tcp),
        };
        recover(self.pending.lock()).clear();
        *recover(self.stream.lock()) = Some(stream);

        let greeting = self.read_response()?;
        let preauthenticated = match greeting.kind {
            ResponseKind::Status(ResponseStatus::Ok) => false,
            ResponseKind::Status(ResponseStatus::PreAuth) => true,
            _ => return Err(MailError::Imap(format!("Unexpected greeting: {}", greeting))),
        };

        if self.settings.security == ImapSecurity::StartTLS {
            self.run_command("STARTTLS")?;
            let mut guard = recover(self.stream.lock());
            let tcp = match guard.take() {
                Some(ImapStream::Plain(tcp)) => tcp,
                _ => return Err(MailError::InvalidState("STARTTLS on a non-plain stream".to_string())),
            };
            *guard = Some(ImapStream::Tls(Box::new(Self::tls_handshake(host, tcp)?)));
        }

        if !preauthenticated {
            let login = format!(
                "LOGIN {} {}",
                quote(&self.settings.username),
                quote(&self.settings.password)
            );
            self.run_command(&login)?;
        }
        self.run_command("CAPABILITY")?;
        Ok(())
    }

    /// The socket may still carry a poll slice timeout, which surfaces as
    /// `WouldBlock` mid-handshake. Such a handshake is resumed until
    /// `HANDSHAKE_TIMEOUT` has passed.
    fn tls_handshake(host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>, MailError> {
        tcp.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let connector = TlsConnector::new()?;

        let mut attempt = connector.connect(host, tcp);
        loop {
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(HandshakeError::Failure(e)) => {
                    return Err(MailError::Imap(format!("TLS handshake with {} failed: {}", host, e)));
                }
                Err(HandshakeError::WouldBlock(mid)) => {
                    if Instant::now() >= deadline {
                        return Err(MailError::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("TLS handshake with {} timed out", host),
                        )));
                    }
                    attempt = mid.handshake();
                }
            }
        }
    }

    /// Send a command and read until its completion. Untagged responses are
    /// returned; a completion other than OK is an error.
    fn run_command(&self, command: &str) -> Result<Vec<ImapResponse>, MailError> {
        let tag = self.send_command(command)?;
        let mut untagged = Vec::new();
        loop {
            let response = self.read_response()?;
            if response.is_tagged_with(&tag) {
                if !response.is_ok() {
                    let verb = command.split_whitespace().next().unwrap_or(command);
                    return Err(MailError::Imap(format!("{} failed: {}", verb, response)));
                }
                return Ok(untagged);
            }
            if let Some(caps) = response.capabilities() {
                *recover(self.capabilities.lock()) = caps.to_vec();
            }
            untagged.push(response);
        }
    }

    fn write_line(&self, line: &str) -> Result<(), MailError> {
        let _ticket = self.writers.enter();
        let mut guard = recover(self.stream.lock());
        let stream = guard
            .as_mut()
            .ok_or_else(|| MailError::Io(io::Error::new(io::ErrorKind::NotConnected, "not connected")))?;
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
        Ok(())
    }

    fn read_slice(&self, buf: &mut [u8]) -> Result<usize, MailError> {
        let mut guard = recover(self.stream.lock());
        let stream = guard
            .as_mut()
            .ok_or_else(|| MailError::Io(io::Error::new(io::ErrorKind::NotConnected, "connection closed")))?;
        stream.tcp().set_read_timeout(Some(POLL_SLICE))?;
        match stream.read(buf) {
            Ok(0) => Err(MailError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ))),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl IdleConnection for ImapConnection {
    fn open(&self, mode: OpenMode) -> Result<(), MailError> {
        if !self.is_connected() {
            self.connect()?;
        }
        let verb = match mode {
            OpenMode::ReadOnly => "EXAMINE",
            OpenMode::ReadWrite => "SELECT",
        };
        self.run_command(&format!("{} {}", verb, quote(&self.folder)))?;
        log::debug!("Opened {} ({:?}) for IDLE", self.folder, mode);
        Ok(())
    }

    fn is_idle_capable(&self) -> Result<bool, MailError> {
        if recover(self.capabilities.lock()).is_empty() {
            self.run_command("CAPABILITY")?;
        }
        Ok(recover(self.capabilities.lock())
            .iter()
            .any(|cap| cap.eq_ignore_ascii_case("IDLE")))
    }

    fn is_connected(&self) -> bool {
        recover(self.stream.lock()).is_some()
    }

    fn send_command(&self, command: &str) -> Result<String, MailError> {
        let tag = format!("M{}", self.next_tag.fetch_add(1, Ordering::SeqCst));
        if command.starts_with("LOGIN") {
            log::trace!("{} >>> LOGIN ***", tag);
        } else {
            log::trace!("{} >>> {}", tag, command);
        }
        self.write_line(&format!("{} {}", tag, command))?;
        Ok(tag)
    }

    fn send_continuation(&self, text: &str) -> Result<(), MailError> {
        log::trace!(">>> {}", text);
        self.write_line(text)
    }

    fn read_response(&self) -> Result<ImapResponse, MailError> {
        let deadline = Instant::now() + *recover(self.read_timeout.lock());
        let mut buf = [0u8; 4096];

        loop {
            {
                let mut pending = recover(self.pending.lock());
                loop {
                    match parse_next(&pending) {
                        Framed::Response(response, len) => {
                            log::trace!("<<< {}", String::from_utf8_lossy(&pending[..len]).trim_end());
                            pending.drain(..len);
                            return Ok(response);
                        }
                        Framed::Unparsed(len) => {
                            log::debug!(
                                "Skipping unparseable response on {}: {}",
                                self.folder,
                                String::from_utf8_lossy(&pending[..len]).trim_end()
                            );
                            pending.drain(..len);
                        }
                        Framed::Incomplete => break,
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(MailError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for server response",
                )));
            }

            self.writers.wait_clear();

            let n = self.read_slice(&mut buf)?;
            if n > 0 {
                recover(self.pending.lock()).extend_from_slice(&buf[..n]);
            }
        }
    }

    fn set_socket_read_timeout(&self, timeout: Duration) -> Result<(), MailError> {
        *recover(self.read_timeout.lock()) = timeout;
        Ok(())
    }

    fn set_socket_default_read_timeout(&self) -> Result<(), MailError> {
        self.set_socket_read_timeout(DEFAULT_READ_TIMEOUT)
    }

    fn close(&self) {
        let stream = recover(self.stream.lock()).take();
        if let Some(mut stream) = stream {
            let tag = format!("M{}", self.next_tag.fetch_add(1, Ordering::SeqCst));
            if let Err(e) = stream.write_all(format!("{} LOGOUT\r\n", tag).as_bytes()) {
                log::debug!("LOGOUT for {} failed: {}", self.folder, e);
            }
            if let Err(e) = stream.tcp().shutdown(Shutdown::Both) {
                log::trace!("Shutdown for {} failed: {}", self.folder, e);
            }
        }
        recover(self.pending.lock()).clear();
        recover(self.capabilities.lock()).clear();
    }
}

/// Opens a fresh [`ImapConnection`] per folder.
pub struct ImapIdleStore {
    settings: ServerSettings,
}

impl ImapIdleStore {
    pub fn new(settings: ServerSettings) -> Self {
        Self { settings }
    }
}

impl IdleStore for ImapIdleStore {
    fn idle_connection(&self, folder_server_id: &str) -> Result<Arc<dyn IdleConnection>, MailError> {
        Ok(Arc::new(ImapConnection::new(self.settings.clone(), folder_server_id)))
    }
}
