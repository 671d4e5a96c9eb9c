use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::wire::codec::{CodecError, Command, Frame, ReplyParser};
use crate::wire::handshake::{Greeting, HandshakeError};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);
pub const END_COMMAND: &[u8] = b"END\r\n";
const READ_BUFFER_BYTES: usize = 16 * 1024;
const LOG_CONTEXT: &str = "wire::connection";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Notifications delivered to observers registered with [`WireConnection::subscribe`].
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    Greeting(Greeting),
    Timeout,
    Error(String),
    Closed,
}

/// A decoded non-error reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Bulk(Option<String>),
}

impl Reply {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Status(text) => Some(text),
            Self::Bulk(body) => body.as_deref(),
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Status(text) => Some(text),
            Self::Bulk(body) => body,
        }
    }
}

#[derive(Debug)]
pub enum WireError {
    Connect {
        address: String,
        source: io::Error,
    },
    Io(io::Error),
    Codec(CodecError),
    Encode(serde_json::Error),
    Handshake(HandshakeError),
    Server {
        message: String,
    },
    Assertion {
        expected: String,
        actual: Option<String>,
    },
    State {
        operation: &'static str,
        state: ConnectionState,
    },
    Closed {
        reason: String,
    },
    Timeout {
        verb: String,
        waited: Duration,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { address, source } => {
                write!(f, "failed to connect to {address}: {source}")
            }
            Self::Io(source) => write!(f, "connection io error: {source}"),
            Self::Codec(source) => write!(f, "protocol error: {source}"),
            Self::Encode(source) => write!(f, "failed to encode command payload: {source}"),
            Self::Handshake(source) => write!(f, "protocol error: {source}"),
            Self::Server { message } => write!(f, "server error: {message}"),
            Self::Assertion { expected, actual } => write!(
                f,
                "expected {expected} response, but got {}",
                actual.as_deref().unwrap_or("<nil>")
            ),
            Self::State { operation, state } => {
                write!(f, "cannot {operation} while connection is {state}")
            }
            Self::Closed { reason } => write!(f, "connection closed: {reason}"),
            Self::Timeout { verb, waited } => {
                write!(f, "no reply to {verb} within {}ms", waited.as_millis())
            }
        }
    }
}

impl std::error::Error for WireError {}

impl From<CodecError> for WireError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

impl From<serde_json::Error> for WireError {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value)
    }
}

impl From<HandshakeError> for WireError {
    fn from(value: HandshakeError) -> Self {
        Self::Handshake(value)
    }
}

type ReplyResult = Result<Reply, WireError>;

/// Deferred result of [`WireConnection::send_deferred`].
pub struct PendingReply {
    verb: String,
    receiver: Receiver<ReplyResult>,
}

impl PendingReply {
    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn wait(self) -> ReplyResult {
        self.receiver.recv().unwrap_or_else(|_| {
            Err(WireError::Closed {
                reason: format!("reply for {} was dropped", self.verb),
            })
        })
    }

    pub fn wait_timeout(self, timeout: Duration) -> ReplyResult {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(WireError::Timeout {
                verb: self.verb,
                waited: timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(WireError::Closed {
                reason: format!("reply for {} was dropped", self.verb),
            }),
        }
    }
}

#[derive(Default)]
struct PendingQueue {
    slots: VecDeque<Sender<ReplyResult>>,
    closed_reason: Option<String>,
}

struct Shared {
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
    pending: Mutex<PendingQueue>,
    last_error: Mutex<Option<String>>,
    observers: Mutex<Vec<Sender<ConnectionEvent>>>,
    logger: Arc<Logger>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state lock poisoned")
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().expect("connection state lock poisoned") = next;
        self.state_changed.notify_all();
    }

    fn notify(&self, event: ConnectionEvent) {
        self.observers
            .lock()
            .expect("connection observers lock poisoned")
            .retain(|observer| observer.send(event.clone()).is_ok());
    }

    fn record_error(&self, message: String) {
        *self
            .last_error
            .lock()
            .expect("connection last error lock poisoned") = Some(message.clone());
        self.notify(ConnectionEvent::Error(message));
    }

    fn resolve(&self, frame: Frame) {
        let slot = self
            .pending
            .lock()
            .expect("connection pending lock poisoned")
            .slots
            .pop_front();
        let Some(slot) = slot else {
            self.logger
                .warn(Some(LOG_CONTEXT), "dropping reply with no pending request");
            return;
        };

        let result = match frame {
            Frame::Simple(text) => Ok(Reply::Status(text)),
            Frame::Bulk(body) => Ok(Reply::Bulk(body)),
            Frame::Error(message) => Err(WireError::Server { message }),
        };
        let _ = slot.send(result);
    }

    /// Moves the connection to `Closed` and rejects every pending request.
    fn finish(&self) {
        let reason = self
            .last_error
            .lock()
            .expect("connection last error lock poisoned")
            .clone()
            .unwrap_or_else(|| "connection closed".to_owned());

        let drained = {
            let mut pending = self.pending.lock().expect("connection pending lock poisoned");
            pending.closed_reason = Some(reason.clone());
            pending.slots.drain(..).collect::<Vec<_>>()
        };
        for slot in drained {
            let _ = slot.send(Err(WireError::Closed {
                reason: reason.clone(),
            }));
        }

        self.set_state(ConnectionState::Closed);
        self.notify(ConnectionEvent::Closed);
    }
}

/// One wire-protocol connection. Not meant for concurrent use by more than one
/// caller; the pool hands each borrower its own connection.
pub struct WireConnection {
    host: String,
    port: u16,
    idle_timeout: Mutex<Option<Duration>>,
    writer: Mutex<Option<TcpStream>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl WireConnection {
    pub fn new(host: impl Into<String>, port: u16, logger: Arc<Logger>) -> Self {
        Self {
            host: host.into(),
            port,
            idle_timeout: Mutex::new(Some(DEFAULT_IDLE_TIMEOUT)),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Closed),
                state_changed: Condvar::new(),
                pending: Mutex::new(PendingQueue::default()),
                last_error: Mutex::new(None),
                observers: Mutex::new(Vec::new()),
                logger,
            }),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn subscribe(&self) -> Receiver<ConnectionEvent> {
        let (sender, receiver) = mpsc::channel();
        self.shared
            .observers
            .lock()
            .expect("connection observers lock poisoned")
            .push(sender);
        receiver
    }

    pub fn detach_observers(&self) {
        self.shared
            .observers
            .lock()
            .expect("connection observers lock poisoned")
            .clear();
    }

    /// Arms the idle-read timer. Expiry only notifies observers; `None` or a
    /// zero duration disables it.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), WireError> {
        let timeout = timeout.filter(|value| !value.is_zero());
        *self
            .idle_timeout
            .lock()
            .expect("connection timeout lock poisoned") = timeout;

        if let Some(stream) = self
            .writer
            .lock()
            .expect("connection writer lock poisoned")
            .as_ref()
        {
            stream.set_read_timeout(timeout).map_err(WireError::Io)?;
        }
        Ok(())
    }

    pub fn open(&self) -> Result<Greeting, WireError> {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .expect("connection state lock poisoned");
            if *state != ConnectionState::Closed {
                return Err(WireError::State {
                    operation: "open",
                    state: *state,
                });
            }
            *state = ConnectionState::Connecting;
        }

        let stream = match self.connect_stream() {
            Ok(stream) => stream,
            Err(error) => {
                self.shared.record_error(error.to_string());
                self.shared.set_state(ConnectionState::Closed);
                return Err(error);
            }
        };

        let (greeting_slot, greeting_reply) = mpsc::channel();
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .expect("connection pending lock poisoned");
            pending.closed_reason = None;
            pending.slots.clear();
            pending.slots.push_back(greeting_slot);
        }
        *self
            .shared
            .last_error
            .lock()
            .expect("connection last error lock poisoned") = None;

        *self.writer.lock().expect("connection writer lock poisoned") = Some(stream);
        if let Err(error) = self.spawn_reader() {
            self.shared.record_error(error.to_string());
            self.abort();
            return Err(error);
        }

        let pending = PendingReply {
            verb: "HI".to_owned(),
            receiver: greeting_reply,
        };
        let greeting = match pending.wait_timeout(self.greeting_timeout()) {
            Ok(Reply::Status(line)) => Greeting::parse(&line).map_err(WireError::from),
            Ok(Reply::Bulk(body)) => Err(WireError::Handshake(
                HandshakeError::MissingGreetingPrefix {
                    line: body.unwrap_or_default(),
                },
            )),
            Err(error) => Err(error),
        };

        match greeting {
            Ok(greeting) => {
                self.shared.set_state(ConnectionState::Open);
                self.shared
                    .notify(ConnectionEvent::Greeting(greeting.clone()));
                self.shared.logger.log(
                    LogLevel::Debug,
                    Some(LOG_CONTEXT),
                    "connection opened",
                    Some(json!({
                        "address": self.address(),
                        "protocol_version": greeting.protocol_version
                    })),
                );
                Ok(greeting)
            }
            Err(error) => {
                self.shared.record_error(error.to_string());
                self.abort();
                Err(error)
            }
        }
    }

    fn spawn_reader(&self) -> Result<(), WireError> {
        let reader_stream = self
            .writer
            .lock()
            .expect("connection writer lock poisoned")
            .as_ref()
            .map(TcpStream::try_clone)
            .transpose()
            .map_err(WireError::Io)?
            .ok_or_else(|| WireError::State {
                operation: "open",
                state: self.state(),
            })?;

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("wire-reader-{}", self.address()))
            .spawn(move || read_loop(reader_stream, shared))
            .map_err(WireError::Io)?;
        *self.reader.lock().expect("connection reader lock poisoned") = Some(handle);
        Ok(())
    }

    /// The greeting must arrive within the idle timeout, and never later than
    /// the connect timeout.
    fn greeting_timeout(&self) -> Duration {
        self.idle_timeout
            .lock()
            .expect("connection timeout lock poisoned")
            .map_or(CONNECT_TIMEOUT, |idle| idle.min(CONNECT_TIMEOUT))
    }

    /// Tears down a connection whose handshake failed. No `END` is sent and
    /// the socket is shut down in both directions to unblock the reader.
    fn abort(&self) {
        self.shared.set_state(ConnectionState::Closing);
        if let Some(stream) = self
            .writer
            .lock()
            .expect("connection writer lock poisoned")
            .take()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let handle = self
            .reader
            .lock()
            .expect("connection reader lock poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        if self.state() != ConnectionState::Closed {
            self.shared.finish();
        }
    }

    fn connect_stream(&self) -> Result<TcpStream, WireError> {
        let address = self.address();
        let candidates = address
            .to_socket_addrs()
            .map_err(|source| WireError::Connect {
                address: address.clone(),
                source,
            })?;

        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    let configure = |stream: &TcpStream| -> io::Result<()> {
                        stream.set_nodelay(true)?;
                        stream.set_read_timeout(
                            *self
                                .idle_timeout
                                .lock()
                                .expect("connection timeout lock poisoned"),
                        )
                    };
                    configure(&stream).map_err(|source| WireError::Connect {
                        address: address.clone(),
                        source,
                    })?;
                    return Ok(stream);
                }
                Err(error) => last_error = error,
            }
        }

        Err(WireError::Connect {
            address,
            source: last_error,
        })
    }

    /// Writes `command` and queues a pending slot for its reply. Replies are
    /// matched strictly in send order.
    pub fn send_deferred(&self, command: &Command) -> Result<PendingReply, WireError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(WireError::State {
                operation: "send",
                state,
            });
        }

        let encoded = command.encode()?;
        let mut writer = self.writer.lock().expect("connection writer lock poisoned");
        let Some(stream) = writer.as_mut() else {
            return Err(WireError::State {
                operation: "send",
                state: self.state(),
            });
        };

        let (slot, receiver) = mpsc::channel();
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .expect("connection pending lock poisoned");
            if let Some(reason) = pending.closed_reason.clone() {
                return Err(WireError::Closed { reason });
            }
            pending.slots.push_back(slot);
        }

        if self.shared.logger.enabled(LogLevel::Verbose) {
            self.shared
                .logger
                .verbose(Some(LOG_CONTEXT), &format!("SEND: {}", command.render()));
        }

        if let Err(error) = stream.write_all(&encoded).and_then(|_| stream.flush()) {
            self.shared.record_error(error.to_string());
            let _ = stream.shutdown(Shutdown::Both);
            return Err(WireError::Io(error));
        }

        Ok(PendingReply {
            verb: command.verb().to_owned(),
            receiver,
        })
    }

    pub fn send(&self, command: &Command) -> Result<Reply, WireError> {
        let reply = self.send_deferred(command)?.wait()?;
        if self.shared.logger.enabled(LogLevel::Verbose) {
            self.shared.logger.verbose(
                Some(LOG_CONTEXT),
                &format!("client={} server={:?}", command.verb(), reply.text()),
            );
        }
        Ok(reply)
    }

    pub fn send_with_assert(&self, command: &Command, expected: &str) -> Result<Reply, WireError> {
        let reply = self.send(command)?;
        if reply.text() != Some(expected) {
            return Err(WireError::Assertion {
                expected: expected.to_owned(),
                actual: reply.into_text(),
            });
        }
        Ok(reply)
    }

    /// Sends `END` and waits for the server to close the socket. Safe to call
    /// repeatedly and from several threads.
    pub fn close(&self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .expect("connection state lock poisoned");
            match *state {
                ConnectionState::Closed if self.reader_finished() => return,
                ConnectionState::Closing => {
                    let deadline = Instant::now() + CLOSE_GRACE * 2;
                    while *state != ConnectionState::Closed {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return;
                        }
                        state = self
                            .shared
                            .state_changed
                            .wait_timeout(state, remaining)
                            .expect("connection state lock poisoned")
                            .0;
                    }
                    return;
                }
                ConnectionState::Closed => {}
                _ => *state = ConnectionState::Closing,
            }
        }

        if let Some(stream) = self
            .writer
            .lock()
            .expect("connection writer lock poisoned")
            .take()
        {
            let _ = stream.set_read_timeout(Some(CLOSE_GRACE));
            let _ = (&stream).write_all(END_COMMAND);
            let _ = stream.shutdown(Shutdown::Write);
        }

        let handle = self
            .reader
            .lock()
            .expect("connection reader lock poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        if self.state() != ConnectionState::Closed {
            self.shared.finish();
        }
        self.shared
            .logger
            .debug(Some(LOG_CONTEXT), &format!("connection to {} closed", self.address()));
    }

    fn reader_finished(&self) -> bool {
        self.reader
            .lock()
            .expect("connection reader lock poisoned")
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for WireConnection {
    fn drop(&mut self) {
        if let Some(stream) = self
            .writer
            .lock()
            .expect("connection writer lock poisoned")
            .take()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn read_loop(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut parser = ReplyParser::new();
    let mut buffer = vec![0_u8; READ_BUFFER_BYTES];

    loop {
        match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(size) => {
                parser.feed(&buffer[..size]);
                loop {
                    match parser.next_frame() {
                        Ok(Some(frame)) => shared.resolve(frame),
                        Ok(None) => break,
                        Err(error) => {
                            shared.record_error(format!("protocol error: {error}"));
                            let _ = stream.shutdown(Shutdown::Both);
                            shared.finish();
                            return;
                        }
                    }
                }
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                if shared.state() == ConnectionState::Closing {
                    break;
                }
                shared.logger.debug(Some(LOG_CONTEXT), "socket idle timeout");
                shared.notify(ConnectionEvent::Timeout);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                shared.record_error(error.to_string());
                break;
            }
        }
    }

    let _ = stream.shutdown(Shutdown::Both);
    shared.finish();
}
