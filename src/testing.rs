//! Scripted wire-protocol server for unit tests.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub(crate) const DEFAULT_GREETING: &str = "+HI {\"v\":2,\"s\":\"abc\",\"i\":3}\r\n";

type Responder = Arc<dyn Fn(&str) -> String + Send + Sync>;

pub(crate) fn bulk_reply(body: &str) -> String {
    format!("${}\r\n{body}\r\n", body.len())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Received {
    pub(crate) verb: String,
    pub(crate) rest: String,
}

impl Received {
    pub(crate) fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.rest).expect("command payload should be JSON")
    }
}

pub(crate) struct MockServerBuilder {
    greeting: String,
    responders: HashMap<String, Responder>,
}

impl MockServerBuilder {
    pub(crate) fn greeting(mut self, greeting: &str) -> Self {
        self.greeting = greeting.to_owned();
        self
    }

    /// Scripts the raw reply for `verb`. The closure receives everything after
    /// the verb. Returning [`MockServer::HANG_UP`] closes the socket instead.
    pub(crate) fn reply<F>(mut self, verb: &str, responder: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.responders.insert(verb.to_owned(), Arc::new(responder));
        self
    }

    pub(crate) fn spawn(self) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("mock server should bind");
        listener
            .set_nonblocking(true)
            .expect("mock listener should be non-blocking");
        let port = listener
            .local_addr()
            .expect("mock server should have an address")
            .port();

        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let greeting = Arc::new(self.greeting);
        let responders = Arc::new(self.responders);

        let accept_handle = {
            let received = Arc::clone(&received);
            let connections = Arc::clone(&connections);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            connections.fetch_add(1, Ordering::SeqCst);
                            let received = Arc::clone(&received);
                            let greeting = Arc::clone(&greeting);
                            let responders = Arc::clone(&responders);
                            thread::spawn(move || {
                                serve_connection(stream, &greeting, &responders, &received)
                            });
                        }
                        Err(error) if error.kind() == ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        MockServer {
            port,
            received,
            connections,
            stop,
            accept_handle: Some(accept_handle),
        }
    }
}

pub(crate) struct MockServer {
    port: u16,
    received: Arc<Mutex<Vec<Received>>>,
    connections: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
}

impl MockServer {
    pub(crate) const HANG_UP: &'static str = "<hang-up>";

    pub(crate) fn builder() -> MockServerBuilder {
        MockServerBuilder {
            greeting: DEFAULT_GREETING.to_owned(),
            responders: HashMap::new(),
        }
    }

    /// Replies `+OK` to every command.
    pub(crate) fn start() -> Self {
        Self::builder().spawn()
    }

    pub(crate) fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("port lookup listener should bind");
        listener
            .local_addr()
            .expect("port lookup listener should have an address")
            .port()
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn url(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn received(&self) -> Vec<Received> {
        self.received
            .lock()
            .expect("mock received lock poisoned")
            .clone()
    }

    pub(crate) fn commands(&self, verb: &str) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|command| command.verb == verb)
            .collect()
    }

    pub(crate) fn wait_for_command(&self, verb: &str, timeout: Duration) -> bool {
        self.wait_for_count(verb, 1, timeout)
    }

    pub(crate) fn wait_for_count(&self, verb: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.commands(verb).len() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_connection(
    stream: TcpStream,
    greeting: &str,
    responders: &HashMap<String, Responder>,
    received: &Mutex<Vec<Received>>,
) {
    let _ = stream.set_nonblocking(false);
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    if writer.write_all(greeting.as_bytes()).is_err() {
        return;
    }

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        received
            .lock()
            .expect("mock received lock poisoned")
            .push(Received {
                verb: verb.to_owned(),
                rest: rest.to_owned(),
            });

        if verb == "END" {
            break;
        }

        let reply = match responders.get(verb) {
            Some(responder) => responder(rest),
            None => "+OK\r\n".to_owned(),
        };
        if reply == MockServer::HANG_UP {
            break;
        }
        if writer.write_all(reply.as_bytes()).is_err() {
            break;
        }
    }

    let _ = writer.shutdown(Shutdown::Both);
}
