//! Shared test fixtures
//!
//! - `FakeServer`: a small memcached speaking the text protocol over TCP
//! - `ScriptedTransport`: in-memory streams whose replies the test writes

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use memcast::config::ServerAddr;
use memcast::network::{Stream, Transport};
use parking_lot::Mutex;

/// Default item size limit of the fake server
pub const FAKE_MAX_ITEM_SIZE: usize = 1024 * 1024;

// =============================================================================
// Fake memcached
// =============================================================================

type Store = Arc<Mutex<HashMap<String, (u32, Vec<u8>)>>>;

pub struct FakeServer {
    addr: SocketAddr,
    store: Store,
    requests: Arc<Mutex<Vec<String>>>,
    clients: Arc<Mutex<Vec<TcpStream>>>,
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeServer {
    pub fn start() -> Self {
        Self::with_max_item_size(FAKE_MAX_ITEM_SIZE)
    }

    pub fn with_max_item_size(max_item_size: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let clients = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicBool::new(false));

        let handle = {
            let store = Arc::clone(&store);
            let requests = Arc::clone(&requests);
            let clients = Arc::clone(&clients);
            let stopped = Arc::clone(&stopped);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if stopped.load(Ordering::Acquire) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    if let Ok(clone) = stream.try_clone() {
                        clients.lock().push(clone);
                    }
                    let store = Arc::clone(&store);
                    let requests = Arc::clone(&requests);
                    thread::spawn(move || {
                        let _ = serve(stream, store, requests, max_item_size);
                    });
                }
            })
        };

        Self {
            addr,
            store,
            requests,
            clients,
            stopped,
            handle: Some(handle),
        }
    }

    /// `host:port` for `Config`
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn server_addr(&self) -> ServerAddr {
        ServerAddr::new(self.addr.ip().to_string(), self.addr.port())
    }

    /// Raw flags and payload stored under `key`
    pub fn item(&self, key: &str) -> Option<(u32, Vec<u8>)> {
        self.store.lock().get(key).cloned()
    }

    /// Store a raw item, bypassing the client
    pub fn put_raw(&self, key: &str, flags: u32, data: &[u8]) {
        self.store.lock().insert(key.to_string(), (flags, data.to_vec()));
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    /// Command lines received so far, data blocks excluded
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// Stop listening and drop every client connection
    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        for client in self.clients.lock().drain(..) {
            let _ = client.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(
    stream: TcpStream,
    store: Store,
    requests: Arc<Mutex<Vec<String>>>,
    max_item_size: usize,
) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut out = stream;
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        requests.lock().push(text.clone());

        let parts: Vec<&str> = text.split(' ').collect();
        let reply: Vec<u8> = match parts.as_slice() {
            ["get", keys @ ..] | ["gets", keys @ ..] => {
                let store = store.lock();
                let mut reply = Vec::new();
                for key in keys {
                    if let Some((flags, data)) = store.get(*key) {
                        reply.extend_from_slice(format!("VALUE {} {} {}\r\n", key, flags, data.len()).as_bytes());
                        reply.extend_from_slice(data);
                        reply.extend_from_slice(b"\r\n");
                    }
                }
                reply.extend_from_slice(b"END\r\n");
                reply
            }
            [verb @ ("set" | "add" | "replace" | "append" | "prepend"), key, flags, _exptime, len] => {
                let len: usize = len.parse().unwrap_or(0);
                let flags: u32 = flags.parse().unwrap_or(0);
                let mut data = vec![0u8; len + 2];
                reader.read_exact(&mut data)?;
                data.truncate(len);

                if len > max_item_size {
                    b"SERVER_ERROR object too large for cache\r\n".to_vec()
                } else {
                    store_item(&mut store.lock(), verb, key, flags, data)
                }
            }
            ["delete", key] => match store.lock().remove(*key) {
                Some(_) => b"DELETED\r\n".to_vec(),
                None => b"NOT_FOUND\r\n".to_vec(),
            },
            [verb @ ("incr" | "decr"), key, delta] => {
                let delta: u64 = delta.parse().unwrap_or(0);
                let mut store = store.lock();
                match store.get_mut(*key) {
                    None => b"NOT_FOUND\r\n".to_vec(),
                    Some((_, data)) => match String::from_utf8_lossy(data).parse::<u64>() {
                        Ok(current) => {
                            let next = if *verb == "incr" {
                                current.wrapping_add(delta)
                            } else {
                                current.saturating_sub(delta)
                            };
                            *data = next.to_string().into_bytes();
                            format!("{}\r\n", next).into_bytes()
                        }
                        Err(_) => b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec(),
                    },
                }
            }
            ["touch", key, _exptime] => {
                if store.lock().contains_key(*key) {
                    b"TOUCHED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            ["version"] => b"VERSION 1.6.21-fake\r\n".to_vec(),
            ["flush_all", ..] => {
                store.lock().clear();
                b"OK\r\n".to_vec()
            }
            _ => b"ERROR\r\n".to_vec(),
        };

        out.write_all(&reply)?;
        out.flush()?;
    }
}

fn store_item(
    store: &mut HashMap<String, (u32, Vec<u8>)>,
    verb: &str,
    key: &str,
    flags: u32,
    data: Vec<u8>,
) -> Vec<u8> {
    let exists = store.contains_key(key);
    match verb {
        "add" if exists => return b"NOT_STORED\r\n".to_vec(),
        "replace" | "append" | "prepend" if !exists => return b"NOT_STORED\r\n".to_vec(),
        _ => {}
    }

    match verb {
        "append" | "prepend" => {
            if let Some((_, existing)) = store.get_mut(key) {
                if verb == "append" {
                    existing.extend_from_slice(&data);
                } else {
                    let mut joined = data;
                    joined.extend_from_slice(existing);
                    *existing = joined;
                }
            }
        }
        _ => {
            store.insert(key.to_string(), (flags, data));
        }
    }
    b"STORED\r\n".to_vec()
}

/// An address nothing listens on
pub fn refused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

// =============================================================================
// Scripted transport
// =============================================================================

/// In-memory transport; every accepted connect hands a `Peer` to the test
#[derive(Default)]
pub struct ScriptedTransport {
    refused: Mutex<HashSet<ServerAddr>>,
    peers: Mutex<Option<(Sender<Peer>, Receiver<Peer>)>>,
    gate: Mutex<Option<Receiver<()>>>,
    answer_version: AtomicBool,
    connects: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        let transport = Self::default();
        *transport.peers.lock() = Some(channel::unbounded());
        Arc::new(transport)
    }

    /// Refuse (or accept again) connections to `addr`
    pub fn refuse(&self, addr: &ServerAddr, refused: bool) {
        let mut set = self.refused.lock();
        if refused {
            set.insert(addr.clone());
        } else {
            set.remove(addr);
        }
    }

    /// Reply to `version` on every new stream without involving the test
    pub fn answer_version(&self, enabled: bool) {
        self.answer_version.store(enabled, Ordering::Release);
    }

    /// Block connects until the returned sender sends or is dropped
    pub fn hold_connects(&self) -> Sender<()> {
        let (tx, rx) = channel::bounded(0);
        *self.gate.lock() = Some(rx);
        tx
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    /// Next accepted stream
    pub fn next_peer(&self) -> Peer {
        self.try_next_peer(Duration::from_secs(5))
            .expect("no connection within 5s")
    }

    pub fn try_next_peer(&self, timeout: Duration) -> Option<Peer> {
        let rx = self.peers.lock().as_ref().map(|(_, rx)| rx.clone())?;
        rx.recv_timeout(timeout).ok()
    }
}

impl Transport for ScriptedTransport {
    fn connect(&self, addr: &ServerAddr, _timeout: Duration) -> io::Result<Box<dyn Stream>> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }

        self.connects.fetch_add(1, Ordering::AcqRel);
        if self.refused.lock().contains(addr) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused by script"));
        }

        let (tx, rx) = channel::unbounded::<Vec<u8>>();
        let written = Arc::new(Mutex::new(Vec::new()));
        let peer = Peer {
            addr: addr.clone(),
            written: Arc::clone(&written),
            tx: tx.clone(),
        };

        if let Some((peers, _)) = self.peers.lock().as_ref() {
            let _ = peers.send(peer);
        }

        Ok(Box::new(ScriptedStream {
            written,
            tx,
            rx,
            answer_version: self.answer_version.load(Ordering::Acquire),
            read_timeout: Arc::new(Mutex::new(None)),
        }))
    }
}

/// The server side of a scripted stream
#[derive(Clone)]
pub struct Peer {
    pub addr: ServerAddr,
    written: Arc<Mutex<Vec<u8>>>,
    tx: Sender<Vec<u8>>,
}

impl Peer {
    /// Deliver bytes to the client
    pub fn reply(&self, bytes: &[u8]) {
        if !bytes.is_empty() {
            let _ = self.tx.send(bytes.to_vec());
        }
    }

    /// Close the stream from the server side
    pub fn close(&self) {
        let _ = self.tx.send(Vec::new());
    }

    /// Everything the client wrote so far
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.written()).to_string()
    }

    /// Wait until the client has written `needle`
    pub fn expect_written(&self, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.written_str().contains(needle) {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("client never wrote {:?}; got {:?}", needle, self.written_str());
    }
}

struct ScriptedStream {
    written: Arc<Mutex<Vec<u8>>>,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    answer_version: bool,
    read_timeout: Arc<Mutex<Option<Duration>>>,
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().extend_from_slice(buf);
        if self.answer_version && buf == b"version\r\n" {
            let _ = self.tx.send(b"VERSION 1.6.21-scripted\r\n".to_vec());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Stream for ScriptedStream {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(ScriptedReader {
            rx: self.rx.clone(),
            pending: Vec::new(),
            timeout: Arc::clone(&self.read_timeout),
        }))
    }

    fn shutdown(&self) -> io::Result<()> {
        let _ = self.tx.send(Vec::new());
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        *self.read_timeout.lock() = timeout;
        Ok(())
    }
}

struct ScriptedReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    timeout: Arc<Mutex<Option<Duration>>>,
}

impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            let timeout = *self.timeout.lock();
            let received = match timeout {
                Some(t) => self.rx.recv_timeout(t).map_err(|e| match e {
                    RecvTimeoutError::Timeout => Some(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "scripted read timed out",
                    )),
                    RecvTimeoutError::Disconnected => None,
                }),
                None => self.rx.recv().map_err(|_| None),
            };
            match received {
                Ok(bytes) if bytes.is_empty() => return Ok(0),
                Ok(bytes) => self.pending = bytes,
                Err(Some(e)) => return Err(e),
                Err(None) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Poll `condition` until it holds or five seconds pass
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
