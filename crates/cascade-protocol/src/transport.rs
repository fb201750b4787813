//! Socket patterns used by the three channels.
//!
//! Request/reply: [`RequestChannel`] (runner side) talks to a
//! [`ReplyChannel`] accepted from a [`ReplyListener`] (composition or loader
//! side). Publish/subscribe: a [`Publisher`] fans each message out to every
//! connected [`Subscriber`].

use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::message::Message;
use crate::{ProtoError, read_frame, write_encoded, write_frame};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(1);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);
const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Unix domain socket path.
    Ipc(PathBuf),
    /// `host:port`, resolved at connect time.
    Tcp(String),
}

impl Endpoint {
    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Self::Ipc(path.into())
    }

    /// Accepts `ipc://<path>` and `tcp://<host>:<port>`.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        let invalid = |details: &str| ProtoError::InvalidEndpoint {
            endpoint: s.to_string(),
            details: details.to_string(),
        };
        if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(invalid("ipc endpoint needs a socket path"));
            }
            Ok(Self::Ipc(PathBuf::from(path)))
        } else if let Some(addr) = s.strip_prefix("tcp://") {
            if !addr.contains(':') {
                return Err(invalid("tcp endpoint must include a port"));
            }
            Ok(Self::Tcp(addr.to_string()))
        } else {
            Err(invalid("expected ipc:// or tcp://"))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Ipc(path) => UnixStream::connect(path).map(Self::Unix),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())?;
                stream.set_nodelay(true)?;
                Ok(Self::Tcp(stream))
            },
        }
    }

    fn connect_with_retry(endpoint: &Endpoint, retry_for: Duration) -> Result<Self, ProtoError> {
        let started = Instant::now();
        loop {
            match Self::connect(endpoint) {
                Ok(stream) => return Ok(stream),
                Err(_) if started.elapsed() < retry_for => thread::sleep(CONNECT_RETRY_INTERVAL),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        match self {
            Self::Unix(s) => s.set_read_timeout(timeout),
            Self::Tcp(s) => s.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        match self {
            Self::Unix(s) => s.set_write_timeout(timeout),
            Self::Tcp(s) => s.set_write_timeout(timeout),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.set_nonblocking(nonblocking),
            Self::Tcp(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Unix(s) => s.try_clone().map(Self::Unix),
            Self::Tcp(s) => s.try_clone().map(Self::Tcp),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Self::Unix(s) => s.shutdown(Shutdown::Both),
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
        };
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    fn bind(endpoint: &Endpoint) -> Result<Self, ProtoError> {
        match endpoint {
            Endpoint::Ipc(path) => {
                // A socket file left by a crashed process blocks bind.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok(Self::Unix {
                    listener,
                    path: path.clone(),
                })
            },
            Endpoint::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(addr.as_str())?)),
        }
    }

    fn local_endpoint(&self) -> Result<Endpoint, ProtoError> {
        match self {
            Self::Unix { path, .. } => Ok(Endpoint::Ipc(path.clone())),
            Self::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Unix { listener, .. } => listener.set_nonblocking(nonblocking),
            Self::Tcp(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    fn accept(&self) -> io::Result<Stream> {
        let stream = match self {
            Self::Unix { listener, .. } => Stream::Unix(listener.accept()?.0),
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nodelay(true)?;
                Stream::Tcp(stream)
            },
        };
        stream.set_nonblocking(false)?;
        Ok(stream)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn timeout_ms(timeout: Option<Duration>) -> u64 {
    timeout.map(|t| t.as_millis() as u64).unwrap_or(0)
}

/// Client half of a request/reply channel.
///
/// `request` takes `&mut self`, so a channel never has more than one
/// exchange outstanding. Any failed exchange poisons the channel: a late
/// reply would otherwise be read as the answer to the next request.
pub struct RequestChannel {
    stream: Stream,
    endpoint: Endpoint,
    poisoned: bool,
}

impl RequestChannel {
    /// Connects, retrying every millisecond until `retry_for` elapses.
    pub fn connect(endpoint: &Endpoint, retry_for: Duration) -> Result<Self, ProtoError> {
        let stream = Stream::connect_with_retry(endpoint, retry_for)?;
        tracing::debug!(endpoint = %endpoint, "request channel connected");
        Ok(Self {
            stream,
            endpoint: endpoint.clone(),
            poisoned: false,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Sends `message` and blocks for the reply. `None` waits indefinitely.
    pub fn request(
        &mut self,
        message: &Message,
        timeout: Option<Duration>,
    ) -> Result<Message, ProtoError> {
        if self.poisoned {
            return Err(ProtoError::Poisoned);
        }
        let result = self.exchange(message, timeout);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn exchange(
        &mut self,
        message: &Message,
        timeout: Option<Duration>,
    ) -> Result<Message, ProtoError> {
        self.stream.set_write_timeout(timeout)?;
        match write_frame(&mut self.stream, message) {
            Err(ProtoError::Io(err)) if is_timeout(&err) => {
                return Err(ProtoError::Timeout {
                    waiting_for: "request to be accepted",
                    timeout_ms: timeout_ms(timeout),
                });
            },
            other => other?,
        }
        self.stream.set_read_timeout(timeout)?;
        match read_frame(&mut self.stream) {
            Ok(reply) => Ok(reply),
            Err(ProtoError::Io(err)) if is_timeout(&err) => Err(ProtoError::Timeout {
                waiting_for: "reply",
                timeout_ms: timeout_ms(timeout),
            }),
            Err(ProtoError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ProtoError::Closed)
            },
            Err(err) => Err(err),
        }
    }

    pub fn close(self) {
        self.stream.shutdown();
    }
}

/// Server half of a request/reply channel.
pub struct ReplyListener {
    listener: Listener,
    endpoint: Endpoint,
}

impl ReplyListener {
    pub fn bind(endpoint: &Endpoint) -> Result<Self, ProtoError> {
        let listener = Listener::bind(endpoint)?;
        let endpoint = listener.local_endpoint()?;
        Ok(Self { listener, endpoint })
    }

    /// The bound address; for `tcp://host:0` this carries the chosen port.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn accept(&self) -> Result<ReplyChannel, ProtoError> {
        self.listener.set_nonblocking(false)?;
        Ok(ReplyChannel {
            stream: self.listener.accept()?,
        })
    }

    /// Waits up to `timeout` for a client. `Ok(None)` means nobody connected.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<ReplyChannel>, ProtoError> {
        self.listener.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok(stream) => return Ok(Some(ReplyChannel { stream })),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                },
                Err(err) => return Err(err.into()),
            }
        }
    }
}

pub struct ReplyChannel {
    stream: Stream,
}

impl ReplyChannel {
    /// Waits for the next request. `Ok(None)` means the client hung up.
    /// With a timeout, an idle channel yields [`ProtoError::Timeout`] and
    /// stays usable, since the wait only covers the first byte.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Message>, ProtoError> {
        let mut first = [0u8; 1];
        self.stream.set_read_timeout(timeout)?;
        let read = loop {
            match self.stream.read(&mut first) {
                Ok(read) => break read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_timeout(&err) => {
                    return Err(ProtoError::Timeout {
                        waiting_for: "request",
                        timeout_ms: timeout_ms(timeout),
                    });
                },
                Err(err) => return Err(err.into()),
            }
        };
        if read == 0 {
            return Ok(None);
        }
        self.stream.set_read_timeout(None)?;
        let message = read_frame((&first[..]).chain(&mut self.stream))?;
        Ok(Some(message))
    }

    pub fn send(&mut self, message: &Message) -> Result<(), ProtoError> {
        write_frame(&mut self.stream, message)
    }
}

/// Publishing half of a publish/subscribe channel.
///
/// Subscribers are accepted on a background thread. A subscriber whose
/// socket stays full past a short write timeout is disconnected, so a slow
/// reader never holds up the publisher.
pub struct Publisher {
    endpoint: Endpoint,
    subscribers: Arc<Mutex<Vec<Stream>>>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Publisher {
    pub fn bind(endpoint: &Endpoint) -> Result<Self, ProtoError> {
        let listener = Listener::bind(endpoint)?;
        let endpoint = listener.local_endpoint()?;
        listener.set_nonblocking(true)?;
        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_thread = thread::Builder::new()
            .name("cascade-publisher-accept".to_string())
            .spawn({
                let subscribers = Arc::clone(&subscribers);
                let shutdown = Arc::clone(&shutdown);
                move || accept_subscribers(listener, subscribers, shutdown)
            })?;
        Ok(Self {
            endpoint,
            subscribers,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Writes `message` to every subscriber and returns how many remain.
    pub fn publish(&self, message: &Message) -> Result<usize, ProtoError> {
        let payload = postcard::to_stdvec(message)?;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain_mut(|stream| match write_encoded(stream, &payload) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(tag = message.tag, error = %err, "dropping telemetry subscriber");
                stream.shutdown();
                false
            },
        });
        Ok(subscribers.len())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(join) = self.accept_thread.take() {
            let _ = join.join();
        }
        for stream in self.subscribers.lock().drain(..) {
            stream.shutdown();
        }
    }
}

fn accept_subscribers(
    listener: Listener,
    subscribers: Arc<Mutex<Vec<Stream>>>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok(stream) => {
                if let Err(err) = stream.set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT)) {
                    tracing::debug!(error = %err, "subscriber rejected");
                    continue;
                }
                subscribers.lock().push(stream);
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL)
            },
            Err(err) => {
                tracing::debug!(error = %err, "subscriber accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            },
        }
    }
}

pub type Delivery = Result<Message, ProtoError>;

/// Subscribing half of a publish/subscribe channel.
///
/// A reader thread decodes whole messages and forwards those whose tag is
/// subscribed. The stream ends with one error delivery: [`ProtoError::Closed`]
/// when the publisher went away, or the decoding/IO failure.
pub struct Subscriber {
    endpoint: Endpoint,
    filter: Arc<RwLock<HashSet<u32>>>,
    rx: Receiver<Delivery>,
    stream: Stream,
    reader: Option<JoinHandle<()>>,
}

impl Subscriber {
    pub fn connect(endpoint: &Endpoint, retry_for: Duration) -> Result<Self, ProtoError> {
        let stream = Stream::connect_with_retry(endpoint, retry_for)?;
        let reader_stream = stream.try_clone()?;
        let filter = Arc::new(RwLock::new(HashSet::new()));
        let (tx, rx) = crossbeam_channel::unbounded();
        let reader = thread::Builder::new()
            .name("cascade-subscriber".to_string())
            .spawn({
                let filter = Arc::clone(&filter);
                move || read_deliveries(reader_stream, filter, tx)
            })?;
        tracing::debug!(endpoint = %endpoint, "subscriber connected");
        Ok(Self {
            endpoint: endpoint.clone(),
            filter,
            rx,
            stream,
            reader: Some(reader),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn subscribe(&self, tag: impl Into<u32>) {
        self.filter.write().insert(tag.into());
    }

    pub fn unsubscribe(&self, tag: impl Into<u32>) {
        self.filter.write().remove(&tag.into());
    }

    pub fn receiver(&self) -> &Receiver<Delivery> {
        &self.rx
    }

    pub fn close(mut self) {
        self.shutdown_reader();
    }

    fn shutdown_reader(&mut self) {
        self.stream.shutdown();
        if let Some(join) = self.reader.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shutdown_reader();
    }
}

fn read_deliveries(mut stream: Stream, filter: Arc<RwLock<HashSet<u32>>>, tx: Sender<Delivery>) {
    loop {
        match read_frame::<_, Message>(&mut stream) {
            Ok(message) => {
                if !filter.read().contains(&message.tag) {
                    continue;
                }
                if tx.send(Ok(message)).is_err() {
                    return;
                }
            },
            Err(ProtoError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                let _ = tx.send(Err(ProtoError::Closed));
                return;
            },
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::{Endpoint, Publisher, ReplyListener, RequestChannel, Subscriber};
    use crate::ProtoError;
    use crate::message::Message;

    fn socket_endpoint(dir: &tempfile::TempDir, name: &str) -> Endpoint {
        Endpoint::ipc(dir.path().join(name))
    }

    #[test]
    fn endpoint_parse_accepts_ipc_and_tcp() {
        assert_eq!(
            Endpoint::parse("ipc:///tmp/a.sock").expect("ipc"),
            Endpoint::ipc("/tmp/a.sock")
        );
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:80").expect("tcp"),
            Endpoint::Tcp("127.0.0.1:80".to_string())
        );
        assert!(Endpoint::parse("tcp://localhost").is_err());
        assert!(Endpoint::parse("inproc://x").is_err());
        assert_eq!(
            Endpoint::ipc("/tmp/a.sock").to_string(),
            "ipc:///tmp/a.sock"
        );
    }

    #[test]
    fn request_reply_exchange_over_unix_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = socket_endpoint(&dir, "control");
        let listener = ReplyListener::bind(&endpoint).expect("bind");
        let server = thread::spawn(move || {
            let mut channel = listener.accept().expect("accept");
            while let Some(request) = channel.recv(None).expect("recv") {
                let reply = Message::new(request.tag + 100).with(request.frames.len() as u64);
                channel.send(&reply).expect("send");
            }
        });

        let mut client =
            RequestChannel::connect(&endpoint, Duration::from_secs(1)).expect("connect");
        let reply = client
            .request(&Message::new(1u32).with("a").with("b"), None)
            .expect("request");
        assert_eq!(reply.tag, 101);
        assert_eq!(reply.reader().uint().expect("count"), 2);
        client.close();
        server.join().expect("server thread");
    }

    #[test]
    fn timed_out_request_poisons_the_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = socket_endpoint(&dir, "silent");
        let listener = ReplyListener::bind(&endpoint).expect("bind");
        let server = thread::spawn(move || {
            let mut channel = listener.accept().expect("accept");
            let _ = channel.recv(None);
            thread::sleep(Duration::from_millis(200));
        });

        let mut client =
            RequestChannel::connect(&endpoint, Duration::from_secs(1)).expect("connect");
        let err = client
            .request(&Message::new(1u32), Some(Duration::from_millis(30)))
            .expect_err("no reply");
        assert!(err.is_timeout(), "{err:?}");
        assert!(client.is_poisoned());
        assert!(matches!(
            client.request(&Message::new(2u32), None),
            Err(ProtoError::Poisoned)
        ));
        server.join().expect("server thread");
    }

    #[test]
    fn connect_retries_until_listener_appears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = socket_endpoint(&dir, "late");
        let bind_endpoint = endpoint.clone();
        let server = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let listener = ReplyListener::bind(&bind_endpoint).expect("bind");
            let _channel = listener.accept().expect("accept");
        });
        RequestChannel::connect(&endpoint, Duration::from_secs(2)).expect("connect after retry");
        server.join().expect("server thread");
    }

    #[test]
    fn connect_gives_up_after_retry_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = socket_endpoint(&dir, "missing");
        assert!(RequestChannel::connect(&endpoint, Duration::from_millis(20)).is_err());
    }

    #[test]
    fn subscriber_only_sees_subscribed_tags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = socket_endpoint(&dir, "telemetry");
        let publisher = Publisher::bind(&endpoint).expect("bind");
        let subscriber = Subscriber::connect(&endpoint, Duration::from_secs(1)).expect("connect");
        subscriber.subscribe(2u32);
        while publisher.subscriber_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        publisher.publish(&Message::new(1u32)).expect("publish 1");
        publisher.publish(&Message::new(2u32).with("x")).expect("publish 2");
        let delivered = subscriber
            .receiver()
            .recv_timeout(Duration::from_secs(1))
            .expect("delivery")
            .expect("message");
        assert_eq!(delivered.tag, 2);

        drop(publisher);
        let end = subscriber
            .receiver()
            .recv_timeout(Duration::from_secs(1))
            .expect("end of stream");
        assert!(matches!(end, Err(ProtoError::Closed)));
    }

    #[test]
    fn reply_recv_timeout_leaves_channel_usable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = socket_endpoint(&dir, "idle");
        let listener = ReplyListener::bind(&endpoint).expect("bind");
        let client = thread::spawn({
            let endpoint = endpoint.clone();
            move || {
                let mut client =
                    RequestChannel::connect(&endpoint, Duration::from_secs(1)).expect("connect");
                thread::sleep(Duration::from_millis(60));
                client.request(&Message::new(5u32), None).expect("request")
            }
        });
        let mut channel = listener.accept().expect("accept");
        let idle = channel.recv(Some(Duration::from_millis(10)));
        assert!(matches!(idle, Err(ProtoError::Timeout { .. })));
        let request = channel
            .recv(Some(Duration::from_secs(2)))
            .expect("recv")
            .expect("request");
        channel.send(&Message::new(request.tag)).expect("reply");
        assert_eq!(client.join().expect("client").tag, 5);
    }
}
