//! # Peer Client
//!
//! One `PeerClient` per remote worker (or the master), stable for the
//! worker's lifetime after initialization. Each call is a single
//! request/response exchange on a recycled TCP connection.
//!
//! Connection reuse: healthy connections live on an idle stack and are
//! popped most-recently-used first; a ceiling on live sockets is claimed
//! by compare-and-swap before dialing, so concurrent callers cannot
//! overshoot it. Whether a connection survives is decided by the outcome
//! of its exchange: success recycles it, any transport or protocol
//! failure retires it, since a broken stream's framing state is unknown.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gkv_common::frame::{read_frame, write_frame};
use gkv_common::{GkvError, GkvResult, Request, Response};
use parking_lot::Mutex;
use tracing::trace;

/// Configuration for a peer proxy.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer address, e.g. "127.0.0.1:7199".
    pub addr: String,
    /// Maximum idle connections kept for reuse.
    pub max_idle: usize,
    /// Ceiling on live sockets (idle + in use).
    pub max_total: usize,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
}

impl PeerConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        PeerConfig {
            addr: addr.into(),
            max_idle: 4,
            max_total: 8,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Proxy to one peer. `call` is the only entry point.
pub struct PeerClient {
    config: PeerConfig,
    /// Recycled connections, most recently used on top.
    idle: Mutex<Vec<Connection>>,
    /// Sockets in existence, idle or checked out.
    live: AtomicUsize,
}

impl PeerClient {
    /// Creates a proxy with default bounds. No socket is dialed until the
    /// first call, so proxies can be built for peers that are still
    /// starting up.
    pub fn connect(addr: impl Into<String>) -> Self {
        Self::with_config(PeerConfig::new(addr))
    }

    pub fn with_config(config: PeerConfig) -> Self {
        let idle = Mutex::new(Vec::with_capacity(config.max_idle));
        PeerClient {
            config,
            idle,
            live: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    /// One request/response exchange. Error frames from the peer are
    /// mapped to `GkvError::Remote`; transport failures propagate.
    pub fn call(&self, request: &Request) -> GkvResult<Response> {
        trace!(peer = %self.config.addr, ?request, "peer call");
        let mut conn = self.checkout()?;
        match conn.exchange(request) {
            Ok(response) => {
                self.recycle(conn);
                response.into_result()
            }
            Err(err) => {
                self.retire(conn);
                Err(err)
            }
        }
    }

    /// Announces a worker's listening address to the master.
    pub fn register(&self, host: &str, port: u16) -> GkvResult<()> {
        self.call(&Request::Register {
            host: host.to_string(),
            port,
        })
        .map(|_| ())
    }

    /// Pops a recycled connection, or dials a new one within the ceiling.
    fn checkout(&self) -> GkvResult<Connection> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }

        // Claim a live slot before dialing; the slot is given back if the
        // dial fails.
        let mut live = self.live.load(Ordering::Relaxed);
        loop {
            if live >= self.config.max_total {
                return Err(GkvError::Protocol(format!(
                    "no connection slots left for {}",
                    self.config.addr
                )));
            }
            match self.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => live = current,
            }
        }

        match Connection::open(&self.config) {
            Ok(conn) => Ok(conn),
            Err(err) => {
                self.live.fetch_sub(1, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Puts a healthy connection back on the stack, or retires it when
    /// the stack is full.
    fn recycle(&self, conn: Connection) {
        {
            let mut idle = self.idle.lock();
            if idle.len() < self.config.max_idle {
                idle.push(conn);
                return;
            }
        }
        self.retire(conn);
    }

    /// Drops a connection and releases its live slot.
    fn retire(&self, conn: Connection) {
        drop(conn);
        self.live.fetch_sub(1, Ordering::Release);
    }
}

/// One framed TCP connection. Frames are exact-length reads, so the
/// stream is used unbuffered.
struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Dials the peer, trying every address its name resolves to.
    fn open(config: &PeerConfig) -> GkvResult<Self> {
        let mut last_err = None;
        for addr in config.addr.to_socket_addrs()? {
            let attempt = match config.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_read_timeout(config.read_timeout)?;
                    stream.set_write_timeout(config.write_timeout)?;
                    // Small request/response frames; don't let Nagle
                    // batch them.
                    stream.set_nodelay(true)?;
                    return Ok(Connection { stream });
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(match last_err {
            Some(err) => GkvError::Transport(err),
            None => GkvError::Protocol(format!("{} resolves to no addresses", config.addr)),
        })
    }

    /// Sends one request frame and reads one response frame.
    fn exchange(&mut self, request: &Request) -> GkvResult<Response> {
        write_frame(&mut self.stream, request)?;
        read_frame(&mut self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_dial_releases_its_slot() {
        // Reserved port on localhost; connect is refused immediately.
        let mut config = PeerConfig::new("127.0.0.1:1");
        config.max_total = 1;
        config.connect_timeout = Some(Duration::from_millis(200));
        let client = PeerClient::with_config(config);

        // With a single slot, a leaked claim would turn the second and
        // third attempts into exhaustion errors instead of dial errors.
        for _ in 0..3 {
            let err = client.call(&Request::Flush).unwrap_err();
            assert!(matches!(err, GkvError::Transport(_)));
        }
    }

    #[test]
    fn exhausted_ceiling_fails_fast() {
        let mut config = PeerConfig::new("127.0.0.1:1");
        config.max_total = 0;
        let client = PeerClient::with_config(config);

        let err = client.call(&Request::Flush).unwrap_err();
        match err {
            GkvError::Protocol(message) => assert!(message.contains("no connection slots")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
