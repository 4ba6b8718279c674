//! The server orchestrator (§4.5): binds a listener, spawns one OS thread
//! per accepted connection (§5 "Scheduling model"), and on each thread runs
//! the handshake then hands off to [`Connection::run`].
//!
//! Grounded in the teacher's `examples/server.rs`/`examples/bench_server.rs`:
//! `TcpListener::bind` + `stream.set_nodelay(true)` + `thread::spawn` per
//! accepted stream, the same shape this module generalizes to also accept
//! Unix-domain sockets and to run the handshake/read-loop pipeline instead
//! of the teacher's single `ServerBuilder::accept` call.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, info_span, warn};

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

use crate::buffer::BufferProvider;
use crate::config::Config;
use crate::connection::Connection;
use crate::errors::WsError;
use crate::handler::Handler;
use crate::handshake::{self, HandshakePool};
use crate::reader::Reader;

/// The concrete stream types this orchestrator hands to [`Connection`]
/// (§6 "Platform quirks": `TCP_NODELAY` applies only to TCP).
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Stream {
    /// Per-read socket timeout for the duration of the handshake (§5
    /// "Timeouts": the handshake applies both this and the absolute
    /// deadline checked in `handshake::read_request`). `None` clears it,
    /// restoring a blocking-forever read once the handshake is done.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(s) => s.set_read_timeout(timeout),
        }
    }
}

/// Ignore `SIGPIPE` process-wide so a peer disconnecting mid-write surfaces
/// as an `EPIPE` `io::Error` instead of terminating the process (§9
/// "Platform quirks").
#[cfg(unix)]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_sigpipe() {}

/// Owns the shared pools and configuration for one listening server.
/// `H::Context` is shared (read-only, from the orchestrator's point of
/// view) across every connection thread.
pub struct Server<H: Handler<Stream>> {
    config: Config,
    provider: Arc<BufferProvider>,
    handshake_pool: Arc<HandshakePool>,
    context: Arc<H::Context>,
}

impl<H> Server<H>
where
    H: Handler<Stream> + 'static,
    H::Context: Send + Sync + 'static,
{
    pub fn new(config: Config, context: H::Context) -> Self {
        let provider = Arc::new(BufferProvider::new(
            config.large_buffer_size,
            config.large_buffer_pool_count,
        ));
        let handshake_pool = Arc::new(HandshakePool::new(
            config.handshake_pool_count,
            config.handshake_max_size,
            config.max_headers,
        ));
        Server {
            config,
            provider,
            handshake_pool,
            context: Arc::new(context),
        }
    }

    /// Bind and accept forever, spawning one thread per connection. Never
    /// returns on success; returns on a listener-level I/O error.
    pub fn run(self) -> Result<(), WsError> {
        ignore_sigpipe();

        if let Some(path) = self.config.unix_path.clone() {
            return self.run_unix(&path);
        }
        self.run_tcp()
    }

    fn run_tcp(self) -> Result<(), WsError> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        let listener = TcpListener::bind(&addr)?;
        info!(%addr, "listening");
        for incoming in listener.incoming() {
            let stream = match incoming {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            stream.set_nodelay(true)?;
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            self.spawn(Stream::Tcp(stream), peer);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn run_unix(self, path: &str) -> Result<(), WsError> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!(%path, "listening on unix socket");
        for incoming in listener.incoming() {
            let stream = match incoming {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            self.spawn(Stream::Unix(stream), path.to_string());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn run_unix(self, _path: &str) -> Result<(), WsError> {
        Err(WsError::HandlerInit(
            "unix domain sockets are not supported on this platform".to_string(),
        ))
    }

    fn spawn(&self, stream: Stream, peer: String) {
        let config = self.config.clone();
        let provider = self.provider.clone();
        let handshake_pool = self.handshake_pool.clone();
        let context = self.context.clone();
        thread::spawn(move || {
            let span = info_span!("connection", peer = %peer);
            let _enter = span.enter();
            if let Err(err) = handle_connection::<H>(stream, config, provider, handshake_pool, context) {
                warn!(error = %err, "connection terminated");
            }
        });
    }
}

fn handle_connection<H>(
    mut stream: Stream,
    config: Config,
    provider: Arc<BufferProvider>,
    handshake_pool: Arc<HandshakePool>,
    context: Arc<H::Context>,
) -> Result<(), WsError>
where
    H: Handler<Stream>,
{
    let deadline = config
        .handshake_timeout_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    let read_timeout = config.handshake_timeout_ms.map(Duration::from_millis);
    stream.set_read_timeout(read_timeout)?;

    let mut lease = handshake_pool.acquire();
    let request = match handshake::read_request(
        &mut stream,
        &mut *lease,
        config.handshake_max_size,
        deadline,
    ) {
        Ok(request) => request,
        Err(WsError::Handshake(err)) => {
            let _ = handshake::write_error_reply(&mut stream, &err);
            return Err(WsError::Handshake(err));
        }
        Err(err) => return Err(err),
    };
    drop(lease);

    // clear the handshake-only read timeout; the core imposes none post-handshake (§5).
    stream.set_read_timeout(None)?;

    handshake::write_switching_protocols(&mut stream, &request.key)?;
    info!(path = %request.path, "handshake complete");

    let reader = Reader::new(provider.clone(), config.buffer_size, config.max_size);
    let mut conn = Connection::new(stream, reader, provider, config);

    let mut handler = match H::init(&request, &mut conn, &context) {
        Ok(handler) => handler,
        Err(err) => {
            error!(error = %err, "handler rejected connection");
            let _ = conn.write_close_with_code(1002);
            return Err(err);
        }
    };

    if let Err(err) = handler.after_init(&mut conn) {
        warn!(error = %err, "after_init failed");
        handler.close();
        return Err(err);
    }

    conn.run(&mut handler)
}
