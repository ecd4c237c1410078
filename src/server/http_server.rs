use super::codec::{RequestCodec, RequestEvent};
use super::connection::Dispatched;
use super::service::AppService;
use bytes::BytesMut;
use may::coroutine::JoinHandle;
use may::net::{TcpListener, TcpStream};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 8192;

const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// TCP transport for an [`AppService`].
///
/// Each accepted connection runs in its own coroutine and drives a
/// [`ConnectionHandler`](super::ConnectionHandler) with the events produced by
/// a [`RequestCodec`].
pub struct HttpServer(pub AppService);

/// Handle to a running HTTP server
///
/// Provides methods for waiting until the server is ready, stopping it gracefully,
/// or joining the accept coroutine.
pub struct ServerHandle {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound address; resolves port 0 to the port actually assigned.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the server to be ready to accept connections
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` error if the server doesn't become ready within ~250ms (50 attempts × 5ms).
    pub fn wait_ready(&self) -> io::Result<()> {
        for _ in 0..50 {
            if std::net::TcpStream::connect(self.addr).is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"))
    }

    /// Stop accepting connections.
    ///
    /// Connections already accepted finish their current exchange.
    pub fn stop(self) {
        // SAFETY: may::CoroutineHandle::coroutine().cancel() is marked unsafe by the may runtime.
        // The handle is valid (we own it) and cancelling the accept loop is the
        // intended shutdown path.
        unsafe {
            self.handle.coroutine().cancel();
        }
        let _ = self.handle.join();
    }

    /// Block until the accept coroutine finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept coroutine panicked.
    pub fn join(self) -> std::thread::Result<()> {
        self.handle.join()
    }
}

impl HttpServer {
    /// Start the HTTP server on the given address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the port cannot be bound.
    pub fn start<A: ToSocketAddrs>(self, addr: A) -> io::Result<ServerHandle> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid address"))?;
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        let service = self.0;

        // SAFETY: may::coroutine::Builder::spawn() is unsafe because the
        // coroutine must not use thread-local storage that outlives it. The
        // accept loop owns the listener and a service clone only.
        let handle = unsafe {
            may::coroutine::Builder::new()
                .name("brrte-accept".to_string())
                .spawn(move || accept_loop(listener, service))
        }?;

        info!(addr = %addr, "HTTP server listening");
        Ok(ServerHandle { addr, handle })
    }
}

fn accept_loop(listener: TcpListener, service: AppService) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        let service = service.clone();
        let stack_size = service.config().pool.stack_size;
        // SAFETY: see `HttpServer::start`; the connection coroutine owns its
        // stream and a service clone.
        let spawned = unsafe {
            may::coroutine::Builder::new()
                .stack_size(stack_size)
                .spawn(move || {
                    if let Err(e) = serve_connection(&service, stream) {
                        debug!(error = %e, "Connection ended with an I/O error");
                    }
                })
        };
        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn connection coroutine");
        }
    }
}

/// Drive one connection until the peer leaves or a response closes it.
///
/// A deferred response is awaited before the next request head is decoded, so
/// responses leave in request order.
fn serve_connection(service: &AppService, mut stream: TcpStream) -> io::Result<()> {
    let peer = stream.peer_addr().ok();
    let mut conn = service.connection(stream.try_clone()?);
    let mut codec = RequestCodec::new(service.config().max_head_bytes);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut read_buf = [0u8; READ_CHUNK];
    debug!(peer = ?peer, "Connection accepted");

    loop {
        loop {
            let event = match codec.decode(&mut buf) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = ?peer, error = %e, "Malformed request - closing connection");
                    conn.on_disconnect();
                    stream.write_all(BAD_REQUEST)?;
                    stream.flush()?;
                    return Ok(());
                }
            };
            match event {
                RequestEvent::Head(head) => conn.on_headers(head).map_err(io::Error::other)?,
                RequestEvent::Chunk(chunk) => conn.on_body_chunk(&chunk),
                RequestEvent::End => {
                    let outcome = match conn.on_body_end().map_err(io::Error::other)? {
                        Dispatched::Written(outcome) => outcome,
                        Dispatched::Parked(wait) => match wait.wait() {
                            Some(done) => conn.resume(done),
                            None => {
                                warn!(peer = ?peer, "Deferred response lost - closing connection");
                                return Ok(());
                            }
                        },
                    };
                    if outcome.close {
                        debug!(peer = ?peer, status = outcome.status.as_u16(), "Closing after response");
                        return Ok(());
                    }
                }
            }
        }

        let n = stream.read(&mut read_buf)?;
        if n == 0 {
            conn.on_disconnect();
            debug!(peer = ?peer, "Peer closed the connection");
            return Ok(());
        }
        buf.extend_from_slice(&read_buf[..n]);
    }
}
