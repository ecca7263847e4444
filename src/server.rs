//! Listening socket acceptor producing sessions through a user factory
//!
//! A [`TcpServer`] owns one listening socket and one accept thread. Each
//! accepted connection is passed to the user-provided factory, which builds
//! the [`TcpSession`] with whatever protocol callback the application wants;
//! the server then hands the session to the event loop and goes back to
//! accepting. When TLS credentials are supplied, every session is upgraded to
//! server-side TLS (handshake included) before registration.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use poseidon::buffer::StreamBuffer;
//! use poseidon::epoll::EpollDaemon;
//! use poseidon::server::TcpServer;
//! use poseidon::session::TcpSession;
//!
//! let daemon = EpollDaemon::start(Duration::from_millis(100))?;
//! let server = TcpServer::bind(
//!     "0.0.0.0:7000".parse().unwrap(),
//!     daemon.handle().clone(),
//!     None,
//!     Box::new(|socket| {
//!         TcpSession::new(
//!             socket,
//!             Box::new(|session, data| {
//!                 session.send(StreamBuffer::from(data));
//!             }),
//!         )
//!     }),
//! )?;
//! println!("echoing on {}", server.local_addr());
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::IntoRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::epoll::EpollHandle;
use crate::raw::ScopedFd;
use crate::session::{SslCredentials, TcpSession};

const LISTENER_TOKEN: Token = Token(0);
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Builds a session from a freshly accepted socket
///
/// Runs on the accept thread. Returning an error drops the connection with a
/// warning; it does not stop the server.
pub type SessionFactory = Box<dyn Fn(ScopedFd) -> crate::Result<Arc<TcpSession>> + Send + Sync>;

/// Listening socket plus its accept thread
pub struct TcpServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TcpServer {
    /// Binds the listener and spawns the accept thread
    ///
    /// `ssl` enables server-side TLS for every accepted session; `None` keeps
    /// sessions in the clear.
    pub fn bind(
        addr: SocketAddr,
        epoll: EpollHandle,
        ssl: Option<SslCredentials>,
        factory: SessionFactory,
    ) -> io::Result<TcpServer> {
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let mut poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("accept".to_owned())
            .spawn(move || accept_loop(poll, listener, epoll, ssl, factory, thread_running))?;

        log::info!("listening on {local_addr}");
        Ok(TcpServer {
            local_addr,
            running,
            thread: Some(thread),
        })
    }

    /// Address the listener actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and joins the accept thread
    ///
    /// Sessions already handed to the event loop are unaffected.
    pub fn stop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        log::info!("closing listener on {}", self.local_addr);
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    mut poll: Poll,
    listener: TcpListener,
    epoll: EpollHandle,
    ssl: Option<SslCredentials>,
    factory: SessionFactory,
    running: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(16);

    while running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, Some(ACCEPT_POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("accept poll failed: {e}");
            break;
        }

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("accepted connection from {peer}");
                    let socket = unsafe { ScopedFd::from_raw(stream.into_raw_fd()) };
                    match factory(socket) {
                        Ok(session) => {
                            if let Some(credentials) = &ssl {
                                if let Err(e) = session.init_ssl_server(credentials) {
                                    log::warn!("TLS handshake with {peer} failed: {e}");
                                    continue;
                                }
                            }
                            epoll.register_session(session);
                        }
                        Err(e) => {
                            log::warn!("session factory rejected connection from {peer}: {e}");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("accept failed: {e}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::StreamBuffer;
    use crate::epoll::EpollDaemon;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_accept_echo_then_shutdown_delivers_eof() {
        init_logging();
        let mut daemon = EpollDaemon::start(Duration::from_millis(10)).unwrap();
        let mut server = TcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            daemon.handle().clone(),
            None,
            Box::new(|socket| {
                TcpSession::new(
                    socket,
                    Box::new(|session, data| {
                        session.send(StreamBuffer::from(data));
                        session.shutdown();
                    }),
                )
            }),
        )
        .unwrap();

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.write_all(b"HELLO").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"HELLO");

        server.stop();
        daemon.stop();
    }

    #[test]
    fn test_factory_error_drops_connection_but_keeps_serving() {
        init_logging();
        let mut daemon = EpollDaemon::start(Duration::from_millis(10)).unwrap();
        let rejected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rejected);
        let mut server = TcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            daemon.handle().clone(),
            None,
            Box::new(move |socket| {
                if !flag.swap(true, Ordering::SeqCst) {
                    return Err(crate::error::Error::Protocol("not today".into()));
                }
                TcpSession::new(
                    socket,
                    Box::new(|session, data| {
                        session.send(StreamBuffer::from(data));
                        session.shutdown();
                    }),
                )
            }),
        )
        .unwrap();

        // First connection is rejected by the factory.
        let _dropped = TcpStream::connect(server.local_addr()).unwrap();

        // Second connection is served normally.
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.write_all(b"ok?").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"ok?");

        server.stop();
        daemon.stop();
    }
}
