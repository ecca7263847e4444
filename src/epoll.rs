//! Readiness event loop owning every registered session's socket state
//!
//! The daemon runs a single dedicated thread around a [`mio::Poll`] instance.
//! All registered sessions are multiplexed over it: read readiness drives the
//! session's receive path into its protocol callback, write readiness drains
//! the session's send buffer. Each registered session is held by exactly one
//! strong reference in the daemon's table; dropping that reference after
//! unregistration is what eventually closes the socket.
//!
//! Other threads talk to the loop through an [`EpollHandle`]: a control
//! message queue paired with a [`mio::Waker`]. Registration and write re-arm
//! requests are queued and the poller is woken, so no cross-thread call ever
//! blocks on the event thread, and the event thread never blocks on a
//! session's buffer mutex.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use poseidon::epoll::EpollDaemon;
//!
//! let mut daemon = EpollDaemon::start(Duration::from_millis(100))?;
//! let handle = daemon.handle().clone();
//! // hand `handle` to TcpServer instances and client session factories
//! # let _ = handle;
//! daemon.stop();
//! # Ok::<(), std::io::Error>(())
//! ```

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::logtag::{self, LogTag};
use crate::session::TcpSession;

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Bytes moved per read/write syscall on the event thread
const SCRATCH_SIZE: usize = 16 * 1024;

enum Control {
    Register(Arc<TcpSession>),
    Touch(RawFd),
}

/// Cheap-to-clone handle for feeding sessions to the event loop
pub struct EpollHandle {
    tx: Sender<Control>,
    waker: Arc<Waker>,
}

impl Clone for EpollHandle {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }
}

impl std::fmt::Debug for EpollHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollHandle").finish_non_exhaustive()
    }
}

impl EpollHandle {
    /// Adds a session to the loop with read-readiness interest
    ///
    /// The daemon takes the strong reference; the session learns this handle
    /// so later [`send`](TcpSession::send) calls can re-arm write readiness.
    pub fn register_session(&self, session: Arc<TcpSession>) {
        session.attach_epoll(self.clone());
        let _ = self.tx.send(Control::Register(session));
        let _ = self.waker.wake();
    }

    /// Re-examines a session's write interest after its send buffer changed
    pub fn touch_session(&self, session: &TcpSession) {
        self.touch_fd(session.fd());
    }

    pub(crate) fn touch_fd(&self, fd: RawFd) {
        let _ = self.tx.send(Control::Touch(fd));
        let _ = self.waker.wake();
    }
}

/// The process-wide readiness notifier thread
///
/// Create one per process with [`start`](Self::start); stop it explicitly or
/// let drop do it.
pub struct EpollDaemon {
    handle: EpollHandle,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for EpollDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollDaemon")
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EpollDaemon {
    /// Spawns the event thread
    ///
    /// `poll_timeout` bounds every wait so control messages and stop requests
    /// are observed promptly even when no socket is active.
    pub fn start(poll_timeout: Duration) -> io::Result<EpollDaemon> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("epoll".to_owned())
            .spawn(move || event_loop(poll, rx, thread_running, poll_timeout))?;

        log::info!("epoll daemon started.");
        Ok(EpollDaemon {
            handle: EpollHandle { tx, waker },
            running,
            thread: Some(thread),
        })
    }

    /// Handle for registering and touching sessions from any thread
    pub fn handle(&self) -> &EpollHandle {
        &self.handle
    }

    /// Stops the event thread and joins it
    ///
    /// Remaining sessions are unregistered and their strong references
    /// dropped.
    pub fn stop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        log::info!("stopping epoll daemon...");
        self.running.store(false, Ordering::Release);
        let _ = self.handle.waker.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EpollDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn event_loop(
    mut poll: Poll,
    rx: Receiver<Control>,
    running: Arc<AtomicBool>,
    poll_timeout: Duration,
) {
    logtag::set_thread_tag(LogTag::Epoll);

    let mut events = Events::with_capacity(1024);
    let mut sessions: HashMap<Token, Arc<TcpSession>> = HashMap::new();
    let mut scratch = vec![0u8; SCRATCH_SIZE];

    while running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, Some(poll_timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("epoll wait failed: {e}");
            break;
        }

        drain_control(&rx, &poll, &mut sessions);

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let Some(session) = sessions.get(&token).cloned() else {
                continue;
            };

            let mut dead = event.is_error();

            if !dead && (event.is_readable() || event.is_read_closed()) {
                dead = drive_read(&poll, token, &session, &mut scratch);
            }
            if !dead && event.is_writable() {
                dead = drive_write(&poll, token, &session, &mut scratch);
            }

            if dead {
                unregister(&poll, &mut sessions, token);
            }
        }
    }

    for (token, _session) in sessions.drain() {
        let fd = token.0 as RawFd;
        let _ = poll.registry().deregister(&mut SourceFd(&fd));
    }
    log::info!("epoll daemon stopped.");
}

fn drain_control(rx: &Receiver<Control>, poll: &Poll, sessions: &mut HashMap<Token, Arc<TcpSession>>) {
    while let Ok(msg) = rx.try_recv() {
        match msg {
            Control::Register(session) => {
                let fd = session.fd();
                let token = Token(fd as usize);
                let interest = if session.pending_out_len() > 0 {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                match poll.registry().register(&mut SourceFd(&fd), token, interest) {
                    Ok(()) => {
                        sessions.insert(token, session);
                    }
                    Err(e) => {
                        log::error!(
                            "failed to register session, remote IP = {}: {e}",
                            session.remote_ip()
                        );
                    }
                }
            }
            Control::Touch(fd) => {
                let token = Token(fd as usize);
                let Some(session) = sessions.get(&token).cloned() else {
                    continue;
                };
                if session.pending_out_len() > 0 {
                    let _ = poll.registry().reregister(
                        &mut SourceFd(&fd),
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    );
                } else if session.has_been_shutdown() {
                    // Nothing left to flush; finish the shutdown now.
                    session.finish_shutdown();
                    unregister(poll, sessions, token);
                }
            }
        }
    }
}

/// Pulls available bytes and feeds the session's protocol callback.
/// Returns true when the session should be dropped.
fn drive_read(poll: &Poll, token: Token, session: &Arc<TcpSession>, scratch: &mut [u8]) -> bool {
    loop {
        match session.do_read(scratch) {
            Ok(0) => {
                log::debug!("peer closed connection, remote IP = {}", session.remote_ip());
                if session.pending_out_len() > 0 {
                    // Queued bytes still owed to the peer; stop watching for
                    // reads and let the write path finish.
                    let fd = token.0 as RawFd;
                    let _ = poll
                        .registry()
                        .reregister(&mut SourceFd(&fd), token, Interest::WRITABLE);
                    return false;
                }
                if session.has_been_shutdown() {
                    session.finish_shutdown();
                }
                return true;
            }
            Ok(n) => session.handle_receive(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!(
                    "read error, dropping session, remote IP = {}: {e}",
                    session.remote_ip()
                );
                return true;
            }
        }
    }
}

/// Drains the send buffer while the socket accepts bytes.
/// Returns true when the session should be dropped.
fn drive_write(poll: &Poll, token: Token, session: &Arc<TcpSession>, scratch: &mut [u8]) -> bool {
    loop {
        match session.do_write(scratch) {
            Ok(0) => {
                // Buffer drained. A shut-down session is finished with;
                // otherwise fall back to read-only interest.
                if session.has_been_shutdown() {
                    session.finish_shutdown();
                    return true;
                }
                let fd = token.0 as RawFd;
                let _ = poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), token, Interest::READABLE);
                return false;
            }
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!(
                    "write error, dropping session, remote IP = {}: {e}",
                    session.remote_ip()
                );
                return true;
            }
        }
    }
}

fn unregister(poll: &Poll, sessions: &mut HashMap<Token, Arc<TcpSession>>, token: Token) {
    if sessions.remove(&token).is_some() {
        let fd = token.0 as RawFd;
        let _ = poll.registry().deregister(&mut SourceFd(&fd));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::StreamBuffer;
    use crate::raw::ScopedFd;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn register_connected_session(
        handle: &EpollHandle,
        handler: crate::session::SessionHandler,
    ) -> (Arc<TcpSession>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        let session = TcpSession::new(ScopedFd::from(stream), handler).unwrap();
        handle.register_session(Arc::clone(&session));
        (session, peer)
    }

    #[test]
    fn test_readable_bytes_reach_the_session_handler() {
        init_logging();
        let mut daemon = EpollDaemon::start(Duration::from_millis(10)).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let (_session, mut peer) = register_connected_session(
            daemon.handle(),
            Box::new(move |_, data| sink.lock().unwrap().extend_from_slice(data)),
        );

        peer.write_all(b"HELLO").unwrap();
        for _ in 0..100 {
            if received.lock().unwrap().as_slice() == b"HELLO" {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received.lock().unwrap().as_slice(), b"HELLO");
        daemon.stop();
    }

    #[test]
    fn test_send_reaches_peer_and_shutdown_delivers_eof() {
        init_logging();
        let mut daemon = EpollDaemon::start(Duration::from_millis(10)).unwrap();
        let (session, mut peer) =
            register_connected_session(daemon.handle(), Box::new(|_, _| {}));

        assert!(session.send(StreamBuffer::from(b"HELLO")));
        assert!(session.shutdown());

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut got = Vec::new();
        peer.read_to_end(&mut got).unwrap(); // returns at EOF
        assert_eq!(got, b"HELLO");
        daemon.stop();
    }

    #[test]
    fn test_echo_through_handler_send_path() {
        init_logging();
        let mut daemon = EpollDaemon::start(Duration::from_millis(10)).unwrap();
        let (_session, mut peer) = register_connected_session(
            daemon.handle(),
            Box::new(|session, data| {
                session.send(StreamBuffer::from(data));
                session.shutdown();
            }),
        );

        peer.write_all(b"ping").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut got = Vec::new();
        peer.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"ping");
        daemon.stop();
    }
}
