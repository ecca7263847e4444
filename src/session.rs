//! Per-connection duplex byte pipe with an optional TLS wrapper
//!
//! A [`TcpSession`] owns one connected socket. User code talks to the session
//! from any thread through [`send`](TcpSession::send) and the shutdown
//! family; the event loop drives the socket from its own thread through the
//! crate-internal read/write drivers. The two sides meet at a single mutex
//! guarding the outbound [`StreamBuffer`], and the contract for that mutex is
//! strict: no syscall ever runs while it is held.
//!
//! # Shutdown state machine
//!
//! ```text
//! ACTIVE --shutdown()--> HALF_CLOSED --buffer drained--> (unregistered, closed)
//! ACTIVE --force_shutdown()--> CLOSED
//! ```
//!
//! Exactly one caller wins the `ACTIVE` to `HALF_CLOSED` transition; the
//! transition half-closes the read side while buffered outbound bytes keep
//! draining. `force_shutdown` closes both directions at once and discards
//! whatever was still queued.
//!
//! # Examples
//!
//! ```rust,no_run
//! use poseidon::buffer::StreamBuffer;
//! use poseidon::raw::ScopedFd;
//! use poseidon::session::TcpSession;
//!
//! let stream = std::net::TcpStream::connect("127.0.0.1:7000")?;
//! let session = TcpSession::new(
//!     ScopedFd::from(stream),
//!     Box::new(|session, data| {
//!         // Echo whatever the peer sends.
//!         session.send(StreamBuffer::from(data));
//!     }),
//! )?;
//! session.send(StreamBuffer::from(b"HELLO"));
//! # Ok::<(), poseidon::error::Error>(())
//! ```

use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::buffer::StreamBuffer;
use crate::epoll::EpollHandle;
use crate::error::Error;
use crate::raw::{self, ScopedFd};

/// Callback fed with bytes as they arrive from the peer
///
/// Invoked on the event thread. Implementations parse frames and hand work
/// off, typically by resolving a servlet and pending a job; they must not
/// block the event loop.
pub type SessionHandler = Box<dyn Fn(&Arc<TcpSession>, &[u8]) + Send + Sync>;

const ACTIVE: u8 = 0;
const HALF_CLOSED: u8 = 1;
const CLOSED: u8 = 2;

/// Paths to a PEM certificate chain and private key for server-side TLS
#[derive(Debug, Clone)]
pub struct SslCredentials {
    /// PEM file holding the certificate chain
    pub cert_chain: PathBuf,
    /// PEM file holding the private key
    pub private_key: PathBuf,
}

impl SslCredentials {
    /// Bundles the two paths
    pub fn new(cert_chain: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            cert_chain: cert_chain.into(),
            private_key: private_key.into(),
        }
    }
}

/// A live TCP connection with user-defined receive handling
///
/// Held jointly by the event loop's registered set and by any pending job
/// that upgraded a weak handle; destroyed when the last strong reference
/// drops, which closes the socket.
pub struct TcpSession {
    socket: ScopedFd,
    remote_ip: Arc<str>,
    state: AtomicU8,
    send_buffer: Mutex<StreamBuffer>,
    ssl: OnceLock<Mutex<SslFilter>>,
    handler: SessionHandler,
    epoll: OnceLock<EpollHandle>,
}

impl TcpSession {
    /// Wraps a connected socket into a session
    ///
    /// Puts the socket into non-blocking mode and resolves the peer address.
    /// Sockets whose peer is neither IPv4 nor IPv6 are rejected with a
    /// protocol error.
    pub fn new(socket: ScopedFd, handler: SessionHandler) -> crate::Result<Arc<Self>> {
        raw::set_nonblocking(socket.as_raw(), true)?;
        let remote_ip: Arc<str> = raw::peer_ip(socket.as_raw())?.into();
        log::info!("created TCP peer, remote IP = {remote_ip}");
        Ok(Arc::new(Self {
            socket,
            remote_ip,
            state: AtomicU8::new(ACTIVE),
            send_buffer: Mutex::new(StreamBuffer::new()),
            ssl: OnceLock::new(),
            handler,
            epoll: OnceLock::new(),
        }))
    }

    /// Textual address of the peer, fixed at construction
    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    /// Whether a shutdown has been signalled on this session
    pub fn has_been_shutdown(&self) -> bool {
        self.state.load(Ordering::Acquire) != ACTIVE
    }

    /// Queues bytes for delivery to the peer
    ///
    /// Returns `false` without touching the buffer when shutdown was already
    /// signalled. Thread-safe; the buffer mutex is held only for the splice.
    pub fn send(&self, mut buffer: StreamBuffer) -> bool {
        if self.has_been_shutdown() {
            log::debug!(
                "attempting to send data on a closed socket, remote IP = {}",
                self.remote_ip
            );
            return false;
        }
        {
            let mut pending = self.send_buffer.lock().unwrap();
            pending.splice(&mut buffer);
        }
        self.touch();
        true
    }

    /// Signals shutdown and half-closes the read side
    ///
    /// Returns `true` for exactly one caller, the one whose call performed
    /// the transition. Bytes already queued keep draining to the peer.
    pub fn shutdown(&self) -> bool {
        let won = self
            .state
            .compare_exchange(ACTIVE, HALF_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        raw::shutdown_read(self.socket.as_raw());
        self.touch();
        won
    }

    /// Like [`shutdown`](Self::shutdown), but the winning caller first queues
    /// a final payload
    pub fn shutdown_with(&self, mut buffer: StreamBuffer) -> bool {
        let won = self
            .state
            .compare_exchange(ACTIVE, HALF_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            let mut pending = self.send_buffer.lock().unwrap();
            pending.splice(&mut buffer);
        }
        raw::shutdown_read(self.socket.as_raw());
        self.touch();
        won
    }

    /// Closes both directions immediately, discarding queued outbound bytes
    ///
    /// Returns `true` iff this call performed the shutdown transition.
    pub fn force_shutdown(&self) -> bool {
        let prev = self.state.swap(CLOSED, Ordering::AcqRel);
        raw::shutdown_both(self.socket.as_raw());
        self.send_buffer.lock().unwrap().clear();
        self.touch();
        prev == ACTIVE
    }

    /// Upgrades the session to client-side TLS
    ///
    /// Builds a TLS client with permissive certificate verification (user
    /// callbacks may enforce their own policy above this layer) and performs
    /// the handshake before returning. Must be called before the session is
    /// registered with the event loop.
    pub fn init_ssl_client(&self) -> crate::Result<()> {
        let mut filter = SslFilter::client(&self.remote_ip)?;
        filter.handshake(self.socket.as_raw())?;
        self.install_ssl(filter)
    }

    /// Upgrades the session to server-side TLS
    ///
    /// Loads the PEM certificate chain and private key, then performs the
    /// handshake before returning. Must be called before the session is
    /// registered with the event loop.
    pub fn init_ssl_server(&self, credentials: &SslCredentials) -> crate::Result<()> {
        let mut filter = SslFilter::server(credentials)?;
        filter.handshake(self.socket.as_raw())?;
        self.install_ssl(filter)
    }

    fn install_ssl(&self, filter: SslFilter) -> crate::Result<()> {
        self.ssl
            .set(Mutex::new(filter))
            .map_err(|_| Error::Protocol("TLS already initialized for this session".into()))
    }

    fn touch(&self) {
        if let Some(epoll) = self.epoll.get() {
            epoll.touch_fd(self.socket.as_raw());
        }
    }

    /// Completes a half-closed shutdown once the send buffer has drained:
    /// the write side shuts so the peer observes EOF.
    pub(crate) fn finish_shutdown(&self) {
        self.state.store(CLOSED, Ordering::Release);
        raw::shutdown_both(self.socket.as_raw());
    }

    pub(crate) fn attach_epoll(&self, handle: EpollHandle) {
        let _ = self.epoll.set(handle);
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.socket.as_raw()
    }

    pub(crate) fn pending_out_len(&self) -> usize {
        self.send_buffer.lock().unwrap().len()
    }

    pub(crate) fn handle_receive(self: &Arc<Self>, data: &[u8]) {
        (self.handler)(self, data);
    }

    /// Reads from the socket, through TLS when enabled
    ///
    /// Returns 0 on peer close; `WouldBlock` when nothing is available.
    pub(crate) fn do_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.ssl.get() {
            Some(ssl) => ssl.lock().unwrap().read(self.socket.as_raw(), buf),
            None => raw::recv_nosignal(self.socket.as_raw(), buf),
        }
    }

    /// Writes the next slice of the send buffer to the socket
    ///
    /// Peeks into `hint` under the buffer lock, releases the lock for the
    /// syscall, then reacquires it only to discard what was written. Returns
    /// 0 once the buffer is empty.
    pub(crate) fn do_write(&self, hint: &mut [u8]) -> io::Result<usize> {
        let size = self.send_buffer.lock().unwrap().peek(hint);
        if size == 0 {
            return Ok(0);
        }
        let written = match self.ssl.get() {
            Some(ssl) => ssl.lock().unwrap().write(self.socket.as_raw(), &hint[..size]),
            None => raw::send_nosignal(self.socket.as_raw(), &hint[..size]),
        }?;
        if written > 0 {
            self.send_buffer.lock().unwrap().discard(written);
        }
        Ok(written)
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        log::info!("destroyed TCP peer, remote IP = {}", self.remote_ip);
    }
}

impl std::fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSession")
            .field("fd", &self.socket.as_raw())
            .field("remote_ip", &self.remote_ip)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

/// TLS record filter layered between the session and its socket.
///
/// rustls is sans-io; this filter pumps its record buffers against the raw fd
/// so the session's read/write drivers keep their plain byte-stream shape.
struct SslFilter {
    conn: rustls::Connection,
}

/// Adapts a raw fd to `io::Read`/`io::Write` for the rustls record pump.
struct FdIo(RawFd);

impl io::Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        raw::recv_nosignal(self.0, buf)
    }
}

impl io::Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        raw::send_nosignal(self.0, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SslFilter {
    fn client(server_name: &str) -> crate::Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::PermissiveVerifier::new(provider)))
            .with_no_client_auth();
        let name = rustls::pki_types::ServerName::try_from(server_name.to_owned())
            .map_err(|e| Error::Protocol(format!("invalid TLS server name: {e}")))?;
        let conn = rustls::ClientConnection::new(Arc::new(config), name)?;
        Ok(Self { conn: conn.into() })
    }

    fn server(credentials: &SslCredentials) -> crate::Result<Self> {
        let certs = rustls_pemfile::certs(&mut io::BufReader::new(std::fs::File::open(
            &credentials.cert_chain,
        )?))
        .collect::<Result<Vec<_>, _>>()?;
        let key = rustls_pemfile::private_key(&mut io::BufReader::new(std::fs::File::open(
            &credentials.private_key,
        )?))?
        .ok_or_else(|| {
            Error::Protocol(format!(
                "no private key found in {}",
                credentials.private_key.display()
            ))
        })?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        let conn = rustls::ServerConnection::new(Arc::new(config))?;
        Ok(Self { conn: conn.into() })
    }

    /// Runs the handshake to completion with the fd temporarily blocking
    fn handshake(&mut self, fd: RawFd) -> crate::Result<()> {
        raw::set_nonblocking(fd, false)?;
        let result = self.handshake_blocking(fd);
        let _ = raw::set_nonblocking(fd, true);
        result
    }

    fn handshake_blocking(&mut self, fd: RawFd) -> crate::Result<()> {
        let mut sock = FdIo(fd);
        while self.conn.is_handshaking() {
            while self.conn.wants_write() {
                self.conn.write_tls(&mut sock)?;
            }
            if self.conn.is_handshaking() && self.conn.wants_read() {
                if self.conn.read_tls(&mut sock)? == 0 {
                    return Err(Error::Protocol("peer closed during TLS handshake".into()));
                }
                self.conn.process_new_packets().map_err(Error::Tls)?;
            }
        }
        while self.conn.wants_write() {
            self.conn.write_tls(&mut sock)?;
        }
        Ok(())
    }

    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        use io::Read;
        let mut sock = FdIo(fd);
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No plaintext buffered; pull more records off the wire.
                    if self.conn.read_tls(&mut sock)? == 0 {
                        return Ok(0);
                    }
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&mut self, fd: RawFd, data: &[u8]) -> io::Result<usize> {
        use io::Write;
        let mut sock = FdIo(fd);
        let n = self.conn.writer().write(data)?;
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(n)
    }
}

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate; policy belongs to the layer above.
    #[derive(Debug)]
    pub(super) struct PermissiveVerifier {
        provider: Arc<CryptoProvider>,
    }

    impl PermissiveVerifier {
        pub(super) fn new(provider: Arc<CryptoProvider>) -> Self {
            Self { provider }
        }
    }

    impl ServerCertVerifier for PermissiveVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
