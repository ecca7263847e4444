//! Low-level fd ownership and socket operations
//!
//! Everything here is a thin, safe wrapper over `libc`. Data-path send and
//! receive go through these helpers rather than the standard library types so
//! the session layer gets `MSG_NOSIGNAL` semantics: a peer resetting the
//! connection mid-write must surface as `EPIPE`, never as a process-killing
//! `SIGPIPE`.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::Error;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::{IntoRawFd, RawFd};

        /// Exclusively owned file descriptor, closed on drop
        pub struct ScopedFd(RawFd);

        impl ScopedFd {
            /// Takes ownership of `fd`
            ///
            /// # Safety
            ///
            /// `fd` must be open and not owned elsewhere; the returned value
            /// closes it on drop.
            pub unsafe fn from_raw(fd: RawFd) -> Self {
                Self(fd)
            }

            /// Borrows the descriptor without transferring ownership
            pub fn as_raw(&self) -> RawFd {
                self.0
            }

            /// Releases ownership, returning the raw descriptor unclosed
            pub fn into_raw(self) -> RawFd {
                let fd = self.0;
                std::mem::forget(self);
                fd
            }
        }

        impl Drop for ScopedFd {
            fn drop(&mut self) {
                unsafe {
                    libc::close(self.0);
                }
            }
        }

        impl std::fmt::Debug for ScopedFd {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple("ScopedFd").field(&self.0).finish()
            }
        }

        impl From<std::net::TcpStream> for ScopedFd {
            fn from(stream: std::net::TcpStream) -> Self {
                Self(stream.into_raw_fd())
            }
        }

        /// Switches `O_NONBLOCK` on or off for `fd`
        pub fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                if flags < 0 { return Err(io::Error::last_os_error()); }
                let nb = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
                if libc::fcntl(fd, libc::F_SETFL, nb) != 0 { return Err(io::Error::last_os_error()); }
                Ok(())
            }
        }

        /// Half-closes the read side; failures (already shut, reset) are ignored
        pub fn shutdown_read(fd: RawFd) {
            unsafe { libc::shutdown(fd, libc::SHUT_RD); }
        }

        /// Shuts down both directions; failures are ignored
        pub fn shutdown_both(fd: RawFd) {
            unsafe { libc::shutdown(fd, libc::SHUT_RDWR); }
        }

        /// `recv` with `MSG_NOSIGNAL`; 0 means the peer closed
        pub fn recv_nosignal(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
            let n = unsafe {
                libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), libc::MSG_NOSIGNAL)
            };
            if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
        }

        /// `send` with `MSG_NOSIGNAL`
        pub fn send_nosignal(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
            let n = unsafe {
                libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), libc::MSG_NOSIGNAL)
            };
            if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
        }

        /// Textual peer address of a connected socket
        ///
        /// Accepts `AF_INET` and `AF_INET6`; any other family is a protocol
        /// error.
        pub fn peer_ip(fd: RawFd) -> Result<String, Error> {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let rc = unsafe {
                libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
            };
            if rc != 0 {
                return Err(Error::System(io::Error::last_os_error()));
            }
            match storage.ss_family as libc::c_int {
                libc::AF_INET => {
                    let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
                    Ok(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)).to_string())
                }
                libc::AF_INET6 => {
                    let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
                    Ok(Ipv6Addr::from(sin6.sin6_addr.s6_addr).to_string())
                }
                family => Err(Error::Protocol(format!("unknown address family: {family}"))),
            }
        }
    } else {
        compile_error!("poseidon requires a Unix platform: the session layer relies on epoll-class readiness and MSG_NOSIGNAL socket I/O");
    }
}
