//! # Poseidon - Server Application Framework Core
//!
//! Poseidon is the concurrency and I/O substrate of a server-application
//! framework for long-running network services. It ties together an
//! event-driven TCP session engine built on a readiness notifier, a
//! write-back persistence daemon that serializes object saves and loads
//! against a relational store, and a servlet registry that dispatches
//! protocol requests to user callbacks under lifetime-safe references.
//!
//! ## Key Features
//!
//! - **Readiness-Based Session Engine**: one event thread multiplexes every
//!   registered TCP session over `mio` (epoll/kqueue)
//! - **Thread-Safe Send Path**: chunked buffers spliced in O(1) under a
//!   per-session mutex that is never held across a syscall
//! - **Optional TLS**: client and server session upgrades via `rustls`
//! - **Write-Back Persistence**: saves deferred and coalesced per object,
//!   newest request wins; loads completed back onto the main thread
//! - **Lifetime-Safe Dispatch**: servlets resolve through weak references so
//!   an unloaded module can never be called into
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use poseidon::buffer::StreamBuffer;
//! use poseidon::epoll::EpollDaemon;
//! use poseidon::job::JobQueue;
//! use poseidon::server::TcpServer;
//! use poseidon::session::TcpSession;
//!
//! fn main() -> std::io::Result<()> {
//!     let jobs = std::sync::Arc::new(JobQueue::new());
//!     let daemon = EpollDaemon::start(Duration::from_millis(100))?;
//!
//!     let _server = TcpServer::bind(
//!         "0.0.0.0:7000".parse().unwrap(),
//!         daemon.handle().clone(),
//!         None,
//!         Box::new(|socket| {
//!             TcpSession::new(
//!                 socket,
//!                 Box::new(|session, data| {
//!                     // Protocol parsing lives above this layer; echo for brevity.
//!                     session.send(StreamBuffer::from(data));
//!                 }),
//!             )
//!         }),
//!     )?;
//!
//!     loop {
//!         jobs.wait_and_perform(Duration::from_millis(100));
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`buffer`]: chunked FIFO byte buffer with splice/peek/discard semantics
//! - [`epoll`]: readiness event loop owning all registered sessions
//! - [`session`]: per-connection duplex pipe with shutdown state machine and TLS
//! - [`server`]: listening acceptor producing sessions via a user factory
//! - [`job`]: deferred callback queue drained on the main thread
//! - [`mysql`]: write-back persistence daemon with save coalescing
//! - [`servlet`]: URI to weak-callback registries, one per protocol
//! - [`config`]: read-only key lookup with default fallback
//! - [`raw`]: fd ownership and low-level socket operations
//! - [`error`]: tagged error kinds shared across the core
//! - [`logtag`]: per-thread subsystem tags for the `log` facade
//!
//! ## Threading Model
//!
//! Four kinds of threads cooperate: the main thread drains the [`job`] queue
//! and runs user callbacks; the [`epoll`] thread owns per-session I/O; the
//! [`mysql`] worker owns the database connection; each [`server`] runs one
//! accept thread. Every blocking wait in the core is bounded, so stop
//! requests are observed within a second in the worst case.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

/// Chunked FIFO byte buffer with splice/peek/discard semantics
pub mod buffer;
/// Read-only configuration oracle with typed default-fallback lookup
pub mod config;
/// Readiness event loop owning every registered session
pub mod epoll;
/// Tagged error kinds shared across the core
pub mod error;
/// Deferred callback queue drained on the main thread
pub mod job;
/// Per-thread subsystem tags for the `log` facade
pub mod logtag;
/// Write-back persistence daemon with save coalescing
pub mod mysql;
/// Low-level fd ownership and socket operations
pub mod raw;
/// Listening socket acceptor producing sessions via a user factory
pub mod server;
/// URI-keyed callback registries with lifetime-safe dispatch
pub mod servlet;
/// Per-connection duplex byte pipe with optional TLS
pub mod session;

pub use buffer::StreamBuffer;
pub use config::Config;
pub use epoll::{EpollDaemon, EpollHandle};
pub use error::{Error, MySqlError, Result};
pub use job::JobQueue;
pub use logtag::{set_thread_tag, thread_tag, LogTag};
pub use mysql::{ConnectionSettings, MySqlConnector, MySqlDaemon, MySqlObject};
pub use raw::ScopedFd;
pub use server::{SessionFactory, TcpServer};
pub use servlet::{Servlet, ServletRegistry};
pub use session::{SessionHandler, SslCredentials, TcpSession};
