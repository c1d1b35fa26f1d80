//! # vsock - readiness-driven `AF_VSOCK` stream listener
//!
//! This crate provides a listening socket and per-connection descriptors for
//! Linux VM sockets. VM sockets are stream sockets addressed by a context
//! identifier (which machine) and a port, instead of an IP address and port.
//!
//! ## Features
//! - **Strict setup**: a listener is only handed out after bind, listen,
//!   address resolution and the switch to non-blocking mode all succeeded.
//!   Failure at any step closes the descriptor.
//! - **Cancelable accept**: accept suspends the calling task on an epoll
//!   reactor, so [`Listener::close`] promptly unblocks it.
//! - **Deadlines**: absolute deadlines on listeners and connections.
//!
//! ## Platform support
//!
//! | Platform   | I/O Mechanism | Status        |
//! |------------|---------------|---------------|
//! | Linux      | epoll         | Yes           |
//! | Other      | -             | Not supported |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! async fn serve() -> std::io::Result<()> {
//!     // Port 0 lets the kernel pick a free port.
//!     let listener = vsock::Listener::bind(0)?;
//!     println!("listening on {}", listener.local_addr());
//!
//!     let conn = listener.accept().await?;
//!     let mut buf = vec![0u8; 1024];
//!     let n = conn.read(&mut buf).await?;
//!     conn.write_all(&buf[..n]).await?;
//!     conn.close_write()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Descriptor operations return [`std::io::Result`]. Listener construction
//! returns [`ListenError`], which names the setup step that failed and keeps
//! the kernel error as its source. Use [`is_closed`] and
//! [`is_deadline_exceeded`] to recognise the two errors this crate produces
//! itself.

#[cfg(not(linux))]
compile_error!("the vsock crate only supports Linux");

#[macro_use]
mod macros;

pub mod addr;
pub mod cid;
pub mod conn;
pub mod error;
pub mod fd;
pub mod listener;
mod reactor;

pub use addr::VsockAddr;
pub use cid::{ContextId, ContextIdError, ContextIdSource, DevVsock, FixedContextId};
pub use conn::Conn;
pub use error::{ListenError, is_closed, is_deadline_exceeded};
pub use listener::{LISTEN_BACKLOG, Listener};

/// Opens a stream listener on `port` of the local context identifier.
///
/// Shorthand for [`Listener::bind`]. A `port` of `0` or
/// [`VsockAddr::PORT_ANY`] asks the kernel to pick a free port.
pub fn listen(port: u32) -> Result<Listener, ListenError> {
  Listener::bind(port)
}
