//! Descriptor capabilities.
//!
//! A listener and its connections are generic over these traits so that the
//! setup and accept logic can be driven by fakes as well as by real kernel
//! descriptors ([`SysListenFd`], [`SysConnFd`]).

mod poll;
mod sys;

use std::io;
use std::net::Shutdown;
use std::os::fd::RawFd;
use std::time::Instant;

use crate::addr::VsockAddr;

pub use self::poll::PollFd;
pub use self::sys::{SysConnFd, SysListenFd};

/// Operations every descriptor wrapper supports.
pub trait Descriptor: Send + Sync {
  /// Sets an absolute deadline for every blocked and future operation.
  /// `None` clears it.
  fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

  /// Releases the descriptor. Operations blocked on it fail with the closed
  /// error, and so does a second close.
  fn close(&self) -> io::Result<()>;
}

/// A listening descriptor.
///
/// `bind`, `listen` and `local_addr` run once each, in that order, while the
/// descriptor is still blocking. [`set_nonblocking`](Self::set_nonblocking)
/// ends setup; only `accept`, `set_deadline` and `close` are used after it.
pub trait ListenFd: Descriptor {
  type Conn: ConnFd;

  fn bind(&self, addr: VsockAddr) -> io::Result<()>;

  fn listen(&self, backlog: i32) -> io::Result<()>;

  fn local_addr(&self) -> io::Result<VsockAddr>;

  /// Switches to non-blocking mode and registers with the reactor. `name`
  /// only shows up in diagnostics.
  ///
  /// On failure the descriptor is unusable and must be closed.
  fn set_nonblocking(&mut self, name: &'static str) -> io::Result<()>;

  /// Waits for the next connection. `flags` are `accept4(2)` flags for the
  /// new descriptor.
  fn accept(
    &self,
    flags: i32,
  ) -> impl Future<Output = io::Result<(Self::Conn, VsockAddr)>> + Send;

  /// Close used while setup is still in progress.
  fn early_close(&mut self) -> io::Result<()> {
    self.close()
  }
}

/// A connected stream descriptor.
pub trait ConnFd: Descriptor {
  fn read(
    &self,
    buf: &mut [u8],
  ) -> impl Future<Output = io::Result<usize>> + Send;

  fn write(&self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

  fn shutdown(&self, how: Shutdown) -> io::Result<()>;

  fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

  fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;
}

/// Readiness-aware access to a raw descriptor.
///
/// The closures run with the descriptor borrowed; it cannot be closed (and
/// its number reused) until they return. A closure returning
/// [`io::ErrorKind::WouldBlock`] parks the task until the descriptor becomes
/// ready again, and is then retried.
pub trait RawConn: Send + Sync {
  fn read_with<R, F>(
    &self,
    f: F,
  ) -> impl Future<Output = io::Result<R>> + Send
  where
    R: Send,
    F: FnMut(RawFd) -> io::Result<R> + Send;

  fn write_with<R, F>(
    &self,
    f: F,
  ) -> impl Future<Output = io::Result<R>> + Send
  where
    R: Send,
    F: FnMut(RawFd) -> io::Result<R> + Send;

  /// Runs `f` once, without waiting for readiness.
  fn control<R, F>(&self, f: F) -> io::Result<R>
  where
    F: FnOnce(RawFd) -> io::Result<R>;
}

/// Whether an `accept(2)` failure should be retried instead of reported.
///
/// Only "no connection yet" (`EAGAIN`/`EWOULDBLOCK`) and "peer gave up before
/// we accepted" (`ECONNABORTED`) qualify.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::WouldBlock
    || err.raw_os_error() == Some(libc::ECONNABORTED)
}

/// Runs `accept` against `conn` until it produces a connection or fails with
/// a non-transient error.
///
/// Transient failures park the task until the listening descriptor is
/// readable again. Close and deadline errors come from `conn`.
pub async fn accept_on<C, T, F>(conn: &C, mut accept: F) -> io::Result<T>
where
  C: RawConn,
  T: Send,
  F: FnMut(RawFd) -> io::Result<T> + Send,
{
  conn
    .read_with(move |fd| match accept(fd) {
      Err(err) if is_transient_accept_error(&err) => {
        tracing::trace!(errno = err.raw_os_error(), "transient accept error");
        Err(io::ErrorKind::WouldBlock.into())
      }
      res => res,
    })
    .await
}
