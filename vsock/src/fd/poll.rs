use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Instant;

use super::RawConn;
use crate::error::closed;
use crate::reactor::{Direction, Reactor, ScheduledIo};

/// A non-blocking descriptor registered with the reactor.
///
/// Syscalls borrow the descriptor under a read lock; [`close`](Self::close)
/// takes it out under the write lock. A closed `PollFd` never hands out its
/// old descriptor number, and every waiting task is woken with the closed
/// error.
pub struct PollFd {
  fd: RwLock<Option<OwnedFd>>,
  io: Arc<ScheduledIo>,
  reactor: &'static Reactor,
  name: &'static str,
}

impl PollFd {
  /// Wraps `fd`, which must already be in non-blocking mode.
  ///
  /// Starts the reactor thread on first use. `name` only appears in
  /// diagnostics.
  pub fn new(fd: OwnedFd, name: &'static str) -> io::Result<Self> {
    let reactor = Reactor::get()?;
    let io = reactor.register(fd.as_raw_fd());
    tracing::trace!(fd = fd.as_raw_fd(), name, "registered descriptor");

    Ok(Self { fd: RwLock::new(Some(fd)), io, reactor, name })
  }

  fn fd(&self) -> RwLockReadGuard<'_, Option<OwnedFd>> {
    self.fd.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn attempt<R>(
    &self,
    f: &mut impl FnMut(RawFd) -> io::Result<R>,
  ) -> io::Result<R> {
    match self.fd().as_ref() {
      Some(fd) => f(fd.as_raw_fd()),
      None => Err(closed()),
    }
  }

  async fn io_with<R>(
    &self,
    dir: Direction,
    mut f: impl FnMut(RawFd) -> io::Result<R>,
  ) -> io::Result<R> {
    loop {
      self.io.check(dir)?;
      match self.attempt(&mut f) {
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          self.io.clear_ready(dir);
          self.reactor.ready(&self.io, dir).await?;
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        res => return res,
      }
    }
  }

  /// Deadline for both halves.
  pub fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.set_read_deadline(deadline)?;
    self.set_write_deadline(deadline)
  }

  pub fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.set_half_deadline(Direction::Read, deadline)
  }

  pub fn set_write_deadline(
    &self,
    deadline: Option<Instant>,
  ) -> io::Result<()> {
    self.set_half_deadline(Direction::Write, deadline)
  }

  fn set_half_deadline(
    &self,
    dir: Direction,
    deadline: Option<Instant>,
  ) -> io::Result<()> {
    if self.fd().is_none() {
      return Err(closed());
    }
    self.reactor.set_deadline(&self.io, dir, deadline);
    Ok(())
  }

  /// Closes the descriptor and wakes every task waiting on it.
  ///
  /// Fails with the closed error if it was already closed.
  pub fn close(&self) -> io::Result<()> {
    let fd = self.fd.write().unwrap_or_else(PoisonError::into_inner).take();
    let Some(fd) = fd else {
      return Err(closed());
    };

    // Out of epoll before the number can be reused.
    self.reactor.deregister(&self.io);
    tracing::trace!(fd = fd.as_raw_fd(), name = self.name, "closing descriptor");
    syscall!(close(fd.into_raw_fd())).map(drop)
  }
}

impl RawConn for PollFd {
  async fn read_with<R, F>(&self, f: F) -> io::Result<R>
  where
    R: Send,
    F: FnMut(RawFd) -> io::Result<R> + Send,
  {
    self.io_with(Direction::Read, f).await
  }

  async fn write_with<R, F>(&self, f: F) -> io::Result<R>
  where
    R: Send,
    F: FnMut(RawFd) -> io::Result<R> + Send,
  {
    self.io_with(Direction::Write, f).await
  }

  fn control<R, F>(&self, f: F) -> io::Result<R>
  where
    F: FnOnce(RawFd) -> io::Result<R>,
  {
    match self.fd().as_ref() {
      Some(fd) => f(fd.as_raw_fd()),
      None => Err(closed()),
    }
  }
}

impl Drop for PollFd {
  fn drop(&mut self) {
    let open = self.fd.get_mut().map_or(true, |fd| fd.is_some());
    if open {
      if let Err(err) = self.close() {
        tracing::debug!(%err, name = self.name, "error closing dropped descriptor");
      }
    }
  }
}

impl fmt::Debug for PollFd {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let fd = self.fd().as_ref().map(AsRawFd::as_raw_fd);
    f.debug_struct("PollFd").field("fd", &fd).field("name", &self.name).finish()
  }
}
