use std::fmt;
use std::io;
use std::net::Shutdown;
use std::time::Instant;

use crate::addr::VsockAddr;
use crate::fd::{ConnFd, SysConnFd};

/// One accepted vsock stream connection.
///
/// Reads, writes and shutdowns take `&self`, so one task can read while
/// another writes or half-closes the connection.
pub struct Conn<C: ConnFd = SysConnFd> {
  fd: C,
  local: VsockAddr,
  remote: VsockAddr,
}

impl<C: ConnFd> Conn<C> {
  pub fn new(fd: C, local: VsockAddr, remote: VsockAddr) -> Self {
    Self { fd, local, remote }
  }

  pub fn local_addr(&self) -> VsockAddr {
    self.local
  }

  pub fn peer_addr(&self) -> VsockAddr {
    self.remote
  }

  /// Reads into `buf`, waiting until data, end of stream, close or the read
  /// deadline. `Ok(0)` means the peer closed its write half.
  pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
    self.fd.read(buf).await
  }

  pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
    self.fd.write(buf).await
  }

  pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
      match self.write(buf).await? {
        0 => return Err(io::ErrorKind::WriteZero.into()),
        n => buf = &buf[n..],
      }
    }
    Ok(())
  }

  /// Shuts down one or both halves.
  ///
  /// Safe while other tasks are blocked on this connection.
  pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
    self.fd.shutdown(how)
  }

  pub fn close_read(&self) -> io::Result<()> {
    self.shutdown(Shutdown::Read)
  }

  /// Signals end of stream to the peer. Reading stays possible.
  pub fn close_write(&self) -> io::Result<()> {
    self.shutdown(Shutdown::Write)
  }

  pub fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.fd.set_deadline(deadline)
  }

  pub fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.fd.set_read_deadline(deadline)
  }

  pub fn set_write_deadline(
    &self,
    deadline: Option<Instant>,
  ) -> io::Result<()> {
    self.fd.set_write_deadline(deadline)
  }

  pub fn close(&self) -> io::Result<()> {
    self.fd.close()
  }

  pub fn get_ref(&self) -> &C {
    &self.fd
  }
}

impl<C: ConnFd> fmt::Debug for Conn<C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Conn")
      .field("local", &self.local)
      .field("remote", &self.remote)
      .finish_non_exhaustive()
  }
}
