use std::io;
use std::mem;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use super::{ConnFd, Descriptor, ListenFd, PollFd, RawConn, accept_on};
use crate::addr::VsockAddr;
use crate::error::closed;

const CONN_NAME: &str = "vsock-conn";

/// A kernel `AF_VSOCK` stream socket used for listening.
///
/// Blocking until [`ListenFd::set_nonblocking`] hands it to the reactor.
#[derive(Debug)]
pub struct SysListenFd {
  raw: Mutex<Option<OwnedFd>>,
  poll: Option<PollFd>,
}

impl SysListenFd {
  /// Creates a close-on-exec `AF_VSOCK` stream socket.
  pub fn new() -> io::Result<Self> {
    let fd = syscall!(socket(
      libc::AF_VSOCK,
      libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
      0
    ))?;
    // SAFETY: socket(2) just returned this descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(Self { raw: Mutex::new(Some(fd)), poll: None })
  }

  fn with_fd<R>(&self, f: impl FnOnce(RawFd) -> io::Result<R>) -> io::Result<R> {
    if let Some(poll) = &self.poll {
      return poll.control(f);
    }
    let raw = self.raw.lock().unwrap_or_else(PoisonError::into_inner);
    match raw.as_ref() {
      Some(fd) => f(fd.as_raw_fd()),
      None => Err(closed()),
    }
  }

  fn poll(&self) -> io::Result<&PollFd> {
    match &self.poll {
      Some(poll) => Ok(poll),
      None if self.is_open() => Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "vsock listener is not in non-blocking mode",
      )),
      None => Err(closed()),
    }
  }

  fn is_open(&self) -> bool {
    self.raw.lock().unwrap_or_else(PoisonError::into_inner).is_some()
  }
}

impl Descriptor for SysListenFd {
  fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.poll()?.set_deadline(deadline)
  }

  fn close(&self) -> io::Result<()> {
    if let Some(poll) = &self.poll {
      return poll.close();
    }
    let fd = self.raw.lock().unwrap_or_else(PoisonError::into_inner).take();
    match fd {
      Some(fd) => syscall!(close(fd.into_raw_fd())).map(drop),
      None => Err(closed()),
    }
  }
}

impl ListenFd for SysListenFd {
  type Conn = SysConnFd;

  fn bind(&self, addr: VsockAddr) -> io::Result<()> {
    let sa = addr.to_sockaddr();
    self.with_fd(|fd| {
      syscall!(bind(
        fd,
        &sa as *const libc::sockaddr_vm as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
      ))
      .map(drop)
    })
  }

  fn listen(&self, backlog: i32) -> io::Result<()> {
    self.with_fd(|fd| syscall!(listen(fd, backlog)).map(drop))
  }

  fn local_addr(&self) -> io::Result<VsockAddr> {
    self.with_fd(|fd| {
      // SAFETY: all-zero is a valid sockaddr_storage.
      let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
      let mut len = mem::size_of_val(&storage) as libc::socklen_t;
      syscall!(getsockname(
        fd,
        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut len,
      ))?;
      VsockAddr::from_storage(&storage)
    })
  }

  fn set_nonblocking(&mut self, name: &'static str) -> io::Result<()> {
    if self.poll.is_some() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "vsock listener is already non-blocking",
      ));
    }
    let raw = self.raw.get_mut().unwrap_or_else(PoisonError::into_inner);
    let Some(fd) = raw.take() else {
      return Err(closed());
    };
    if let Err(err) = set_nonblocking(fd.as_raw_fd()) {
      // Keep it so the caller's close releases it.
      *raw = Some(fd);
      return Err(err);
    }
    self.poll = Some(PollFd::new(fd, name)?);
    Ok(())
  }

  async fn accept(&self, flags: i32) -> io::Result<(SysConnFd, VsockAddr)> {
    let poll = self.poll()?;
    let (fd, remote) = accept_on(poll, |fd| accept4(fd, flags)).await?;
    Ok((SysConnFd::new(fd)?, remote))
  }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
  let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
  syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map(drop)
}

fn accept4(fd: RawFd, flags: i32) -> io::Result<(OwnedFd, VsockAddr)> {
  // SAFETY: all-zero is a valid sockaddr_storage.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of_val(&storage) as libc::socklen_t;
  let conn = syscall!(accept4(
    fd,
    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
    &mut len,
    flags,
  ))?;
  // SAFETY: accept4(2) just returned this descriptor.
  let conn = unsafe { OwnedFd::from_raw_fd(conn) };
  Ok((conn, VsockAddr::from_storage(&storage)?))
}

/// A connected stream socket driven by the reactor.
///
/// Works for any stream socket family; the listener uses it for accepted
/// `AF_VSOCK` connections.
#[derive(Debug)]
pub struct SysConnFd {
  poll: PollFd,
}

impl SysConnFd {
  /// Wraps `fd`, which must already be in non-blocking mode.
  pub fn new(fd: OwnedFd) -> io::Result<Self> {
    Ok(Self { poll: PollFd::new(fd, CONN_NAME)? })
  }
}

impl Descriptor for SysConnFd {
  fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.poll.set_deadline(deadline)
  }

  fn close(&self) -> io::Result<()> {
    self.poll.close()
  }
}

impl ConnFd for SysConnFd {
  async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
    self
      .poll
      .read_with(|fd| {
        syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()))
          .map(|n| n as usize)
      })
      .await
  }

  async fn write(&self, buf: &[u8]) -> io::Result<usize> {
    self
      .poll
      .write_with(|fd| {
        // MSG_NOSIGNAL: a reset peer is an EPIPE error, not a SIGPIPE.
        syscall!(send(
          fd,
          buf.as_ptr() as *const libc::c_void,
          buf.len(),
          libc::MSG_NOSIGNAL
        ))
        .map(|n| n as usize)
      })
      .await
  }

  fn shutdown(&self, how: Shutdown) -> io::Result<()> {
    let how = match how {
      Shutdown::Read => libc::SHUT_RD,
      Shutdown::Write => libc::SHUT_WR,
      Shutdown::Both => libc::SHUT_RDWR,
    };
    self.poll.control(|fd| syscall!(shutdown(fd, how)).map(drop))
  }

  fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.poll.set_read_deadline(deadline)
  }

  fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.poll.set_write_deadline(deadline)
  }
}
