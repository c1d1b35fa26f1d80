//! Wakes the reactor thread out of `epoll_wait`.
//!
//! A non-blocking pipe: writers push a byte, the reactor drains the read end
//! whenever it fires.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Special key used to identify notification events
pub(crate) const NOTIFY_KEY: u64 = u64::MAX;

pub(crate) struct Notifier {
  read_fd: OwnedFd,
  write_fd: OwnedFd,
}

impl Notifier {
  pub(crate) fn new() -> io::Result<Self> {
    let mut fds = [0i32; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;

    // SAFETY: pipe2 succeeded, both descriptors are ours.
    Ok(Self {
      read_fd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
      write_fd: unsafe { OwnedFd::from_raw_fd(fds[1]) },
    })
  }

  pub(crate) fn read_fd(&self) -> RawFd {
    self.read_fd.as_raw_fd()
  }

  pub(crate) fn notify(&self) -> io::Result<()> {
    let byte: u8 = 1;
    let result = syscall!(write(
      self.write_fd.as_raw_fd(),
      &byte as *const u8 as *const libc::c_void,
      1,
    ));

    match result {
      // A full pipe already guarantees a wakeup.
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      other => other.map(drop),
    }
  }

  /// Empties the pipe so the level-triggered registration goes quiet.
  pub(crate) fn drain(&self) {
    let mut buf = [0u8; 64];
    loop {
      let res = syscall!(read(
        self.read_fd.as_raw_fd(),
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
      ));
      match res {
        Ok(n) if n as usize == buf.len() => continue,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        _ => return,
      }
    }
  }
}
