use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, ptr};

/// Interest flags for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
  Read,
  Write,
  ReadAndWrite,
}

impl Interest {
  pub(crate) fn from_waiters(read: bool, write: bool) -> Option<Self> {
    match (read, write) {
      (true, true) => Some(Self::ReadAndWrite),
      (true, false) => Some(Self::Read),
      (false, true) => Some(Self::Write),
      (false, false) => None,
    }
  }

  fn bits(self) -> u32 {
    let mut events = 0u32;
    if matches!(self, Self::Read | Self::ReadAndWrite) {
      events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if matches!(self, Self::Write | Self::ReadAndWrite) {
      events |= libc::EPOLLOUT as u32;
    }
    // One wakeup per arm; waiters re-arm when they go back to sleep.
    events | libc::EPOLLONESHOT as u32
  }
}

/// Readiness reported for one registration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
  pub key: u64,
  pub readable: bool,
  pub writable: bool,
}

impl Event {
  fn from_native(event: &libc::epoll_event) -> Self {
    // Copy out of the (possibly packed) struct before looking at the fields.
    let bits = event.events;
    let key = event.u64;
    // Errors and hangups wake both sides so the next syscall reports them.
    let failed = bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
    Self {
      key,
      readable: failed || bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0,
      writable: failed || bits & libc::EPOLLOUT as u32 != 0,
    }
  }
}

/// Wrapper around an epoll file descriptor.
pub(crate) struct Epoll {
  fd: OwnedFd,
}

impl Epoll {
  pub(crate) fn new() -> io::Result<Self> {
    let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
    // SAFETY: epoll_create1 just returned this descriptor to us.
    Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
  }

  /// Registers `fd`. Not idempotent.
  pub(crate) fn add(
    &self,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_ADD, fd, key, interest.bits())
  }

  /// Re-arms an already registered `fd`.
  pub(crate) fn modify(
    &self,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_MOD, fd, key, interest.bits())
  }

  /// Registers the notifier pipe. It stays armed for the reactor's lifetime.
  pub(crate) fn add_notifier(&self, fd: RawFd, key: u64) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_ADD, fd, key, libc::EPOLLIN as u32)
  }

  pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
    // For EPOLL_CTL_DEL, event pointer can be NULL in Linux 2.6.9+
    syscall!(epoll_ctl(
      self.fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut(),
    ))
    .map(drop)
  }

  fn ctl(&self, op: i32, fd: RawFd, key: u64, events: u32) -> io::Result<()> {
    let mut event = libc::epoll_event { events, u64: key };
    syscall!(epoll_ctl(
      self.fd.as_raw_fd(),
      op,
      fd,
      &mut event as *mut libc::epoll_event,
    ))
    .map(drop)
  }

  /// Waits for events and replaces the contents of `events` with them.
  pub(crate) fn wait(
    &self,
    events: &mut Vec<libc::epoll_event>,
    timeout: Option<Duration>,
  ) -> io::Result<()> {
    // Round up so we never wake just short of a deadline and spin.
    let timeout_ms = match timeout {
      Some(d) => {
        let ms = d.as_nanos().div_ceil(1_000_000);
        if ms > i32::MAX as u128 { i32::MAX } else { ms as i32 }
      }
      None => -1,
    };

    events.clear();
    let n = syscall!(epoll_wait(
      self.fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.capacity() as i32,
      timeout_ms,
    ))? as usize;

    assert!(
      n <= events.capacity(),
      "epoll_wait returned more events ({}) than buffer size ({})",
      n,
      events.capacity()
    );
    // SAFETY: the kernel initialised the first `n` entries.
    unsafe { events.set_len(n) };
    Ok(())
  }

  pub(crate) fn events(events: &[libc::epoll_event]) -> impl Iterator<Item = Event> + '_ {
    events.iter().map(Event::from_native)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use std::os::unix::net::UnixStream;

  #[test]
  fn read_interest_fires_once_data_arrives() {
    let epoll = Epoll::new().unwrap();
    let (a, mut b) = UnixStream::pair().unwrap();
    let mut events = Vec::with_capacity(8);

    epoll.add(a.as_raw_fd(), 7, Interest::Read).unwrap();
    epoll.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
    assert!(events.is_empty());

    b.write_all(b"hi").unwrap();
    epoll.wait(&mut events, Some(Duration::from_millis(100))).unwrap();
    let fired: Vec<_> = Epoll::events(&events).collect();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].key, 7);
    assert!(fired[0].readable);
  }

  #[test]
  fn oneshot_needs_rearm() {
    let epoll = Epoll::new().unwrap();
    let (a, mut b) = UnixStream::pair().unwrap();
    let mut events = Vec::with_capacity(8);
    b.write_all(b"x").unwrap();

    epoll.add(a.as_raw_fd(), 1, Interest::Read).unwrap();
    epoll.wait(&mut events, Some(Duration::from_millis(100))).unwrap();
    assert_eq!(events.len(), 1);

    // Still readable, but disarmed until modified.
    epoll.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
    assert!(events.is_empty());

    epoll.modify(a.as_raw_fd(), 1, Interest::Read).unwrap();
    epoll.wait(&mut events, Some(Duration::from_millis(100))).unwrap();
    assert_eq!(events.len(), 1);

    epoll.delete(a.as_raw_fd()).unwrap();
  }

  #[test]
  fn hangup_wakes_both_directions() {
    let epoll = Epoll::new().unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    let mut events = Vec::with_capacity(8);

    epoll.add(a.as_raw_fd(), 3, Interest::Read).unwrap();
    drop(b);
    epoll.wait(&mut events, Some(Duration::from_millis(100))).unwrap();
    let fired: Vec<_> = Epoll::events(&events).collect();
    assert_eq!(fired.len(), 1);
    assert!(fired[0].readable && fired[0].writable);
  }
}
