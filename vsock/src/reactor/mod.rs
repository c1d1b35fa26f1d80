//! Readiness reactor.
//!
//! One epoll instance, driven by a background thread that is started on first
//! use. Descriptors register a [`ScheduledIo`]; tasks park their wakers on it
//! and the thread wakes them on readiness, on close and when a deadline
//! passes.

mod epoll;
mod notifier;
mod scheduled;

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

use self::epoll::Epoll;
use self::notifier::{NOTIFY_KEY, Notifier};
pub(crate) use self::scheduled::{Direction, ScheduledIo};

/// Future returned by [`Reactor::ready`].
///
/// Dropping it before it resolves unparks its waker, so an abandoned accept or
/// read leaves nothing behind on the descriptor.
pub(crate) struct Readiness<'a> {
  reactor: &'a Reactor,
  io: &'a ScheduledIo,
  dir: Direction,
  id: u64,
  parked: bool,
}

impl Future for Readiness<'_> {
  type Output = io::Result<()>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let poll = self.reactor.poll_ready(self.io, cx, self.dir, self.id);
    self.parked = poll.is_pending();
    poll
  }
}

impl Drop for Readiness<'_> {
  fn drop(&mut self) {
    if self.parked {
      self.io.forget_waiter(self.dir, self.id);
    }
  }
}

/// Capacity of the event buffer handed to `epoll_wait`.
const EVENTS_CAPACITY: usize = 256;

static REACTOR: OnceLock<Reactor> = OnceLock::new();
static STARTED: AtomicBool = AtomicBool::new(false);
static INIT: Mutex<()> = Mutex::new(());

pub(crate) struct Reactor {
  epoll: Epoll,
  notifier: Notifier,
  ios: Mutex<HashMap<u64, Arc<ScheduledIo>>>,
  next_key: AtomicU64,
}

impl Reactor {
  fn new() -> io::Result<Self> {
    let epoll = Epoll::new()?;
    let notifier = Notifier::new()?;
    epoll.add_notifier(notifier.read_fd(), NOTIFY_KEY)?;

    Ok(Self {
      epoll,
      notifier,
      ios: Mutex::new(HashMap::new()),
      next_key: AtomicU64::new(0),
    })
  }

  /// The process-wide reactor, starting its thread if needed.
  pub(crate) fn get() -> io::Result<&'static Reactor> {
    if let Some(reactor) = REACTOR.get() {
      if STARTED.load(Ordering::Acquire) {
        return Ok(reactor);
      }
    }

    let _init = INIT.lock().unwrap_or_else(PoisonError::into_inner);
    let reactor = match REACTOR.get() {
      Some(reactor) => reactor,
      None => {
        let reactor = Reactor::new()?;
        REACTOR.get_or_init(|| reactor)
      }
    };

    if !STARTED.load(Ordering::Acquire) {
      thread::Builder::new()
        .name("vsock-reactor".into())
        .spawn(move || reactor.run())?;
      STARTED.store(true, Ordering::Release);
    }
    Ok(reactor)
  }

  fn ios(&self) -> MutexGuard<'_, HashMap<u64, Arc<ScheduledIo>>> {
    self.ios.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Tracks `fd`. Nothing is added to epoll until a task waits on it.
  pub(crate) fn register(&self, fd: RawFd) -> Arc<ScheduledIo> {
    let key = self.next_key.fetch_add(1, Ordering::Relaxed);
    // NOTIFY_KEY is u64::MAX, which a counter never reaches in practice.
    debug_assert_ne!(key, NOTIFY_KEY);
    let io = Arc::new(ScheduledIo::new(key, fd));
    self.ios().insert(key, io.clone());
    io
  }

  /// Shuts the registration down and wakes everything parked on it.
  pub(crate) fn deregister(&self, io: &ScheduledIo) {
    let wakers = io.shutdown(&self.epoll);
    self.ios().remove(&io.key());
    wakers.into_iter().for_each(Waker::wake);
    // A parked deadline may have been the reactor's next timeout.
    self.notify();
  }

  fn poll_ready(
    &self,
    io: &ScheduledIo,
    cx: &mut Context<'_>,
    dir: Direction,
    id: u64,
  ) -> Poll<io::Result<()>> {
    let poll = io.poll_ready(cx, dir, id, &self.epoll);
    if poll.is_pending() && io.deadline(dir).is_some() {
      self.notify();
    }
    poll
  }

  /// Waits until `dir` of `io` is ready, closed or past its deadline.
  pub(crate) fn ready<'a>(
    &'a self,
    io: &'a ScheduledIo,
    dir: Direction,
  ) -> Readiness<'a> {
    Readiness { reactor: self, io, dir, id: io.waiter_id(), parked: false }
  }

  pub(crate) fn set_deadline(
    &self,
    io: &ScheduledIo,
    dir: Direction,
    deadline: Option<Instant>,
  ) {
    let wakers = io.set_deadline(dir, deadline);
    wakers.into_iter().for_each(Waker::wake);
    self.notify();
  }

  fn notify(&self) {
    if let Err(err) = self.notifier.notify() {
      tracing::error!(%err, "failed to wake vsock reactor");
    }
  }

  fn run(&self) {
    tracing::debug!("vsock reactor started");
    let mut events = Vec::with_capacity(EVENTS_CAPACITY);
    loop {
      if let Err(err) = self.turn(&mut events) {
        tracing::error!(%err, "vsock reactor failed to wait for events");
        thread::sleep(Duration::from_millis(10));
      }
    }
  }

  fn snapshot(&self) -> Vec<Arc<ScheduledIo>> {
    self.ios().values().cloned().collect()
  }

  fn turn(&self, events: &mut Vec<libc::epoll_event>) -> io::Result<()> {
    let next_deadline =
      self.snapshot().iter().filter_map(|io| io.next_deadline()).min();
    let timeout =
      next_deadline.map(|d| d.saturating_duration_since(Instant::now()));

    match self.epoll.wait(events, timeout) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
      Err(err) => return Err(err),
    }

    let mut wakers = Vec::new();
    for event in Epoll::events(events) {
      if event.key == NOTIFY_KEY {
        self.notifier.drain();
        continue;
      }
      // Closed between epoll_wait returning and now.
      let Some(io) = self.ios().get(&event.key).cloned() else {
        continue;
      };
      wakers.extend(io.set_ready(event.readable, event.writable, &self.epoll));
    }

    if next_deadline.is_some() {
      let now = Instant::now();
      for io in self.snapshot() {
        let expired = io.expire(now);
        if !expired.is_empty() {
          tracing::trace!(key = io.key(), "vsock deadline passed");
        }
        wakers.extend(expired);
      }
    }

    wakers.into_iter().for_each(Waker::wake);
    Ok(())
  }
}
