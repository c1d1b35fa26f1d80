use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use super::epoll::{Epoll, Interest};
use crate::error::{closed, deadline_exceeded};

/// Which half of a descriptor an operation waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
  Read,
  Write,
}

/// Readiness state of one registered descriptor.
///
/// Every field lives behind one lock, and epoll is only touched while holding
/// it, so a registration can never be re-armed after it was shut down.
pub(crate) struct ScheduledIo {
  key: u64,
  fd: RawFd,
  next_waiter: AtomicU64,
  state: Mutex<State>,
}

#[derive(Default)]
struct State {
  registered: bool,
  closed: bool,
  read: Half,
  write: Half,
}

/// Parked tasks are keyed by a per-wait id, not by waker identity: futures
/// joined in one task share a waker but must be forgotten separately.
#[derive(Default)]
struct Half {
  ready: bool,
  deadline: Option<Instant>,
  waiters: Vec<(u64, Waker)>,
}

impl Half {
  fn expired(&self, now: Instant) -> bool {
    self.deadline.is_some_and(|deadline| deadline <= now)
  }

  fn push_waiter(&mut self, id: u64, waker: &Waker) {
    match self.waiters.iter_mut().find(|(i, _)| *i == id) {
      Some((_, w)) => w.clone_from(waker),
      None => self.waiters.push((id, waker.clone())),
    }
  }

  fn remove_waiter(&mut self, id: u64) {
    self.waiters.retain(|(i, _)| *i != id);
  }

  fn take_waiters(&mut self) -> impl Iterator<Item = Waker> + use<> {
    std::mem::take(&mut self.waiters).into_iter().map(|(_, w)| w)
  }
}

impl State {
  fn half(&mut self, dir: Direction) -> &mut Half {
    match dir {
      Direction::Read => &mut self.read,
      Direction::Write => &mut self.write,
    }
  }

  fn interest(&self) -> Option<Interest> {
    Interest::from_waiters(
      !self.read.waiters.is_empty(),
      !self.write.waiters.is_empty(),
    )
  }

  fn take_all_waiters(&mut self) -> Vec<Waker> {
    self.read.take_waiters().chain(self.write.take_waiters()).collect()
  }
}

impl ScheduledIo {
  pub(crate) fn new(key: u64, fd: RawFd) -> Self {
    Self {
      key,
      fd,
      next_waiter: AtomicU64::new(0),
      state: Mutex::new(State::default()),
    }
  }

  /// Id for one wait on this descriptor, passed to every
  /// [`poll_ready`](Self::poll_ready) of that wait.
  pub(crate) fn waiter_id(&self) -> u64 {
    self.next_waiter.fetch_add(1, Ordering::Relaxed)
  }

  pub(crate) fn key(&self) -> u64 {
    self.key
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Fails if the descriptor was closed or the deadline for `dir` passed.
  pub(crate) fn check(&self, dir: Direction) -> io::Result<()> {
    let mut state = self.lock();
    if state.closed {
      return Err(closed());
    }
    if state.half(dir).expired(Instant::now()) {
      return Err(deadline_exceeded());
    }
    Ok(())
  }

  /// Resolves once `dir` is ready, the descriptor is closed or the deadline
  /// passes. Otherwise parks the task's waker under `id` and arms epoll.
  ///
  /// A resolved wait is no longer parked.
  pub(crate) fn poll_ready(
    &self,
    cx: &mut Context<'_>,
    dir: Direction,
    id: u64,
    epoll: &Epoll,
  ) -> Poll<io::Result<()>> {
    let mut state = self.lock();
    if state.closed {
      state.half(dir).remove_waiter(id);
      return Poll::Ready(Err(closed()));
    }
    let half = state.half(dir);
    if half.expired(Instant::now()) {
      half.remove_waiter(id);
      return Poll::Ready(Err(deadline_exceeded()));
    }
    if half.ready {
      half.remove_waiter(id);
      return Poll::Ready(Ok(()));
    }
    half.push_waiter(id, cx.waker());

    if let Err(err) = self.arm(&mut state, epoll) {
      // Nobody can be woken by epoll now; let the other waiters retry too.
      state.half(dir).remove_waiter(id);
      let others = state.take_all_waiters();
      drop(state);
      others.into_iter().for_each(Waker::wake);
      return Poll::Ready(Err(err));
    }
    Poll::Pending
  }

  /// Drops the parked waker of a wait that was abandoned before it resolved.
  pub(crate) fn forget_waiter(&self, dir: Direction, id: u64) {
    self.lock().half(dir).remove_waiter(id);
  }

  pub(crate) fn deadline(&self, dir: Direction) -> Option<Instant> {
    self.lock().half(dir).deadline
  }

  fn arm(&self, state: &mut State, epoll: &Epoll) -> io::Result<()> {
    let Some(interest) = state.interest() else {
      return Ok(());
    };
    if state.registered {
      epoll.modify(self.fd, self.key, interest)
    } else {
      epoll.add(self.fd, self.key, interest)?;
      state.registered = true;
      Ok(())
    }
  }

  /// Forgets readiness for `dir` after the kernel said "would block".
  pub(crate) fn clear_ready(&self, dir: Direction) {
    self.lock().half(dir).ready = false;
  }

  /// Records readiness from the reactor and returns the tasks to wake.
  pub(crate) fn set_ready(
    &self,
    readable: bool,
    writable: bool,
    epoll: &Epoll,
  ) -> Vec<Waker> {
    let mut state = self.lock();
    if state.closed {
      return Vec::new();
    }
    let mut wakers = Vec::new();
    if readable {
      state.read.ready = true;
      wakers.extend(state.read.take_waiters());
    }
    if writable {
      state.write.ready = true;
      wakers.extend(state.write.take_waiters());
    }
    // The oneshot registration is now disarmed; keep the other half armed.
    if let Err(err) = self.arm(&mut state, epoll) {
      tracing::trace!(%err, key = self.key, "failed to re-arm vsock descriptor");
      wakers.extend(state.take_all_waiters());
    }
    wakers
  }

  /// Replaces the deadline for `dir` and returns the waiters that must
  /// re-check it.
  pub(crate) fn set_deadline(
    &self,
    dir: Direction,
    deadline: Option<Instant>,
  ) -> Vec<Waker> {
    let mut state = self.lock();
    let half = state.half(dir);
    half.deadline = deadline;
    half.take_waiters().collect()
  }

  /// Earliest deadline among halves that have parked tasks.
  pub(crate) fn next_deadline(&self) -> Option<Instant> {
    let state = self.lock();
    [&state.read, &state.write]
      .into_iter()
      .filter(|half| !half.waiters.is_empty())
      .filter_map(|half| half.deadline)
      .min()
  }

  /// Takes the waiters whose deadline passed by `now`.
  pub(crate) fn expire(&self, now: Instant) -> Vec<Waker> {
    let mut state = self.lock();
    let mut wakers = Vec::new();
    for dir in [Direction::Read, Direction::Write] {
      let half = state.half(dir);
      if half.expired(now) {
        wakers.extend(half.take_waiters());
      }
    }
    wakers
  }

  /// Marks the descriptor closed, removes it from epoll and returns every
  /// parked task. Must run before the descriptor itself is closed.
  pub(crate) fn shutdown(&self, epoll: &Epoll) -> Vec<Waker> {
    let mut state = self.lock();
    state.closed = true;
    if state.registered {
      state.registered = false;
      if let Err(err) = epoll.delete(self.fd) {
        tracing::trace!(%err, key = self.key, "failed to deregister vsock descriptor");
      }
    }
    state.take_all_waiters()
  }
}
