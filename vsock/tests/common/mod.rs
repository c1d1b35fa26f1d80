#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::net::Shutdown;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Instant;

use vsock::VsockAddr;
use vsock::error::{DeadlineExceeded, FdClosed};
use vsock::fd::{ConnFd, Descriptor, ListenFd, RawConn, accept_on};

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

pub fn closed_error() -> io::Error {
  io::Error::new(io::ErrorKind::NotConnected, FdClosed)
}

pub fn deadline_error() -> io::Error {
  io::Error::new(io::ErrorKind::TimedOut, DeadlineExceeded)
}

/// Gives other futures in a `join!` a chance to run.
pub async fn yield_now() {
  let mut yielded = false;
  poll_fn(|cx| {
    if yielded {
      Poll::Ready(())
    } else {
      yielded = true;
      cx.waker().wake_by_ref();
      Poll::Pending
    }
  })
  .await
}

/// Counts descriptors the fakes consider open.
#[derive(Debug, Default)]
pub struct Ledger {
  open: AtomicUsize,
  early_closes: AtomicUsize,
}

impl Ledger {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn open(&self) -> usize {
    self.open.load(Ordering::SeqCst)
  }

  pub fn early_closes(&self) -> usize {
    self.early_closes.load(Ordering::SeqCst)
  }

  fn opened(&self) {
    self.open.fetch_add(1, Ordering::SeqCst);
  }

  fn closed(&self) {
    self.open.fetch_sub(1, Ordering::SeqCst);
  }
}

/// Fake raw descriptor: never ready on its own, every wait is a yield.
#[derive(Debug, Default)]
pub struct ScriptedConn {
  closed: AtomicBool,
  deadline: Mutex<Option<Instant>>,
  waits: AtomicUsize,
}

const FAKE_FD: RawFd = 1000;

impl ScriptedConn {
  pub fn waits(&self) -> usize {
    self.waits.load(Ordering::SeqCst)
  }

  fn check(&self) -> io::Result<()> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(closed_error());
    }
    let deadline = *self.deadline.lock().unwrap();
    if deadline.is_some_and(|d| d <= Instant::now()) {
      return Err(deadline_error());
    }
    Ok(())
  }

  /// Marks the descriptor closed; false if it already was.
  fn close(&self) -> bool {
    !self.closed.swap(true, Ordering::SeqCst)
  }

  fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(closed_error());
    }
    *self.deadline.lock().unwrap() = deadline;
    Ok(())
  }
}

impl RawConn for ScriptedConn {
  async fn read_with<R, F>(&self, mut f: F) -> io::Result<R>
  where
    R: Send,
    F: FnMut(RawFd) -> io::Result<R> + Send,
  {
    loop {
      self.check()?;
      match f(FAKE_FD) {
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          self.waits.fetch_add(1, Ordering::SeqCst);
          yield_now().await;
        }
        res => return res,
      }
    }
  }

  async fn write_with<R, F>(&self, f: F) -> io::Result<R>
  where
    R: Send,
    F: FnMut(RawFd) -> io::Result<R> + Send,
  {
    self.read_with(f).await
  }

  fn control<R, F>(&self, f: F) -> io::Result<R>
  where
    F: FnOnce(RawFd) -> io::Result<R>,
  {
    self.check()?;
    f(FAKE_FD)
  }
}

/// Setup steps a [`FakeListenFd`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
  Bind,
  Listen,
  LocalAddr,
  SetNonblocking,
}

type Accepted = io::Result<(FakeConnFd, VsockAddr)>;

/// Listening descriptor that lives entirely in memory.
///
/// Dropping it does not close it, so a leak shows up in the [`Ledger`].
#[derive(Debug)]
pub struct FakeListenFd {
  ledger: Arc<Ledger>,
  fail_at: Option<Step>,
  fail_close: bool,
  raw: ScriptedConn,
  requested: Mutex<Option<VsockAddr>>,
  bound: Mutex<Option<VsockAddr>>,
  backlog: Mutex<Option<i32>>,
  name: Option<&'static str>,
  accept_flags: Mutex<Vec<i32>>,
  pending: Mutex<VecDeque<Accepted>>,
}

impl FakeListenFd {
  pub fn new(ledger: &Arc<Ledger>) -> Self {
    ledger.opened();
    Self {
      ledger: ledger.clone(),
      fail_at: None,
      fail_close: false,
      raw: ScriptedConn::default(),
      requested: Mutex::new(None),
      bound: Mutex::new(None),
      backlog: Mutex::new(None),
      name: None,
      accept_flags: Mutex::new(Vec::new()),
      pending: Mutex::new(VecDeque::new()),
    }
  }

  pub fn failing_at(ledger: &Arc<Ledger>, step: Step) -> Self {
    Self { fail_at: Some(step), ..Self::new(ledger) }
  }

  /// The close itself fails too, after releasing the descriptor.
  pub fn with_failing_close(self) -> Self {
    Self { fail_close: true, ..self }
  }

  pub fn requested(&self) -> Option<VsockAddr> {
    *self.requested.lock().unwrap()
  }

  pub fn backlog(&self) -> Option<i32> {
    *self.backlog.lock().unwrap()
  }

  pub fn name(&self) -> Option<&'static str> {
    self.name
  }

  pub fn accept_flags(&self) -> Vec<i32> {
    self.accept_flags.lock().unwrap().clone()
  }

  pub fn waits(&self) -> usize {
    self.raw.waits()
  }

  pub fn push_conn(&self, conn: FakeConnFd, peer: VsockAddr) {
    self.pending.lock().unwrap().push_back(Ok((conn, peer)));
  }

  pub fn push_errno(&self, errno: i32) {
    self.pending.lock().unwrap().push_back(Err(io::Error::from_raw_os_error(errno)));
  }

  fn fail(&self, step: Step, errno: i32) -> io::Result<()> {
    if self.fail_at == Some(step) {
      Err(io::Error::from_raw_os_error(errno))
    } else {
      Ok(())
    }
  }
}

impl Descriptor for FakeListenFd {
  fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.raw.set_deadline(deadline)
  }

  fn close(&self) -> io::Result<()> {
    if !self.raw.close() {
      return Err(closed_error());
    }
    self.ledger.closed();
    if self.fail_close {
      return Err(io::Error::from_raw_os_error(libc::EIO));
    }
    Ok(())
  }
}

impl ListenFd for FakeListenFd {
  type Conn = FakeConnFd;

  fn bind(&self, addr: VsockAddr) -> io::Result<()> {
    *self.requested.lock().unwrap() = Some(addr);
    self.fail(Step::Bind, libc::EADDRINUSE)?;
    let port = if addr.port == VsockAddr::PORT_ANY {
      fastrand::u32(1024..VsockAddr::PORT_ANY)
    } else {
      addr.port
    };
    *self.bound.lock().unwrap() = Some(VsockAddr::new(addr.context_id, port));
    Ok(())
  }

  fn listen(&self, backlog: i32) -> io::Result<()> {
    self.fail(Step::Listen, libc::EINVAL)?;
    if self.bound.lock().unwrap().is_none() {
      return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    *self.backlog.lock().unwrap() = Some(backlog);
    Ok(())
  }

  fn local_addr(&self) -> io::Result<VsockAddr> {
    self.fail(Step::LocalAddr, libc::ENOBUFS)?;
    self.bound.lock().unwrap().ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
  }

  fn set_nonblocking(&mut self, name: &'static str) -> io::Result<()> {
    self.fail(Step::SetNonblocking, libc::ENOMEM)?;
    self.name = Some(name);
    Ok(())
  }

  async fn accept(&self, flags: i32) -> Accepted {
    self.accept_flags.lock().unwrap().push(flags);
    accept_on(&self.raw, |_fd| {
      self
        .pending
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(io::ErrorKind::WouldBlock.into()))
    })
    .await
  }

  fn early_close(&mut self) -> io::Result<()> {
    self.ledger.early_closes.fetch_add(1, Ordering::SeqCst);
    self.close()
  }
}

/// In-memory connection: reads drain `inbox`, writes land in `written`.
#[derive(Debug)]
pub struct FakeConnFd {
  pub id: usize,
  ledger: Arc<Ledger>,
  raw: ScriptedConn,
  chunk: usize,
  inbox: Mutex<VecDeque<u8>>,
  written: Mutex<Vec<u8>>,
  shutdowns: Mutex<Vec<Shutdown>>,
}

impl FakeConnFd {
  pub fn new(ledger: &Arc<Ledger>, id: usize) -> Self {
    ledger.opened();
    Self {
      id,
      ledger: ledger.clone(),
      raw: ScriptedConn::default(),
      chunk: usize::MAX,
      inbox: Mutex::new(VecDeque::new()),
      written: Mutex::new(Vec::new()),
      shutdowns: Mutex::new(Vec::new()),
    }
  }

  /// Writes accept at most `chunk` bytes per call.
  pub fn with_chunk(self, chunk: usize) -> Self {
    Self { chunk, ..self }
  }

  pub fn feed(&self, data: &[u8]) {
    self.inbox.lock().unwrap().extend(data);
  }

  pub fn written(&self) -> Vec<u8> {
    self.written.lock().unwrap().clone()
  }

  pub fn shutdowns(&self) -> Vec<Shutdown> {
    self.shutdowns.lock().unwrap().clone()
  }

  fn is_shut(&self, how: Shutdown) -> bool {
    self.shutdowns.lock().unwrap().iter().any(|s| *s == how || *s == Shutdown::Both)
  }
}

impl Descriptor for FakeConnFd {
  fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.raw.set_deadline(deadline)
  }

  fn close(&self) -> io::Result<()> {
    if !self.raw.close() {
      return Err(closed_error());
    }
    self.ledger.closed();
    Ok(())
  }
}

impl ConnFd for FakeConnFd {
  async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
    self
      .raw
      .read_with(|_fd| {
        let mut inbox = self.inbox.lock().unwrap();
        if inbox.is_empty() {
          return if self.is_shut(Shutdown::Read) {
            Ok(0)
          } else {
            Err(io::ErrorKind::WouldBlock.into())
          };
        }
        let n = buf.len().min(inbox.len());
        for (dst, src) in buf.iter_mut().zip(inbox.drain(..n)) {
          *dst = src;
        }
        Ok(n)
      })
      .await
  }

  async fn write(&self, buf: &[u8]) -> io::Result<usize> {
    self
      .raw
      .write_with(|_fd| {
        if self.is_shut(Shutdown::Write) {
          return Err(io::Error::from_raw_os_error(libc::EPIPE));
        }
        let n = buf.len().min(self.chunk);
        self.written.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(n)
      })
      .await
  }

  fn shutdown(&self, how: Shutdown) -> io::Result<()> {
    self.raw.control(|_fd| {
      self.shutdowns.lock().unwrap().push(how);
      Ok(())
    })
  }

  fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.raw.set_deadline(deadline)
  }

  fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.raw.set_deadline(deadline)
  }
}
