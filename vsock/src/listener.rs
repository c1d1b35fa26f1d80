use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::time::Instant;

use crate::addr::VsockAddr;
use crate::cid::{ContextId, ContextIdSource};
use crate::conn::Conn;
use crate::error::ListenError;
use crate::fd::{ListenFd, SysListenFd};

/// Maximum number of established connections queued before `accept`.
pub const LISTEN_BACKLOG: i32 = 32;

const LISTEN_NAME: &str = "vsock-listen";

/// Flags for every accepted descriptor.
const ACCEPT_FLAGS: i32 = libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;

/// A bound, listening, non-blocking vsock stream socket.
///
/// There is no half-built `Listener`: construction either returns one that is
/// ready to [`accept`](Self::accept) or closes the descriptor and fails.
///
/// The listener can be shared between tasks. [`close`](Self::close) may run
/// while other tasks are blocked in `accept`; they fail with the closed error
/// (see [`crate::is_closed`]). Dropping the listener closes it as well.
pub struct Listener<F: ListenFd = SysListenFd> {
  fd: F,
  addr: VsockAddr,
}

impl Listener {
  /// Listens on `port` of the local context identifier.
  ///
  /// The context identifier is read from `/dev/vsock` once per process. A
  /// `port` of `0` or [`VsockAddr::PORT_ANY`] lets the kernel pick one; read
  /// it back with [`local_addr`](Self::local_addr).
  pub fn bind(port: u32) -> Result<Self, ListenError> {
    let context_id = ContextId::local()?;
    Self::bind_at(context_id, port)
  }

  /// Like [`bind`](Self::bind), asking `source` for the context identifier
  /// instead of the process-wide cache.
  pub fn bind_with<S>(source: &S, port: u32) -> Result<Self, ListenError>
  where
    S: ContextIdSource + ?Sized,
  {
    let context_id = source.local_context_id()?;
    Self::bind_at(context_id, port)
  }

  fn bind_at(context_id: u32, port: u32) -> Result<Self, ListenError> {
    let fd = SysListenFd::new().map_err(ListenError::Socket)?;
    Self::from_listen_fd(fd, context_id, port)
  }
}

/// Setup progress. Each stage names the step that has completed.
enum Stage {
  Unbound,
  Bound,
  Listening,
  Resolved(VsockAddr),
}

impl<F: ListenFd> Listener<F> {
  /// Takes a freshly created, blocking descriptor through bind, listen,
  /// address lookup and the switch to non-blocking mode.
  ///
  /// If any step fails `fd` is closed, a close error is discarded and the
  /// step's own error is returned.
  pub fn from_listen_fd(
    mut fd: F,
    context_id: u32,
    port: u32,
  ) -> Result<Self, ListenError> {
    let port = if port == 0 { VsockAddr::PORT_ANY } else { port };
    let requested = VsockAddr::new(context_id, port);

    let mut guard = CloseOnError::new(&mut fd);
    let mut stage = Stage::Unbound;
    let addr = loop {
      stage = match stage {
        Stage::Unbound => {
          guard.bind(requested).map_err(|source| ListenError::Bind {
            addr: requested,
            source,
          })?;
          Stage::Bound
        }
        Stage::Bound => {
          guard.listen(LISTEN_BACKLOG).map_err(ListenError::Listen)?;
          Stage::Listening
        }
        Stage::Listening => {
          Stage::Resolved(guard.local_addr().map_err(ListenError::LocalAddr)?)
        }
        Stage::Resolved(addr) => {
          guard
            .set_nonblocking(LISTEN_NAME)
            .map_err(ListenError::SetNonblocking)?;
          break addr;
        }
      };
    };
    guard.disarm();

    tracing::debug!(local = %addr, name = LISTEN_NAME, "vsock listener serving");
    Ok(Self { fd, addr })
  }

  /// Waits for the next inbound connection.
  ///
  /// Connections the peer aborted before they were accepted are skipped.
  /// Fails with the closed error once the listener is closed, and with the
  /// deadline error once the deadline passes.
  pub async fn accept(&self) -> io::Result<Conn<F::Conn>> {
    let (fd, remote) = self.fd.accept(ACCEPT_FLAGS).await?;
    Ok(Conn::new(fd, self.addr, remote))
  }

  /// The address the kernel bound, with the assigned port if `0` was asked
  /// for.
  pub fn local_addr(&self) -> VsockAddr {
    self.addr
  }

  /// Sets an absolute deadline for pending and future accepts. `None`
  /// removes it.
  pub fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
    self.fd.set_deadline(deadline)
  }

  /// Stops listening and wakes every blocked accept.
  pub fn close(&self) -> io::Result<()> {
    self.fd.close()
  }

  pub fn get_ref(&self) -> &F {
    &self.fd
  }
}

impl<F: ListenFd> fmt::Debug for Listener<F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Listener").field("addr", &self.addr).finish_non_exhaustive()
  }
}

/// Early-closes the borrowed descriptor on drop unless disarmed.
struct CloseOnError<'a, F: ListenFd> {
  fd: &'a mut F,
  armed: bool,
}

impl<'a, F: ListenFd> CloseOnError<'a, F> {
  fn new(fd: &'a mut F) -> Self {
    Self { fd, armed: true }
  }

  fn disarm(mut self) {
    self.armed = false;
  }
}

impl<F: ListenFd> Deref for CloseOnError<'_, F> {
  type Target = F;

  fn deref(&self) -> &F {
    self.fd
  }
}

impl<F: ListenFd> DerefMut for CloseOnError<'_, F> {
  fn deref_mut(&mut self) -> &mut F {
    self.fd
  }
}

impl<F: ListenFd> Drop for CloseOnError<'_, F> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    // The setup error is what the caller sees.
    if let Err(err) = self.fd.early_close() {
      tracing::debug!(%err, "suppressed error closing vsock listener");
    }
  }
}
