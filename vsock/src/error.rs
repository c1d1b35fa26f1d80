use std::io;

use crate::addr::VsockAddr;
use crate::cid::ContextIdError;

/// Marker carried by the error returned from operations on a closed descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("use of closed vsock descriptor")]
pub struct FdClosed;

/// Marker carried by the error returned once a deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("i/o deadline exceeded")]
pub struct DeadlineExceeded;

pub(crate) fn closed() -> io::Error {
  io::Error::new(io::ErrorKind::NotConnected, FdClosed)
}

pub(crate) fn deadline_exceeded() -> io::Error {
  io::Error::new(io::ErrorKind::TimedOut, DeadlineExceeded)
}

/// Whether `err` reports an operation on a closed listener or connection.
pub fn is_closed(err: &io::Error) -> bool {
  err.get_ref().is_some_and(|inner| inner.is::<FdClosed>())
}

/// Whether `err` reports an operation that ran past its deadline.
pub fn is_deadline_exceeded(err: &io::Error) -> bool {
  err.get_ref().is_some_and(|inner| inner.is::<DeadlineExceeded>())
}

/// Why a listener could not be set up.
///
/// The descriptor is always closed before this error reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
  #[error("failed to resolve local context identifier")]
  ContextId(#[from] ContextIdError),
  #[error("failed to create vsock socket")]
  Socket(#[source] io::Error),
  #[error("failed to bind {addr}")]
  Bind {
    addr: VsockAddr,
    #[source]
    source: io::Error,
  },
  #[error("failed to listen")]
  Listen(#[source] io::Error),
  #[error("failed to read bound address")]
  LocalAddr(#[source] io::Error),
  #[error("failed to switch to non-blocking mode")]
  SetNonblocking(#[source] io::Error),
}

impl ListenError {
  /// The kernel error behind this failure, if there is one.
  pub fn io_error(&self) -> Option<&io::Error> {
    match self {
      Self::ContextId(err) => err.io_error(),
      Self::Socket(err)
      | Self::Bind { source: err, .. }
      | Self::Listen(err)
      | Self::LocalAddr(err)
      | Self::SetNonblocking(err) => Some(err),
    }
  }

  /// Moves the kernel error out, or gives `self` back if there is none.
  pub fn into_io_error(self) -> Result<io::Error, Self> {
    match self {
      Self::ContextId(err) => err.into_io_error().map_err(Self::ContextId),
      Self::Socket(err)
      | Self::Bind { source: err, .. }
      | Self::Listen(err)
      | Self::LocalAddr(err)
      | Self::SetNonblocking(err) => Ok(err),
    }
  }
}

/// Hands back the originating kernel error unchanged, so `raw_os_error()`
/// still works after `?`.
impl From<ListenError> for io::Error {
  fn from(err: ListenError) -> Self {
    err
      .into_io_error()
      .unwrap_or_else(|err| io::Error::new(io::ErrorKind::InvalidData, err))
  }
}
