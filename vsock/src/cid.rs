//! Local context identifier resolution.
//!
//! The kernel reports the context identifier of the running machine through an
//! ioctl on the vsock device. It never changes while the process runs, so the
//! process-wide value is resolved once and cached in a [`ContextId`] cell.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::addr::VsockAddr;

/// `_IO(7, 0xb9)` from `<linux/vm_sockets.h>`.
const IOCTL_VM_SOCKETS_GET_LOCAL_CID: libc::c_ulong = 0x7b9;

/// Errors from resolving the local context identifier.
#[derive(Debug, thiserror::Error)]
pub enum ContextIdError {
  /// The vsock device could not be opened (missing module, permissions).
  #[error("failed to open {}", .path.display())]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  /// The device rejected the local context identifier request.
  #[error("IOCTL_VM_SOCKETS_GET_LOCAL_CID failed")]
  Ioctl(#[source] io::Error),
  /// The kernel answered with a value that can't name this machine.
  #[error("malformed local context identifier {0}")]
  Malformed(u32),
}

impl ContextIdError {
  /// The underlying I/O error, if there is one.
  pub fn io_error(&self) -> Option<&io::Error> {
    match self {
      Self::Open { source, .. } | Self::Ioctl(source) => Some(source),
      Self::Malformed(_) => None,
    }
  }

  /// Moves the underlying I/O error out, or gives `self` back if there is
  /// none.
  pub fn into_io_error(self) -> Result<io::Error, Self> {
    match self {
      Self::Open { source, .. } | Self::Ioctl(source) => Ok(source),
      other => Err(other),
    }
  }
}

/// Something that knows the local context identifier.
pub trait ContextIdSource {
  fn local_context_id(&self) -> Result<u32, ContextIdError>;
}

/// Resolves the context identifier by asking the vsock device.
#[derive(Debug, Clone)]
pub struct DevVsock {
  path: PathBuf,
}

impl DevVsock {
  pub const PATH: &'static str = "/dev/vsock";

  pub fn new() -> Self {
    Self::with_path(Self::PATH)
  }

  /// Uses a device node at a non-standard location.
  pub fn with_path(path: impl AsRef<Path>) -> Self {
    Self { path: path.as_ref().to_path_buf() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Default for DevVsock {
  fn default() -> Self {
    Self::new()
  }
}

impl ContextIdSource for DevVsock {
  fn local_context_id(&self) -> Result<u32, ContextIdError> {
    let file = File::open(&self.path).map_err(|source| ContextIdError::Open {
      path: self.path.clone(),
      source,
    })?;

    let mut cid: u32 = 0;
    syscall!(ioctl(
      file.as_raw_fd(),
      IOCTL_VM_SOCKETS_GET_LOCAL_CID as _,
      &mut cid as *mut u32,
    ))
    .map_err(ContextIdError::Ioctl)?;

    validate(cid)
  }
}

/// A context identifier known up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedContextId(pub u32);

impl ContextIdSource for FixedContextId {
  fn local_context_id(&self) -> Result<u32, ContextIdError> {
    validate(self.0)
  }
}

fn validate(cid: u32) -> Result<u32, ContextIdError> {
  if cid == VsockAddr::CID_ANY {
    return Err(ContextIdError::Malformed(cid));
  }
  Ok(cid)
}

/// An initialize-once context identifier.
///
/// Only successful resolutions are stored; a failed attempt leaves the cell
/// empty so a later call can try again (for example after the vsock module
/// was loaded).
#[derive(Debug, Default)]
pub struct ContextId {
  cell: OnceLock<u32>,
}

static LOCAL: ContextId = ContextId::new();

impl ContextId {
  pub const fn new() -> Self {
    Self { cell: OnceLock::new() }
  }

  /// The cached value, if resolution already succeeded.
  pub fn get(&self) -> Option<u32> {
    self.cell.get().copied()
  }

  /// Returns the cached value or resolves it from `source`.
  pub fn get_or_resolve<S>(&self, source: &S) -> Result<u32, ContextIdError>
  where
    S: ContextIdSource + ?Sized,
  {
    if let Some(cid) = self.cell.get() {
      return Ok(*cid);
    }
    let cid = source.local_context_id()?;
    // A racing resolver may have won; both read the same kernel value.
    Ok(*self.cell.get_or_init(|| cid))
  }

  /// The process-wide context identifier, resolved through [`DevVsock`].
  pub fn local() -> Result<u32, ContextIdError> {
    LOCAL.get_or_resolve(&DevVsock::new())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::Cell;

  struct Counting {
    calls: Cell<usize>,
    result: Option<u32>,
  }

  impl ContextIdSource for Counting {
    fn local_context_id(&self) -> Result<u32, ContextIdError> {
      self.calls.set(self.calls.get() + 1);
      self.result.ok_or(ContextIdError::Malformed(VsockAddr::CID_ANY))
    }
  }

  #[test]
  fn resolves_once() {
    let cell = ContextId::new();
    let source = Counting { calls: Cell::new(0), result: Some(7) };

    assert_eq!(cell.get_or_resolve(&source).unwrap(), 7);
    assert_eq!(cell.get_or_resolve(&source).unwrap(), 7);
    assert_eq!(source.calls.get(), 1);
    assert_eq!(cell.get(), Some(7));
  }

  #[test]
  fn failures_are_not_cached() {
    let cell = ContextId::new();
    let failing = Counting { calls: Cell::new(0), result: None };
    assert!(cell.get_or_resolve(&failing).is_err());
    assert_eq!(cell.get(), None);

    let working = Counting { calls: Cell::new(0), result: Some(3) };
    assert_eq!(cell.get_or_resolve(&working).unwrap(), 3);
  }

  #[test]
  fn fixed_rejects_wildcard() {
    assert_eq!(FixedContextId(3).local_context_id().unwrap(), 3);
    assert!(matches!(
      FixedContextId(VsockAddr::CID_ANY).local_context_id(),
      Err(ContextIdError::Malformed(u32::MAX))
    ));
  }

  #[test]
  fn missing_device_is_an_open_error() {
    let source = DevVsock::with_path("/nonexistent/vsock-device");
    let err = source.local_context_id().unwrap_err();
    assert_eq!(source.path(), Path::new("/nonexistent/vsock-device"));
    assert!(matches!(err, ContextIdError::Open { .. }));
    assert_eq!(err.io_error().unwrap().kind(), io::ErrorKind::NotFound);
    assert_eq!(err.into_io_error().unwrap().raw_os_error(), Some(libc::ENOENT));
    assert_eq!(DevVsock::default().path(), Path::new(DevVsock::PATH));
  }

  #[test]
  fn non_vsock_device_fails_the_ioctl() {
    let err = DevVsock::with_path("/dev/null").local_context_id().unwrap_err();
    assert!(matches!(err, ContextIdError::Ioctl(_)), "got {err:?}");
  }
}
