//! VM socket addresses.
//!
//! A [`VsockAddr`] names one endpoint of a VM socket: the context identifier
//! of the machine and a port on it.
//!
//! ## Well-known context identifiers
//!
//! - [`VsockAddr::CID_HYPERVISOR`] (0): reserved for the hypervisor
//! - [`VsockAddr::CID_LOCAL`] (1): local loopback communication
//! - [`VsockAddr::CID_HOST`] (2): the host, seen from a guest
//! - 3 and up: guest VMs

use std::{fmt, io, mem};

/// A VM socket endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VsockAddr {
  /// Context identifier of the machine.
  pub context_id: u32,
  /// Port on that machine.
  pub port: u32,
}

impl VsockAddr {
  /// Reserved for the hypervisor.
  pub const CID_HYPERVISOR: u32 = 0;
  /// Local loopback.
  pub const CID_LOCAL: u32 = 1;
  /// The host, from a guest's point of view.
  pub const CID_HOST: u32 = 2;
  /// Wildcard context identifier (`VMADDR_CID_ANY`).
  pub const CID_ANY: u32 = u32::MAX;
  /// Wildcard port (`VMADDR_PORT_ANY`): the kernel assigns one on bind.
  pub const PORT_ANY: u32 = u32::MAX;

  /// Creates a new address.
  #[must_use]
  pub const fn new(context_id: u32, port: u32) -> Self {
    Self { context_id, port }
  }

  /// Address of `port` on the host.
  #[must_use]
  pub const fn host(port: u32) -> Self {
    Self::new(Self::CID_HOST, port)
  }

  /// Name of the address family, analogous to `"tcp"`.
  #[must_use]
  pub const fn network(&self) -> &'static str {
    "vsock"
  }

  pub(crate) fn to_sockaddr(self) -> libc::sockaddr_vm {
    // SAFETY: sockaddr_vm is plain old data, all zeroes is a valid value.
    let mut sa: libc::sockaddr_vm = unsafe { mem::zeroed() };
    sa.svm_family = libc::AF_VSOCK as libc::sa_family_t;
    sa.svm_port = self.port;
    sa.svm_cid = self.context_id;
    sa
  }

  pub(crate) fn from_sockaddr(sa: &libc::sockaddr_vm) -> io::Result<Self> {
    if sa.svm_family != libc::AF_VSOCK as libc::sa_family_t {
      return Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT));
    }
    Ok(Self::new(sa.svm_cid, sa.svm_port))
  }

  /// Reads an address the kernel wrote into `storage`.
  pub(crate) fn from_storage(
    storage: &libc::sockaddr_storage,
  ) -> io::Result<Self> {
    if storage.ss_family != libc::AF_VSOCK as libc::sa_family_t {
      return Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT));
    }
    // SAFETY: ss_family says the storage holds a sockaddr_vm, and
    // sockaddr_storage is large and aligned enough for any address.
    let sa = unsafe {
      &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_vm>()
    };
    Self::from_sockaddr(sa)
  }
}

impl fmt::Display for VsockAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.context_id {
      Self::CID_HYPERVISOR => write!(f, "hypervisor({})", self.context_id)?,
      Self::CID_LOCAL => write!(f, "local({})", self.context_id)?,
      Self::CID_HOST => write!(f, "host({})", self.context_id)?,
      cid => write!(f, "vm({cid})")?,
    }
    write!(f, ":{}", self.port)
  }
}
