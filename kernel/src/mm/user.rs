//! Address-space tags and data movement
//!
//! Copies in and out of I/O buffers may cross the user/kernel boundary.
//! Rather than scattering user/kernel conditionals, every copy goes through
//! [`move_bytes`], which dispatches on the address-space tags of both sides.
//! The user-side primitives are a collaborator trait because they need
//! fault-guarded access to the current process's address space.

use super::VirtualAddress;
use crate::error::{KernelError, Result};

/// Which address space a virtual address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySpace {
    Kernel,
    User,
}

/// Fault-guarded copy primitives for the current process's user space.
pub trait UserAccess: Sync {
    /// Copy `src` into user memory at `dst`. A user fault surfaces as
    /// [`KernelError::AccessViolation`].
    fn copy_to_user(&self, dst: VirtualAddress, src: &[u8]) -> Result<()>;

    /// Fill `dst` from user memory at `src`.
    fn copy_from_user(&self, dst: &mut [u8], src: VirtualAddress) -> Result<()>;
}

/// User access for contexts with no user processes; every access faults.
pub struct DeniedUserAccess;

impl UserAccess for DeniedUserAccess {
    fn copy_to_user(&self, dst: VirtualAddress, _src: &[u8]) -> Result<()> {
        Err(KernelError::AccessViolation {
            addr: dst.as_usize(),
        })
    }

    fn copy_from_user(&self, _dst: &mut [u8], src: VirtualAddress) -> Result<()> {
        Err(KernelError::AccessViolation {
            addr: src.as_usize(),
        })
    }
}

/// Move `len` bytes from `src` to `dst`, dispatching on the address-space
/// tag of each side. User faults surface as `AccessViolation`; user-to-user
/// moves are not supported.
///
/// # Safety
///
/// Kernel-tagged addresses must be valid for the whole `len` bytes (readable
/// for `src`, writable for `dst`) for the duration of the call. User-tagged
/// addresses carry no validity requirement; the [`UserAccess`] primitives
/// fault-check them.
pub unsafe fn move_bytes(
    user: &dyn UserAccess,
    dst: VirtualAddress,
    dst_space: MemorySpace,
    src: VirtualAddress,
    src_space: MemorySpace,
    len: usize,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }

    match (dst_space, src_space) {
        (MemorySpace::User, MemorySpace::User) => {
            debug_assert!(false, "user-to-user copy is not supported");
            Err(KernelError::InvalidParameter)
        }
        (MemorySpace::User, MemorySpace::Kernel) => {
            // SAFETY: the caller guarantees src is readable for len bytes.
            let source = unsafe { core::slice::from_raw_parts(src.as_ptr::<u8>(), len) };
            user.copy_to_user(dst, source)
        }
        (MemorySpace::Kernel, MemorySpace::User) => {
            // SAFETY: the caller guarantees dst is writable for len bytes.
            let destination =
                unsafe { core::slice::from_raw_parts_mut(dst.as_mut_ptr::<u8>(), len) };
            user.copy_from_user(destination, src)
        }
        (MemorySpace::Kernel, MemorySpace::Kernel) => {
            // SAFETY: the caller guarantees both ranges; copy handles any
            // overlap.
            unsafe {
                core::ptr::copy(src.as_ptr::<u8>(), dst.as_mut_ptr::<u8>(), len);
            }
            Ok(())
        }
    }
}
