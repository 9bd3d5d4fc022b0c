//! Data movement through I/O buffers
//!
//! Copies and fills walk the fragment list, never assuming virtual
//! contiguity, and route every transfer through the space-tag dispatcher so
//! user-mode buffers take the fault-guarded primitives. Extendable
//! destinations grow on demand; everything is mapped lazily first.

use super::IoBuffer;
use crate::error::{KernelError, Result};
use crate::mm::user::move_bytes;
use crate::mm::{MemoryContext, MemorySpace, PhysicalAddress, VirtualAddress};

impl IoBuffer {
    /// Copy `count` bytes between two I/O buffers. Offsets apply past each
    /// buffer's cursor. The destination is extended first when it is
    /// extendable and short; both buffers are mapped (not necessarily
    /// contiguously) on demand. May block on extension or mapping.
    pub fn copy(
        ctx: &MemoryContext<'_>,
        destination: &mut IoBuffer,
        destination_offset: usize,
        source: &mut IoBuffer,
        source_offset: usize,
        count: usize,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        let destination_offset = destination.current_offset + destination_offset;
        let source_offset = source.current_offset + source_offset;

        // The source must already hold the data.
        debug_assert!(source_offset + count <= source.total_size);
        // At most one side can be a user buffer.
        debug_assert!(
            destination.space == MemorySpace::Kernel || source.space == MemorySpace::Kernel
        );

        if destination.extendable && destination_offset + count > destination.total_size {
            let shortfall = destination_offset + count - destination.total_size;
            destination.extend(
                ctx,
                PhysicalAddress::new(0),
                PhysicalAddress::new(u64::MAX),
                0,
                shortfall,
                false,
            )?;
        }

        destination.map(ctx, false, false, false)?;
        source.map(ctx, false, false, false)?;

        let (mut destination_index, mut destination_within) = destination
            .fragment_at_offset(destination_offset)
            .ok_or(KernelError::IncorrectBufferSize)?;
        let (mut source_index, mut source_within) = source
            .fragment_at_offset(source_offset)
            .ok_or(KernelError::IncorrectBufferSize)?;

        let mut remaining = count;
        while remaining != 0 {
            let destination_fragment = destination
                .fragments
                .get(destination_index)
                .ok_or(KernelError::IncorrectBufferSize)?;
            let source_fragment = source
                .fragments
                .get(source_index)
                .ok_or(KernelError::IncorrectBufferSize)?;

            let bytes = remaining
                .min(destination_fragment.size - destination_within)
                .min(source_fragment.size - source_within);

            let to = destination_fragment
                .virtual_address
                .expect("destination was just mapped")
                .add(destination_within);
            let from = source_fragment
                .virtual_address
                .expect("source was just mapped")
                .add(source_within);

            // SAFETY: both fragments are mapped and hold at least `bytes`
            // past the computed offsets; user-tagged sides go through the
            // fault-guarded primitives.
            unsafe {
                move_bytes(ctx.user, to, destination.space, from, source.space, bytes)?;
            }

            destination_within += bytes;
            source_within += bytes;
            remaining -= bytes;

            if remaining != 0 {
                if destination_within == destination_fragment.size {
                    destination_index += 1;
                    destination_within = 0;
                }

                if source_within == source_fragment.size {
                    source_index += 1;
                    source_within = 0;
                }
            }
        }

        Ok(())
    }

    /// Zero `count` bytes starting `offset` past the cursor. Extends an
    /// extendable buffer that is short; fails with `IncorrectBufferSize`
    /// when the range runs past the last fragment.
    pub fn zero(&mut self, ctx: &MemoryContext<'_>, offset: usize, count: usize) -> Result<()> {
        debug_assert_eq!(self.space, MemorySpace::Kernel);

        if count == 0 {
            return Ok(());
        }

        let absolute = self.current_offset + offset;
        if self.extendable && absolute + count > self.total_size {
            let shortfall = absolute + count - self.total_size;
            self.extend(
                ctx,
                PhysicalAddress::new(0),
                PhysicalAddress::new(u64::MAX),
                0,
                shortfall,
                false,
            )?;
        }

        self.map(ctx, false, false, false)?;

        let (mut index, mut within) = self
            .fragment_at_offset(absolute)
            .ok_or(KernelError::IncorrectBufferSize)?;
        let mut remaining = count;
        while remaining != 0 {
            let fragment = self
                .fragments
                .get(index)
                .ok_or(KernelError::IncorrectBufferSize)?;
            let bytes = remaining.min(fragment.size - within);
            let address = fragment
                .virtual_address
                .expect("buffer was just mapped")
                .add(within);

            // SAFETY: the fragment is mapped writable and holds at least
            // `bytes` past `within`.
            unsafe {
                core::ptr::write_bytes(address.as_mut_ptr::<u8>(), 0, bytes);
            }

            remaining -= bytes;
            within = 0;
            index += 1;
        }

        Ok(())
    }

    /// Copy a linear kernel buffer into this buffer at `offset` past the
    /// cursor, extending an extendable buffer that is short.
    pub fn copy_data_in(
        &mut self,
        ctx: &MemoryContext<'_>,
        data: &[u8],
        offset: usize,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let absolute = self.current_offset + offset;
        if self.extendable && absolute + data.len() > self.total_size {
            let shortfall = absolute + data.len() - self.total_size;
            self.extend(
                ctx,
                PhysicalAddress::new(0),
                PhysicalAddress::new(u64::MAX),
                0,
                shortfall,
                false,
            )?;
        }

        self.map(ctx, false, false, false)?;

        let (mut index, mut within) = self
            .fragment_at_offset(absolute)
            .ok_or(KernelError::IncorrectBufferSize)?;
        let mut moved = 0;
        while moved < data.len() {
            let fragment = self
                .fragments
                .get(index)
                .ok_or(KernelError::IncorrectBufferSize)?;
            let bytes = (data.len() - moved).min(fragment.size - within);
            let to = fragment
                .virtual_address
                .expect("buffer was just mapped")
                .add(within);

            // SAFETY: the fragment is mapped and holds at least `bytes`; the
            // source is a live kernel slice; a user-mode destination goes
            // through the fault-guarded primitive.
            unsafe {
                move_bytes(
                    ctx.user,
                    to,
                    self.space,
                    VirtualAddress::new(data[moved..].as_ptr() as u64),
                    MemorySpace::Kernel,
                    bytes,
                )?;
            }

            moved += bytes;
            within = 0;
            index += 1;
        }

        Ok(())
    }

    /// Copy this buffer's contents at `offset` past the cursor out into a
    /// linear kernel buffer.
    pub fn copy_data_out(
        &mut self,
        ctx: &MemoryContext<'_>,
        data: &mut [u8],
        offset: usize,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let absolute = self.current_offset + offset;
        self.map(ctx, false, false, false)?;

        let (mut index, mut within) = self
            .fragment_at_offset(absolute)
            .ok_or(KernelError::IncorrectBufferSize)?;
        let mut moved = 0;
        while moved < data.len() {
            let fragment = self
                .fragments
                .get(index)
                .ok_or(KernelError::IncorrectBufferSize)?;
            let bytes = (data.len() - moved).min(fragment.size - within);
            let from = fragment
                .virtual_address
                .expect("buffer was just mapped")
                .add(within);

            // SAFETY: the fragment is mapped and holds at least `bytes`; the
            // destination is a live kernel slice; a user-mode source goes
            // through the fault-guarded primitive.
            unsafe {
                move_bytes(
                    ctx.user,
                    VirtualAddress::new(data[moved..].as_mut_ptr() as u64),
                    MemorySpace::Kernel,
                    from,
                    self.space,
                    bytes,
                )?;
            }

            moved += bytes;
            within = 0;
            index += 1;
        }

        Ok(())
    }
}
