//! Async-safe memory objects.
//!
//! A [`MemoryObject`] is a read-only view over a contiguous range of
//! another task's virtual memory, established with `mach_vm_read` and torn
//! down with `mach_vm_deallocate` -- both syscalls, neither touches the
//! userspace allocator. This is what makes it safe to call from a signal
//! handler: the remap is a real kernel-level mapping, not a `Vec` we
//! `malloc` into.
//!
//! Rounds the request down to a page boundary before reading, since
//! `mach_vm_read` works in whole pages, then bounds-checks into that
//! mapping for every translate.

use crate::error::{KernelError, MobjectError};
use mach2::kern_return::KERN_SUCCESS;
use mach2::port::mach_port_t;

/// A read-only window over `[task_address, task_address + length)` in some
/// other task's address space.
pub struct MemoryObject {
    /// Address of the first requested byte, in the *target's* address space.
    task_address: u64,
    /// Length of the logical view the caller asked for.
    length: u64,
    /// Page-aligned base of the kernel mapping, in *our* address space.
    mapped_base: mach2::vm_types::vm_offset_t,
    /// Size of the kernel mapping (`mapped_base`'s length), which may be
    /// larger than `length` due to page rounding.
    mapped_size: mach2::message::mach_msg_type_number_t,
    /// Offset of `task_address` within the mapping.
    offset_in_mapping: usize,
}

impl MemoryObject {
    /// Establishes a view of `[task_address, task_address + length)` in
    /// `task`.
    pub fn new(task: mach_port_t, task_address: u64, length: u64) -> Result<Self, MobjectError> {
        if length == 0 {
            return Err(MobjectError::NotFound);
        }

        let page_size = page_size();
        let page_address = task_address & !(page_size - 1);
        let end = task_address
            .checked_add(length)
            .ok_or(MobjectError::NotFound)?;
        let last_page_end = (end + page_size - 1) & !(page_size - 1);
        let map_size = last_page_end - page_address;

        let mut mapped_base: mach2::vm_types::vm_offset_t = 0;
        let mut mapped_size: mach2::message::mach_msg_type_number_t = 0;

        // SAFETY: syscall, all pointers are to locals we own.
        let kr = unsafe {
            mach2::vm::mach_vm_read(
                task,
                page_address,
                map_size,
                &mut mapped_base,
                &mut mapped_size,
            )
        };

        if kr != KERN_SUCCESS {
            return Err(MobjectError::Internal(KernelError::from(kr)));
        }

        Ok(Self {
            task_address,
            length,
            mapped_base,
            mapped_size,
            offset_in_mapping: (task_address - page_address) as usize,
        })
    }

    /// Creates a memory object over the calling task's own address space.
    /// Used by the unwinder when it needs to read the crashing thread's own
    /// stack without going through a foreign task port.
    pub fn for_self(task_address: u64, length: u64) -> Result<Self, MobjectError> {
        // SAFETY: no arguments, just asks the kernel for our own task port.
        let this_task = unsafe { mach2::traps::mach_task_self() };
        Self::new(this_task, task_address, length)
    }

    #[inline]
    pub fn task_address(&self) -> u64 {
        self.task_address
    }

    #[inline]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// The entire logical view, as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `mapped_base + offset_in_mapping .. + length` was
        // established as valid, readable memory by the successful
        // `mach_vm_read` above, and lives until `free` (our `Drop`).
        unsafe {
            std::slice::from_raw_parts(
                (self.mapped_base as *const u8).add(self.offset_in_mapping),
                self.length as usize,
            )
        }
    }

    /// Translates `task_address + offset .. + len` into a pointer valid in
    /// the reader's address space, or `None` if any part of that range
    /// falls outside this object's view. Overflow in the sum is rejected,
    /// never trapped on.
    pub fn translate(&self, offset: u64, len: u64) -> Option<*const u8> {
        let start = offset.checked_add(0)?;
        let end = start.checked_add(len)?;
        if end > self.length {
            return None;
        }
        // SAFETY: bounds were just checked against `self.length`, which is
        // backed by `self.mapped_size` bytes of live kernel mapping.
        Some(unsafe {
            (self.mapped_base as *const u8)
                .add(self.offset_in_mapping)
                .add(start as usize)
        })
    }

    /// Same as [`Self::translate`], but returns a byte slice instead of a
    /// raw pointer.
    pub fn translate_slice(&self, offset: u64, len: u64) -> Option<&[u8]> {
        let ptr = self.translate(offset, len)?;
        // SAFETY: `translate` already validated `len` bytes starting at
        // `ptr` lie within the live mapping.
        Some(unsafe { std::slice::from_raw_parts(ptr, len as usize) })
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        // SAFETY: syscall; `mapped_base`/`mapped_size` were returned by the
        // matching `mach_vm_read` and are not used again after this point.
        unsafe {
            mach2::vm::mach_vm_deallocate(
                mach2::traps::mach_task_self(),
                self.mapped_base,
                self.mapped_size as u64,
            );
        }
    }
}

fn page_size() -> u64 {
    // SAFETY: no arguments, returns a plain integer.
    unsafe { libc::getpagesize() as u64 }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_own_stack_local() {
        let local = 0x1234_5678_u64;
        let addr = &local as *const u64 as u64;
        let mo = MemoryObject::for_self(addr, 8).expect("mach_vm_read on self should work");
        let bytes = mo.as_slice();
        assert_eq!(bytes.len(), 8);
        assert_eq!(u64::from_ne_bytes(bytes.try_into().unwrap()), local);
    }

    #[test]
    fn translate_rejects_out_of_range() {
        let buf = [0u8; 64];
        let addr = buf.as_ptr() as u64;
        let mo = MemoryObject::for_self(addr, 64).unwrap();
        assert!(mo.translate(0, 64).is_some());
        assert!(mo.translate(60, 8).is_none());
        assert!(mo.translate(u64::MAX - 4, 16).is_none());
    }
}
