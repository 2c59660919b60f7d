// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber stacks and machine-context switching.
//!
//! This is the only module that touches `ucontext_t`. Everything above it
//! goes through the `Fiber` state machine.

use std::alloc::{self, Layout};
use std::io;
use std::mem;
use std::ptr::{self, NonNull};

const STACK_ALIGN: usize = 16;

/// Heap-allocated execution stack owned by one fiber.
pub(crate) struct Stack {
    base: NonNull<u8>,
    layout: Layout,
}

impl Stack {
    pub(crate) fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, STACK_ALIGN)
            .unwrap_or_else(|_| panic!("invalid fiber stack size {size}"));
        assert!(layout.size() > 0, "fiber stack size must be non-zero");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let Some(base) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };
        Self { base, layout }
    }

    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Saved register state.
///
/// Boxed because glibc keeps a pointer into the struct itself
/// (`uc_mcontext.fpregs`), so it must never move once filled in.
pub(crate) struct Context {
    uc: Box<libc::ucontext_t>,
}

impl Context {
    /// Blank context; the first `swap` away from it fills it in.
    pub(crate) fn empty() -> Self {
        // SAFETY: ucontext_t is plain C data, all-zero is a valid value.
        Self {
            uc: Box::new(unsafe { mem::zeroed() }),
        }
    }

    /// Context that starts running `entry` at the top of `stack`.
    pub(crate) fn with_stack(stack: &Stack, entry: extern "C" fn()) -> Self {
        let mut ctx = Self::empty();
        ctx.prepare(stack, entry);
        ctx
    }

    /// Rebuild this context so that the next switch into it calls `entry`
    /// on a fresh frame at the top of `stack`.
    pub(crate) fn prepare(&mut self, stack: &Stack, entry: extern "C" fn()) {
        let uc: *mut libc::ucontext_t = &mut *self.uc;
        unsafe {
            if libc::getcontext(uc) != 0 {
                panic!("getcontext failed: {}", io::Error::last_os_error());
            }
            (*uc).uc_link = ptr::null_mut();
            (*uc).uc_stack.ss_sp = stack.base().cast();
            (*uc).uc_stack.ss_size = stack.size();
            (*uc).uc_stack.ss_flags = 0;
            libc::makecontext(uc, entry, 0);
        }
    }
}

/// Save the running context into `from` and continue in `to`.
///
/// Returns when something later switches back into `from`.
///
/// # Safety
/// Both pointers must be valid for the whole suspension: `from` until it
/// is resumed or discarded, `to` until the switch has loaded it. `to` must
/// have been prepared or previously saved. No other thread may be running
/// on either context.
pub(crate) unsafe fn swap(from: *mut Context, to: *const Context) {
    let rc = libc::swapcontext(&mut *(*from).uc, &*(*to).uc);
    assert_eq!(rc, 0, "swapcontext failed: {}", io::Error::last_os_error());
}
