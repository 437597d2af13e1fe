//! Fixed-size stacks for contexts, mapped with a guard page below them.

use crate::error::{ThreadError, ThreadResult};

/// Default usable stack size for a new context.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Smallest usable stack accepted. The bootstrap handler runs on the stack, so
/// it has to satisfy the kernel's alternate signal stack floor with room to spare.
pub const MIN_STACK_SIZE: usize = 4 * libc::MINSIGSTKSZ;

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

/// A stack mapping owned by exactly one context.
///
/// Layout: `[guard page][usable stack]`. The guard page is `PROT_NONE`, so an
/// overflow faults instead of silently corrupting a neighbour.
pub struct Stack {
    base: *mut u8,
    mapped: usize,
    guard: usize,
}

impl Stack {
    pub fn new(size: usize) -> ThreadResult<Self> {
        if size < MIN_STACK_SIZE {
            return Err(ThreadError::InvalidStackSize {
                size,
                min: MIN_STACK_SIZE,
            });
        }

        let guard = page_size();
        let usable = (size + guard - 1) & !(guard - 1);
        let mapped = usable + guard;

        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ThreadError::StackAllocation {
                size: mapped,
                errno: crate::error::errno(),
            });
        }

        let stack = Stack {
            base: base.cast(),
            mapped,
            guard,
        };

        if unsafe { libc::mprotect(base, guard, libc::PROT_NONE) } == -1 {
            // `stack` unmaps on drop.
            return Err(ThreadError::StackAllocation {
                size: mapped,
                errno: crate::error::errno(),
            });
        }

        Ok(stack)
    }

    /// Lowest usable address, just above the guard page.
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(self.guard) }
    }

    /// One past the highest usable address.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.mapped) }
    }

    pub fn len(&self) -> usize {
        self.mapped - self.guard
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom() as usize && addr < self.top() as usize
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.mapped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_whole_pages() {
        let stack = Stack::new(DEFAULT_STACK_SIZE + 1).unwrap();
        assert!(stack.len() > DEFAULT_STACK_SIZE);
        assert_eq!(stack.len() % page_size(), 0);
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.len());
    }

    #[test]
    fn usable_region_is_writable() {
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        unsafe {
            stack.bottom().write(0xAA);
            stack.top().sub(1).write(0x55);
            assert_eq!(stack.bottom().read(), 0xAA);
        }
        assert!(stack.contains(stack.bottom() as usize));
        assert!(!stack.contains(stack.top() as usize));
    }

    #[test]
    fn rejects_tiny_stacks() {
        assert_eq!(
            Stack::new(128).err(),
            Some(ThreadError::InvalidStackSize {
                size: 128,
                min: MIN_STACK_SIZE
            })
        );
    }
}
