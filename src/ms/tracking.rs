//! The tracking (arena) allocation policy: a bump allocator over a growing
//! list of blocks. Individual [`AllocPolicy::free`] calls are no-ops;
//! [`AllocPolicy::reset`] and [`AllocPolicy::destroy`] reclaim every block
//! at once.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

use super::policy::AllocPolicy;
use crate::error::Result;

const DEFAULT_BLOCK_SIZE: usize = 4096;

struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
    used: usize,
}

impl Block {
    fn new(size: usize) -> Option<Block> {
        let layout = Layout::from_size_align(size, std::mem::align_of::<usize>()).ok()?;
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).map(|ptr| Block { ptr, layout, used: 0 })
    }

    fn remaining(&self) -> usize {
        self.layout.size() - self.used
    }

    /// Bump-allocate `size` bytes aligned to `align` out of this block, if
    /// it fits.
    fn bump(&mut self, size: usize, align: usize) -> Option<*mut u8> {
        let base = self.ptr.as_ptr() as usize;
        let cur = base + self.used;
        let aligned = (cur + align - 1) & !(align - 1);
        let pad = aligned - cur;
        if pad + size > self.remaining() {
            return None;
        }
        self.used += pad + size;
        Some(aligned as *mut u8)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct ArenaState {
    blocks: Vec<Block>,
    block_size: usize,
}

/// A bump-allocating, tracking memory policy. Every allocation lives until
/// the owning node's `reset` or `destroy` is called.
pub struct ArenaPolicy {
    state: Mutex<ArenaState>,
}

impl ArenaPolicy {
    pub fn new() -> ArenaPolicy {
        ArenaPolicy::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> ArenaPolicy {
        ArenaPolicy {
            state: Mutex::new(ArenaState {
                blocks: Vec::new(),
                block_size,
            }),
        }
    }
}

impl Default for ArenaPolicy {
    fn default() -> Self {
        ArenaPolicy::new()
    }
}

impl AllocPolicy for ArenaPolicy {
    unsafe fn malloc(&self, layout: Layout) -> *mut u8 {
        let mut state = self.state.lock().unwrap();
        if let Some(last) = state.blocks.last_mut() {
            if let Some(ptr) = last.bump(layout.size(), layout.align()) {
                return ptr;
            }
        }
        let block_size = state.block_size.max(layout.size() + layout.align());
        let mut block = match Block::new(block_size) {
            Some(b) => b,
            None => return std::ptr::null_mut(),
        };
        let ptr = block.bump(layout.size(), layout.align());
        state.blocks.push(block);
        ptr.unwrap_or(std::ptr::null_mut())
    }

    unsafe fn free(&self, _ptr: *mut u8) -> Result<()> {
        // Individual frees are no-ops in a tracking policy by definition.
        Ok(())
    }

    fn is_tracking(&self) -> bool {
        true
    }

    fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.blocks.clear();
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.state.lock().unwrap().blocks.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocates_distinct_regions() {
        let policy = ArenaPolicy::with_block_size(64);
        let layout = Layout::from_size_align(16, 8).unwrap();
        unsafe {
            let a = policy.malloc(layout);
            let b = policy.malloc(layout);
            assert!(!a.is_null());
            assert!(!b.is_null());
            assert_ne!(a, b);
        }
    }

    #[test]
    fn grows_past_one_block() {
        let policy = ArenaPolicy::with_block_size(16);
        let layout = Layout::from_size_align(32, 8).unwrap();
        unsafe {
            let a = policy.malloc(layout);
            assert!(!a.is_null());
        }
        assert_eq!(policy.state.lock().unwrap().blocks.len(), 1);
    }

    #[test]
    fn reset_reclaims_everything() {
        let policy = ArenaPolicy::new();
        let layout = Layout::from_size_align(32, 8).unwrap();
        unsafe {
            policy.malloc(layout);
        }
        assert!(!policy.state.lock().unwrap().blocks.is_empty());
        policy.reset().unwrap();
        assert!(policy.state.lock().unwrap().blocks.is_empty());
    }
}
