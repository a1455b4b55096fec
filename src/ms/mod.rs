//! The Memory System: a tree of allocator nodes, each carrying its own
//! [`AllocPolicy`], an optional accounting target, and a cleanup registry
//! that runs on reset and destroy.
//!
//! Modeled on `apr_sms_t`, but the intrusive parent/child/sibling/ref
//! pointers of the original become an [`Arc`]-owned tree: a parent holds a
//! strong reference to each child, a child holds a [`Weak`] reference back to
//! its parent, and "accounting" — which node's bookkeeping a descendant's
//! allocations are charged against — is a small enum instead of a raw
//! back-pointer. See `DESIGN.md` for the reasoning.

mod cleanup;
mod non_tracking;
mod policy;
mod tracking;

pub use non_tracking::SystemPolicy;
pub use policy::AllocPolicy;
pub use tracking::ArenaPolicy;

use std::alloc::Layout;
use std::ffi::c_void;
use std::sync::{Arc, Condvar, Mutex, Weak};

use cleanup::{CleanupList, ALL_CLEANUPS as CLEANUP_ALL_TYPES};
pub use cleanup::CleanupFn;

use crate::error::{Result, Status};

/// Default alignment used for allocations made through the byte-count API
/// ([`MemorySystem::malloc`], [`MemorySystem::calloc`]); matches the
/// alignment a general-purpose `malloc` guarantees.
const DEFAULT_ALIGN: usize = 16;

/// Which node's bookkeeping this node's allocations are charged against.
///
/// `SelfAccounting` is the common case: the node pays for its own overhead.
/// `Child` names one of this node's own direct children as the accounting
/// delegate instead - the invariant carried over from the original is
/// `accounting == self || accounting.parent == self`, never an arbitrary
/// other node in the tree. Destroying a node whose accounting points at a
/// child destroys that child too, last, after every other child and the
/// node's own cleanups.
#[derive(Clone)]
enum Accounting {
    SelfAccounting,
    Child(Arc<Inner>),
}

struct UserLock {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl UserLock {
    fn new() -> Self {
        UserLock { locked: Mutex::new(false), cv: Condvar::new() }
    }

    fn lock(&self) {
        let mut guard = self.locked.lock().unwrap();
        while *guard {
            guard = self.cv.wait(guard).unwrap();
        }
        *guard = true;
    }

    fn unlock(&self) {
        let mut guard = self.locked.lock().unwrap();
        *guard = false;
        self.cv.notify_one();
    }
}

struct Tree {
    parent: Option<Weak<Inner>>,
    children: Vec<Arc<Inner>>,
    destroyed: bool,
}

struct Inner {
    policy: Box<dyn AllocPolicy>,
    accounting: Mutex<Accounting>,
    cleanups: Mutex<CleanupList>,
    user_lock: UserLock,
    tree: Mutex<Tree>,
}

/// A node in the memory-system tree.
///
/// Cloning a `MemorySystem` clones the handle, not the node: both handles
/// refer to the same underlying allocator and tree position, the same way
/// copying an `apr_sms_t *` did.
#[derive(Clone)]
pub struct MemorySystem {
    inner: Arc<Inner>,
}

impl MemorySystem {
    fn new_node(policy: Box<dyn AllocPolicy>, parent: Option<&MemorySystem>) -> MemorySystem {
        let inner = Arc::new(Inner {
            policy,
            accounting: Mutex::new(Accounting::SelfAccounting),
            cleanups: Mutex::new(CleanupList::new()),
            user_lock: UserLock::new(),
            tree: Mutex::new(Tree {
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                children: Vec::new(),
                destroyed: false,
            }),
        });

        if let Some(parent) = parent {
            parent.inner.tree.lock().unwrap().children.push(Arc::clone(&inner));
        }

        MemorySystem { inner }
    }

    /// A root tracking (arena) memory system: fast bump allocation, no
    /// individual frees, reclaimed wholesale by [`MemorySystem::reset`] or
    /// [`MemorySystem::destroy`].
    pub fn root_tracking() -> MemorySystem {
        MemorySystem::new_node(Box::new(ArenaPolicy::new()), None)
    }

    /// Like [`MemorySystem::root_tracking`] with a custom arena block size.
    pub fn root_tracking_with_block_size(block_size: usize) -> MemorySystem {
        MemorySystem::new_node(Box::new(ArenaPolicy::with_block_size(block_size)), None)
    }

    /// A root non-tracking memory system: every allocation must be freed
    /// individually through the system allocator.
    pub fn root_non_tracking() -> MemorySystem {
        MemorySystem::new_node(Box::new(SystemPolicy::new()), None)
    }

    /// A tracking child of `self`, self-accounted.
    pub fn new_tracking_child(&self) -> MemorySystem {
        MemorySystem::new_node(Box::new(ArenaPolicy::new()), Some(self))
    }

    /// A non-tracking child of `self`, self-accounted.
    pub fn new_non_tracking_child(&self) -> MemorySystem {
        MemorySystem::new_node(Box::new(SystemPolicy::new()), Some(self))
    }

    /// A child of `self` using a caller-supplied, self-accounted policy.
    pub fn new_child_with_policy(&self, policy: Box<dyn AllocPolicy>) -> MemorySystem {
        MemorySystem::new_node(policy, Some(self))
    }

    /// Create a new child of `self` and promote it to `self`'s accounting
    /// delegate: `self`'s own cleanup-node bookkeeping is now charged
    /// against the returned node instead of `self`. Mirrors how an sms
    /// module carves out an administrative child and assigns
    /// `accounting = child` instead of leaving it self-accounted; the
    /// invariant `accounting == self || accounting.parent == self` means
    /// the delegate can only ever be a direct child, never an arbitrary
    /// other node in the tree.
    pub fn new_accounting_child(&self, policy: Box<dyn AllocPolicy>) -> MemorySystem {
        let child = MemorySystem::new_node(policy, Some(self));
        *self.inner.accounting.lock().unwrap() = Accounting::Child(Arc::clone(&child.inner));
        child
    }

    fn layout_for(size: usize) -> Layout {
        Layout::from_size_align(size, DEFAULT_ALIGN).expect("size does not overflow isize")
    }

    /// Allocate `size` bytes. Matches `apr_sms_malloc`: a `size` of zero
    /// always succeeds with a null pointer, never an error.
    pub fn malloc(&self, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Ok(std::ptr::null_mut());
        }
        let layout = Self::layout_for(size);
        let ptr = unsafe { self.inner.policy.malloc(layout) };
        if ptr.is_null() {
            Err(Status::NoMem)
        } else {
            Ok(ptr)
        }
    }

    /// Allocate and zero-fill `size` bytes. Same zero-size contract as
    /// [`MemorySystem::malloc`].
    pub fn calloc(&self, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Ok(std::ptr::null_mut());
        }
        let layout = Self::layout_for(size);
        let ptr = unsafe { self.inner.policy.calloc(layout) };
        if ptr.is_null() {
            Err(Status::NoMem)
        } else {
            Ok(ptr)
        }
    }

    /// Resize a previous allocation from this node. `ptr` null behaves like
    /// `malloc`; `new_size` zero frees `ptr` and returns null, matching
    /// `apr_sms_realloc`'s documented realloc/malloc/free unification.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have come from this same node's `malloc`/`calloc`.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> Result<*mut u8> {
        if ptr.is_null() {
            return self.malloc(new_size);
        }
        if new_size == 0 {
            self.free(ptr)?;
            return Ok(std::ptr::null_mut());
        }
        match self.inner.policy.realloc(ptr, new_size) {
            Some(p) if !p.is_null() => Ok(p),
            Some(_) => Err(Status::NoMem),
            None => Err(Status::NotImplemented),
        }
    }

    /// Free a single allocation from this node. `ptr` null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have come from this same node's `malloc`/`calloc`.
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        self.inner.policy.free(ptr)
    }

    /// Whether this node's policy is tracking (arena-style).
    pub fn is_tracking(&self) -> bool {
        self.inner.policy.is_tracking()
    }

    /// The node this one's bookkeeping is charged against: itself unless
    /// promoted via [`MemorySystem::new_accounting_child`] to delegate to
    /// one of its own children.
    pub fn accounting(&self) -> MemorySystem {
        match &*self.inner.accounting.lock().unwrap() {
            Accounting::SelfAccounting => self.clone(),
            Accounting::Child(inner) => MemorySystem { inner: Arc::clone(inner) },
        }
    }

    /// Register a cleanup, run (LIFO, alongside every other registered
    /// cleanup) on [`MemorySystem::reset`] or [`MemorySystem::destroy`].
    pub fn register_cleanup(&self, cleanup_type: i32, data: *mut c_void, f: CleanupFn) {
        self.inner.cleanups.lock().unwrap().register(cleanup_type, data, f);
    }

    /// Remove a previously registered cleanup without running it.
    pub fn unregister_cleanup(&self, cleanup_type: i32, data: *mut c_void, f: CleanupFn) -> Result<()> {
        self.inner.cleanups.lock().unwrap().unregister(cleanup_type, data, f)
    }

    /// Remove every cleanup of `cleanup_type` without running them. Pass
    /// [`MemorySystem::ALL_CLEANUPS`] to clear the whole registry.
    pub fn unregister_cleanup_type(&self, cleanup_type: i32) -> Result<()> {
        self.inner.cleanups.lock().unwrap().unregister_type(cleanup_type)
    }

    /// Matches any cleanup type, for the unregister/run "all types" calls.
    pub const ALL_CLEANUPS: i32 = CLEANUP_ALL_TYPES;

    /// Find, remove and invoke one matching cleanup immediately, returning
    /// whatever status it reports. [`Status::InvalidArgument`] if nothing
    /// matched.
    pub fn run_cleanup(&self, cleanup_type: i32, data: *mut c_void, f: CleanupFn) -> Result<()> {
        let found = self.inner.cleanups.lock().unwrap().take_one(cleanup_type, data, f);
        match found {
            Some(f) => f(data),
            None => Err(Status::InvalidArgument),
        }
    }

    /// Find, remove and invoke every cleanup of `cleanup_type` immediately,
    /// most recently registered first. Runs every match even if an earlier
    /// one reports failure, returning the first failure seen (if any), same
    /// as [`MemorySystem::destroy`]'s best-effort cleanup sweep.
    pub fn run_cleanup_type(&self, cleanup_type: i32) -> Result<()> {
        let matches = self.inner.cleanups.lock().unwrap().take_all_of_type(cleanup_type);
        if matches.is_empty() {
            return Err(Status::InvalidArgument);
        }
        let mut first_err = None;
        for (f, data) in matches {
            if let Err(e) = f(data) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn run_all_cleanups(&self) {
        let drained = self.inner.cleanups.lock().unwrap().drain_all();
        for (f, data) in drained {
            if let Err(e) = f(data) {
                log::warn!("cleanup on memory system {:#x} failed: {e}", self.identity());
            }
        }
    }

    /// Reclaim every allocation made directly through this node, tearing
    /// down (but not destroying) every descendant along the way: each
    /// child's own subtree is processed depth-first, running its cleanups
    /// and `pre_destroy` hook, before it is detached - mirroring
    /// `apr_sms_do_child_cleanups` folded into `apr_sms_reset`. Only a
    /// tracking (arena) policy supports this; a non-tracking node's `reset`
    /// always fails with [`Status::NotImplemented`], matching
    /// `apr_sms_default_reset`'s behavior for non-tracking systems.
    pub fn reset(&self) -> Result<()> {
        if !self.is_tracking() {
            return Err(Status::NotImplemented);
        }

        let children = std::mem::take(&mut self.inner.tree.lock().unwrap().children);
        for child in &children {
            MemorySystem { inner: Arc::clone(child) }.teardown_for_reset();
        }

        self.run_all_cleanups();
        *self.inner.accounting.lock().unwrap() = Accounting::SelfAccounting;
        self.inner.policy.reset()
    }

    /// Depth-first teardown of a descendant being discarded by an ancestor's
    /// `reset`: its own descendants first, then its cleanups, then its
    /// `pre_destroy` hook. The policy itself is never explicitly destroyed
    /// here; dropping the last `Arc` reference reclaims its storage along
    /// with the rest of the abandoned subtree.
    fn teardown_for_reset(&self) {
        let children = std::mem::take(&mut self.inner.tree.lock().unwrap().children);
        for child in &children {
            MemorySystem { inner: Arc::clone(child) }.teardown_for_reset();
        }
        self.run_all_cleanups();
        if let Err(e) = self.inner.policy.pre_destroy() {
            log::warn!("memory system {:#x} pre_destroy failed during reset: {e}", self.identity());
        }
        self.inner.tree.lock().unwrap().destroyed = true;
    }

    /// Whether `self` is an ancestor of (or identical to) `other`.
    pub fn is_ancestor(&self, other: &MemorySystem) -> bool {
        let mut cur = Arc::clone(&other.inner);
        loop {
            if Arc::ptr_eq(&cur, &self.inner) {
                return true;
            }
            let next = cur.tree.lock().unwrap().parent.as_ref().and_then(Weak::upgrade);
            match next {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }

    /// This node's parent, if any.
    pub fn parent(&self) -> Option<MemorySystem> {
        self.inner
            .tree
            .lock()
            .unwrap()
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| MemorySystem { inner })
    }

    /// A stable, comparable identity for this node. Two handles to the same
    /// node always report the same identity.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Acquire this node's advisory lock, blocking until available.
    /// Independent of the structural tree lock used internally; this is a
    /// plain user-visible mutex, exposed with explicit acquire/release
    /// rather than RAII to mirror `apr_sms_lock`/`apr_sms_unlock`.
    pub fn lock(&self) {
        self.inner.user_lock.lock();
    }

    /// Release this node's advisory lock.
    pub fn unlock(&self) {
        self.inner.user_lock.unlock();
    }

    /// Tear this node down: children are destroyed first (post-order, deepest
    /// first), then this node's own cleanups run LIFO, then its policy is
    /// destroyed. If this node is the accounting target for other live
    /// nodes, those are destroyed right alongside it, since their
    /// bookkeeping has nowhere left to live.
    ///
    /// Idempotent: destroying an already-destroyed node is a no-op success.
    pub fn destroy(&self) -> Result<()> {
        self.destroy_inner(true)
    }

    fn destroy_inner(&self, unlink_from_parent: bool) -> Result<()> {
        let children = {
            let mut tree = self.inner.tree.lock().unwrap();
            if tree.destroyed {
                return Ok(());
            }
            tree.destroyed = true;
            std::mem::take(&mut tree.children)
        };

        // A non-tracking node whose accounting has been delegated to one of
        // its own children destroys every other child first, then itself,
        // then that delegate last - its cleanup-node bookkeeping has nowhere
        // left to live once `self` is gone. A tracking node's accounting
        // child, if any, is destroyed along with the rest uniformly.
        let accounting_child = match &*self.inner.accounting.lock().unwrap() {
            Accounting::Child(inner) if !self.is_tracking() => Some(Arc::clone(inner)),
            _ => None,
        };

        for child in &children {
            if let Some(acct) = &accounting_child {
                if Arc::ptr_eq(child, acct) {
                    continue;
                }
            }
            MemorySystem { inner: Arc::clone(child) }.destroy_inner(false)?;
        }

        log::trace!(
            "destroying memory system {:#x} (tracking = {})",
            self.identity(),
            self.is_tracking()
        );
        self.run_all_cleanups();

        if let Some(acct) = accounting_child {
            log::debug!(
                "memory system {:#x} is non-tracking with accounting delegated to a child; destroying it last",
                self.identity()
            );
            MemorySystem { inner: acct }.destroy_inner(false)?;
        }
        *self.inner.accounting.lock().unwrap() = Accounting::SelfAccounting;

        if let Err(e) = self.inner.policy.pre_destroy() {
            log::warn!("memory system {:#x} pre_destroy failed: {e}", self.identity());
            return Err(e);
        }
        if let Err(e) = self.inner.policy.destroy() {
            log::warn!("memory system {:#x} policy destroy failed: {e}", self.identity());
            return Err(e);
        }

        if unlink_from_parent {
            if let Some(parent) = self
                .inner
                .tree
                .lock()
                .unwrap()
                .parent
                .as_ref()
                .and_then(Weak::upgrade)
            {
                let mut ptree = parent.tree.lock().unwrap();
                ptree.children.retain(|c| !Arc::ptr_eq(c, &self.inner));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn malloc_zero_size_is_null_not_error() {
        let ms = MemorySystem::root_non_tracking();
        assert!(ms.malloc(0).unwrap().is_null());
    }

    #[test]
    fn tracking_roundtrip_through_reset() {
        let ms = MemorySystem::root_tracking();
        let ptr = ms.malloc(64).unwrap();
        assert!(!ptr.is_null());
        unsafe { std::ptr::write_bytes(ptr, 1, 64) };
        ms.reset().unwrap();
        let ptr2 = ms.malloc(64).unwrap();
        assert!(!ptr2.is_null());
    }

    #[test]
    fn non_tracking_reset_is_not_implemented() {
        let ms = MemorySystem::root_non_tracking();
        assert_eq!(ms.reset().unwrap_err(), Status::NotImplemented);
    }

    #[test]
    fn is_ancestor_walks_the_chain() {
        let root = MemorySystem::root_tracking();
        let mid = root.new_tracking_child();
        let leaf = mid.new_tracking_child();
        assert!(root.is_ancestor(&leaf));
        assert!(mid.is_ancestor(&leaf));
        assert!(!leaf.is_ancestor(&root));
        assert!(root.is_ancestor(&root));
    }

    #[test]
    fn destroy_runs_child_cleanups_before_parent_cleanups() {
        static ORDER: AtomicUsize = AtomicUsize::new(0);
        static PARENT_SEEN: AtomicUsize = AtomicUsize::new(0);
        static CHILD_SEEN: AtomicUsize = AtomicUsize::new(0);

        fn mark_parent(_: *mut c_void) -> Result<()> {
            PARENT_SEEN.store(ORDER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        }
        fn mark_child(_: *mut c_void) -> Result<()> {
            CHILD_SEEN.store(ORDER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        }

        let root = MemorySystem::root_tracking();
        let child = root.new_tracking_child();
        root.register_cleanup(1, std::ptr::null_mut(), mark_parent);
        child.register_cleanup(1, std::ptr::null_mut(), mark_child);

        root.destroy().unwrap();

        assert!(CHILD_SEEN.load(Ordering::SeqCst) < PARENT_SEEN.load(Ordering::SeqCst));
    }

    #[test]
    fn destroy_is_idempotent() {
        let ms = MemorySystem::root_tracking();
        ms.destroy().unwrap();
        ms.destroy().unwrap();
    }

    #[test]
    fn destroying_non_tracking_node_takes_its_accounting_child_with_it_last() {
        static ORDER: AtomicUsize = AtomicUsize::new(0);
        static SELF_SEEN: AtomicUsize = AtomicUsize::new(0);
        static DELEGATE_SEEN: AtomicUsize = AtomicUsize::new(0);

        fn mark_self(_: *mut c_void) -> Result<()> {
            SELF_SEEN.store(ORDER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        }
        fn mark_delegate(_: *mut c_void) -> Result<()> {
            DELEGATE_SEEN.store(ORDER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        }

        let a = MemorySystem::root_non_tracking();
        let b = a.new_accounting_child(Box::new(ArenaPolicy::new()));
        a.register_cleanup(1, std::ptr::null_mut(), mark_self);
        b.register_cleanup(1, std::ptr::null_mut(), mark_delegate);

        assert!(!b.inner.tree.lock().unwrap().destroyed);
        a.destroy().unwrap();
        assert!(b.inner.tree.lock().unwrap().destroyed);
        assert!(SELF_SEEN.load(Ordering::SeqCst) < DELEGATE_SEEN.load(Ordering::SeqCst));
    }

    #[test]
    fn reset_tears_down_descendants_cleanups_and_detaches_them() {
        static EVENTS: AtomicUsize = AtomicUsize::new(0);
        fn touch(_: *mut c_void) -> Result<()> {
            EVENTS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        let root = MemorySystem::root_tracking();
        let child = root.new_tracking_child();
        let grandchild = child.new_tracking_child();
        root.register_cleanup(1, std::ptr::null_mut(), touch);
        child.register_cleanup(1, std::ptr::null_mut(), touch);
        grandchild.register_cleanup(1, std::ptr::null_mut(), touch);

        root.reset().unwrap();

        assert_eq!(EVENTS.load(Ordering::SeqCst), 3);
        assert!(root.inner.tree.lock().unwrap().children.is_empty());

        // The node is still usable after reset.
        let ptr = root.malloc(16).unwrap();
        assert!(!ptr.is_null());
        root.destroy().unwrap();
    }

    #[test]
    fn lock_unlock_round_trips() {
        let ms = MemorySystem::root_tracking();
        ms.lock();
        ms.unlock();
        ms.lock();
        ms.unlock();
    }
}
