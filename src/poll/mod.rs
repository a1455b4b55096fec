//! A ring-backed poll set over a kernel readiness-notification mechanism.
//!
//! Mirrors `apr_pollset_t`: descriptors are added and removed against a set
//! of pending rings rather than the kernel directly, so that `add`/`remove`
//! can be called freely (including from inside a callback driven by the
//! results of [`PollSet::poll`]) without racing the in-flight `port_getn`
//! call. [`PollCb`] is the one-shot sibling API that skips the rings
//! entirely, mirroring `apr_pollcb_t`.

mod pollcb;
mod ring;
mod sys;
mod waker;

pub use pollcb::{PollCb, PollCbEvent};

use std::ffi::c_void;
use std::os::fd::RawFd;
use std::sync::Arc;

use ring::Rings;
use sys::Selector;
use waker::Awakener;

use crate::error::{Result, Status};
use crate::ms::MemorySystem;

/// Which readiness conditions a registration cares about, and which fired.
/// Mirrors the `APR_POLLIN`/`APR_POLLOUT`/`APR_POLLERR`/`APR_POLLHUP`
/// bitmask, minus `APR_POLLPRI`/`APR_POLLNVAL`, which no supported backend
/// here ever produces.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b001);
    pub const WRITABLE: Interest = Interest(0b010);
    /// Set on returned events only; never meaningful to request.
    pub const ERROR: Interest = Interest(0b100);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// Which kind of object a descriptor is, matching `apr_datatype_e`'s
/// `APR_POLL_SOCKET`/`APR_POLL_FILE` split: the real backend associates
/// sockets and files through the same event-port call, but callers often
/// need to tell them apart when an event fires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescriptorKind {
    Socket,
    File,
}

/// Caller-chosen correlation handle, returned on every event fired for the
/// registration it names. Stable for the lifetime of the registration;
/// reused only after the registration has been fully removed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Token(pub u64);

/// One readiness notification returned from [`PollSet::poll`].
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub token: Token,
    pub interest: Interest,
}

/// How a registration was last told to the kernel, for the ring state
/// machine: `Pending` entries need a `port_associate` (or dissociate) call
/// applied before the next `port_getn`; `Active` entries are currently
/// associated; `Dead` entries were dissociated this cycle and are held back
/// from reuse until the in-flight `port_getn` that might still reference
/// their token has returned.
#[derive(Clone, Copy, Eq, PartialEq)]
enum SlotState {
    PendingAdd,
    Active,
    PendingRemove,
    Dead,
}

#[derive(Clone, Copy)]
struct Registration {
    fd: RawFd,
    kind: DescriptorKind,
    interest: Interest,
    token: Token,
    state: SlotState,
}

/// A set of descriptors polled together against a kernel event source.
pub struct PollSet {
    selector: Arc<Selector>,
    rings: Rings,
    wakeable: bool,
    awakener: Option<Arc<Awakener>>,
    wakeup_token: Option<Token>,
}

/// The handles a [`PollSet::create`] cleanup needs to release, leaked across
/// the FFI-shaped cleanup boundary as a raw pointer and reconstructed when
/// the cleanup runs.
struct PollSetCleanup {
    selector: Arc<Selector>,
    awakener: Option<Arc<Awakener>>,
}

fn run_poll_set_cleanup(data: *mut c_void) -> Result<()> {
    drop(unsafe { Box::from_raw(data as *mut PollSetCleanup) });
    Ok(())
}

impl PollSet {
    /// Create a poll set sized for roughly `hint` concurrent registrations.
    /// `hint` is advisory; the set grows past it as needed.
    pub fn new(hint: usize) -> Result<PollSet> {
        PollSet::with_wakeup(hint, false)
    }

    /// Like [`PollSet::new`], additionally arming [`PollSet::wakeup`].
    pub fn with_wakeup(hint: usize, wakeable: bool) -> Result<PollSet> {
        let selector = Selector::new()?;
        let mut rings = Rings::with_capacity(hint);

        let (awakener, wakeup_token) = if wakeable {
            let awakener = Awakener::new()?;
            let token = rings.next_token();
            rings.insert(Registration {
                fd: awakener.read_fd(),
                kind: DescriptorKind::File,
                interest: Interest::READABLE,
                token,
                state: SlotState::PendingAdd,
            });
            (Some(awakener), Some(token))
        } else {
            (None, None)
        };

        Ok(PollSet {
            selector: Arc::new(selector),
            rings,
            wakeable,
            awakener: awakener.map(Arc::new),
            wakeup_token,
        })
    }

    /// Like [`PollSet::with_wakeup`], additionally registering a cleanup on
    /// `ms` so that destroying it tears this poll set down: the underlying
    /// event port (and wakeup pipe, if any) are closed once both `ms` and
    /// this `PollSet` have released their reference, whichever happens
    /// last. The poll set returned here is otherwise identical to one from
    /// `with_wakeup` and can still be dropped normally by the caller.
    pub fn create(hint: usize, ms: &MemorySystem, wakeable: bool) -> Result<PollSet> {
        let set = PollSet::with_wakeup(hint, wakeable)?;
        let cleanup = Box::new(PollSetCleanup {
            selector: Arc::clone(&set.selector),
            awakener: set.awakener.clone(),
        });
        let data = Box::into_raw(cleanup) as *mut c_void;
        ms.register_cleanup(0, data, run_poll_set_cleanup);
        Ok(set)
    }

    /// Register `fd` for `interest`, returning the [`Token`] future events
    /// for it will carry. The registration isn't told to the kernel until
    /// the next [`PollSet::poll`] call.
    pub fn add(&mut self, fd: RawFd, kind: DescriptorKind, interest: Interest) -> Result<Token> {
        if interest.is_empty() {
            return Err(Status::InvalidArgument);
        }
        let token = self.rings.next_token();
        self.rings.insert(Registration {
            fd,
            kind,
            interest,
            token,
            state: SlotState::PendingAdd,
        });
        Ok(token)
    }

    /// Remove a previously added registration. Takes effect at the start of
    /// the next [`PollSet::poll`] call, same as `add`.
    pub fn remove(&mut self, token: Token) -> Result<()> {
        let result = self.rings.mark_pending_remove(token);
        if let Err(ref e) = result {
            log::warn!("PollSet::remove({token:?}) failed: {e}");
        }
        result
    }

    /// Block up to `timeout` (`None` meaning forever) for at least one
    /// descriptor to become ready, applying any pending adds/removes first.
    /// Returns [`Status::TimedUp`] if nothing fired before the timeout, and
    /// [`Status::Interrupted`] if a concurrent [`PollSet::wakeup`] call
    /// interrupted the wait instead.
    pub fn poll(&mut self, timeout: Option<std::time::Duration>) -> Result<Vec<Event>> {
        self.rings.reclaim_dead();

        for reg in self.rings.drain_pending_remove() {
            self.selector.dissociate(reg.fd)?;
        }
        for reg in self.rings.pending_add_mut() {
            self.selector.associate(reg.fd, reg.kind, reg.interest, reg.token)?;
            reg.state = SlotState::Active;
        }

        let raw = self.selector.wait(timeout)?;

        let mut out = Vec::with_capacity(raw.len());
        let mut interrupted = false;
        for (token, interest) in raw {
            if let Some(reg) = self.rings.get_mut(token) {
                // Event ports are one-shot: re-arm so this descriptor keeps
                // reporting readiness on subsequent polls - including the
                // wakeup pipe's read end, so repeated wakeups keep working.
                self.selector.associate(reg.fd, reg.kind, reg.interest, reg.token)?;
                if Some(token) == self.wakeup_token {
                    if let Some(awakener) = &self.awakener {
                        awakener.drain();
                    }
                    log::trace!("PollSet::poll interrupted by a wakeup");
                    interrupted = true;
                    continue;
                }
                out.push(Event { token, interest });
            }
        }

        if interrupted {
            Err(Status::Interrupted)
        } else if out.is_empty() {
            Err(Status::TimedUp)
        } else {
            Ok(out)
        }
    }

    /// Interrupt a concurrent or subsequent [`PollSet::poll`] call. Requires
    /// the set to have been created with [`PollSet::with_wakeup`] or
    /// [`PollSet::create`] with `wakeable` set.
    pub fn wakeup(&self) -> Result<()> {
        match &self.awakener {
            Some(a) => a.wake(),
            None => {
                log::warn!("PollSet::wakeup called on a set that wasn't created wakeable");
                Err(Status::NotWakeable)
            }
        }
    }

    pub fn is_wakeable(&self) -> bool {
        self.wakeable
    }
}
