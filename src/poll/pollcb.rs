//! The ring-free, one-shot-callback sibling of [`super::PollSet`].
//!
//! Grounded on `apr_pollcb_t` in `poll/unix/port.c`: where `apr_pollset_t`
//! buffers add/remove through pending rings so a caller can safely mutate
//! the set from inside its own poll loop, `apr_pollcb_t` applies every
//! `add`/`remove` to the kernel immediately and hands fired events to a
//! caller-supplied callback one at a time instead of returning them as a
//! batch. Useful when the caller already has a natural per-event dispatch
//! point and doesn't want the extra bookkeeping `PollSet` carries for it.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::os::fd::RawFd;
use std::time::Duration;

use super::sys::Selector;
use super::{DescriptorKind, Interest, Token};
use crate::error::{Result, Status};

/// One fired event, handed to the callback passed to [`PollCb::poll`].
#[derive(Clone, Copy, Debug)]
pub struct PollCbEvent {
    pub token: Token,
    pub interest: Interest,
}

#[derive(Clone, Copy)]
struct Registered {
    fd: RawFd,
    kind: DescriptorKind,
    interest: Interest,
}

/// A callback-driven poll set with no ring indirection: `add`/`remove` take
/// effect immediately.
pub struct PollCb {
    selector: Selector,
    registered: HashMap<Token, Registered>,
}

impl PollCb {
    /// Create a callback poll set sized for roughly `hint` concurrent
    /// registrations.
    pub fn new(hint: usize) -> Result<PollCb> {
        Ok(PollCb {
            selector: Selector::new()?,
            registered: HashMap::with_capacity(hint),
        })
    }

    /// Register `fd` under `token` for `interest`, associating with the
    /// kernel immediately.
    pub fn add(&mut self, fd: RawFd, kind: DescriptorKind, interest: Interest, token: Token) -> Result<()> {
        self.selector.associate(fd, kind, interest, token)?;
        self.registered.insert(token, Registered { fd, kind, interest });
        Ok(())
    }

    /// Remove a registration, dissociating from the kernel immediately.
    pub fn remove(&mut self, token: Token) -> Result<()> {
        match self.registered.remove(&token) {
            Some(reg) => self.selector.dissociate(reg.fd),
            None => {
                log::warn!("PollCb::remove({token:?}) had no matching registration");
                Err(Status::NotFound)
            }
        }
    }

    /// Block up to `timeout` for events, invoking `callback` once per fired
    /// registration (most recently fired first is not guaranteed; order
    /// follows whatever the kernel returned). Returns the number of
    /// callback invocations, or [`Status::TimedUp`] if none fired.
    ///
    /// `callback` returning [`ControlFlow::Break`] stops processing the rest
    /// of this batch immediately and is propagated as this call's error,
    /// matching `apr_pollcb_poll`'s `if (rv = func(...)) return rv;` early
    /// return. Any events still left in the batch at that point are neither
    /// delivered nor re-armed - the same batch-truncation the original
    /// exhibits, not something this crate papers over.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        mut callback: impl FnMut(PollCbEvent) -> ControlFlow<Status>,
    ) -> Result<usize> {
        let raw = self.selector.wait(timeout)?;
        let mut fired = 0;
        for (token, interest) in raw {
            let Some(reg) = self.registered.get(&token).copied() else {
                continue;
            };
            let flow = callback(PollCbEvent { token, interest });
            fired += 1;
            // Event ports are one-shot; re-arm so this registration keeps
            // firing on subsequent polls, matching `PollSet`'s behavior.
            self.selector.associate(reg.fd, reg.kind, reg.interest, token)?;
            if let ControlFlow::Break(status) = flow {
                return Err(status);
            }
        }
        if fired == 0 {
            Err(Status::TimedUp)
        } else {
            Ok(fired)
        }
    }
}
