//! The add/remove/dead slab behind [`super::PollSet`].
//!
//! Registrations move through a small state machine (`PendingAdd` ->
//! `Active` -> `PendingRemove` -> `Dead` -> reclaimed) rather than being
//! associated with or dissociated from the kernel the instant `add`/`remove`
//! is called. This is what lets a caller add or remove descriptors from
//! inside the loop driven by [`super::PollSet::poll`]'s own results without
//! racing the in-flight kernel call: the `Dead` stage holds a slot's index
//! out of reuse for exactly one extra poll cycle, the same guard the
//! original's free ring gives against handing out a token that might still
//! be referenced by events the kernel queued before the dissociate.

use std::collections::VecDeque;

use crate::error::{Result, Status};

use super::{Registration, SlotState, Token};

enum Slot {
    Empty,
    Occupied(Registration),
}

pub(crate) struct Rings {
    slab: Vec<Slot>,
    free: VecDeque<u64>,
}

impl Rings {
    pub(crate) fn with_capacity(hint: usize) -> Rings {
        Rings { slab: Vec::with_capacity(hint), free: VecDeque::new() }
    }

    /// Reserve a slot and return its token. The slot stays `Empty` until
    /// [`Rings::insert`] fills it in.
    pub(crate) fn next_token(&mut self) -> Token {
        if let Some(idx) = self.free.pop_front() {
            Token(idx)
        } else {
            let idx = self.slab.len() as u64;
            self.slab.push(Slot::Empty);
            Token(idx)
        }
    }

    pub(crate) fn insert(&mut self, reg: Registration) {
        self.slab[reg.token.0 as usize] = Slot::Occupied(reg);
    }

    /// A live (not pending-remove, not dead) registration by token.
    pub(crate) fn get_mut(&mut self, token: Token) -> Option<&mut Registration> {
        match self.slab.get_mut(token.0 as usize) {
            Some(Slot::Occupied(r)) if matches!(r.state, SlotState::Active) => Some(r),
            _ => None,
        }
    }

    pub(crate) fn mark_pending_remove(&mut self, token: Token) -> Result<()> {
        match self.slab.get_mut(token.0 as usize) {
            Some(Slot::Occupied(r)) if !matches!(r.state, SlotState::PendingRemove | SlotState::Dead) => {
                r.state = SlotState::PendingRemove;
                Ok(())
            }
            _ => Err(Status::NotFound),
        }
    }

    /// Every slot still waiting on its first `port_associate`, so
    /// [`super::PollSet::poll`] can apply it and flip the slot to `Active`.
    pub(crate) fn pending_add_mut(&mut self) -> impl Iterator<Item = &mut Registration> {
        self.slab.iter_mut().filter_map(|s| match s {
            Slot::Occupied(r) if matches!(r.state, SlotState::PendingAdd) => Some(r),
            _ => None,
        })
    }

    /// Every slot marked for removal since the last poll. Flips them to
    /// `Dead` in place (the slab keeps the entry, just inert) and hands
    /// back copies so the caller can dissociate each one from the kernel.
    pub(crate) fn drain_pending_remove(&mut self) -> Vec<Registration> {
        let mut out = Vec::new();
        for slot in self.slab.iter_mut() {
            if let Slot::Occupied(r) = slot {
                if matches!(r.state, SlotState::PendingRemove) {
                    r.state = SlotState::Dead;
                    out.push(*r);
                }
            }
        }
        out
    }

    /// Return every `Dead` slot's index to the free list. Called at the
    /// start of a poll cycle, one cycle after the slot went dead, so any
    /// `port_getn` in flight when it was dissociated has long since
    /// returned.
    pub(crate) fn reclaim_dead(&mut self) {
        for (idx, slot) in self.slab.iter_mut().enumerate() {
            if let Slot::Occupied(r) = slot {
                if matches!(r.state, SlotState::Dead) {
                    *slot = Slot::Empty;
                    self.free.push_back(idx as u64);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{DescriptorKind, Interest};

    fn reg(token: Token, state: SlotState) -> Registration {
        Registration { fd: 3, kind: DescriptorKind::Socket, interest: Interest::READABLE, token, state }
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let mut rings = Rings::with_capacity(4);
        let token = rings.next_token();
        rings.insert(reg(token, SlotState::Active));
        assert!(rings.get_mut(token).is_some());
    }

    #[test]
    fn dead_slots_are_held_back_one_cycle() {
        let mut rings = Rings::with_capacity(4);
        let token = rings.next_token();
        rings.insert(reg(token, SlotState::PendingAdd));
        rings.mark_pending_remove(token).unwrap();
        let removed = rings.drain_pending_remove();
        assert_eq!(removed.len(), 1);

        // Not reusable yet: reclaim_dead hasn't run.
        let fresh = rings.next_token();
        assert_ne!(fresh, token);

        rings.reclaim_dead();
        let reused = rings.next_token();
        assert_eq!(reused, token);
    }

    #[test]
    fn mark_pending_remove_on_unknown_token_fails() {
        let mut rings = Rings::with_capacity(4);
        assert_eq!(rings.mark_pending_remove(Token(99)).unwrap_err(), Status::NotFound);
    }
}
