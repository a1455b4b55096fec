//! Portable runtime core: a hierarchical memory-system allocator tree
//! ([`ms`]) and a ring-backed poll set over a kernel event-notification
//! mechanism ([`poll`]).
//!
//! The two modules are largely independent, but [`poll::PollSet::create`]
//! ties them together: it takes an [`ms::MemorySystem`] and registers a
//! cleanup on it so that destroying the memory system also tears the poll
//! set down. [`poll::PollSet::new`] and [`poll::PollSet::with_wakeup`] skip
//! that coupling for callers who want a poll set with no memory system in
//! the picture at all.

#[macro_use]
mod macros;

pub mod error;
pub mod ms;
pub mod poll;

pub use error::Status;
