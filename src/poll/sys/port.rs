//! The real backend: Solaris/illumos event ports, via `port_create`,
//! `port_associate`, `port_dissociate` and `port_getn`.
//!
//! Grounded directly on `poll/unix/port.c`'s `get_event`/`get_revent`
//! translation tables. Wakeups aren't a backend concern here: the wakeup
//! pipe's read end is just another `PORT_SOURCE_FD` registration, handled
//! entirely by [`super::super::waker::Awakener`] and the poll set above this
//! one.

use std::os::fd::RawFd;
use std::time::Duration;

use libc::{c_void, port_event_t, timespec, POLLERR, POLLHUP, POLLIN, POLLOUT, PORT_SOURCE_FD};

use crate::error::{Result, Status};
use crate::poll::{DescriptorKind, Interest, Token};

/// Translate a requested [`Interest`] into the `events` bitmask
/// `port_associate` expects, matching `get_event` in the original.
fn get_event(interest: Interest) -> i32 {
    let mut events = 0;
    if interest.is_readable() {
        events |= POLLIN;
    }
    if interest.is_writable() {
        events |= POLLOUT;
    }
    events
}

/// Translate a fired `portev_events` bitmask back into an [`Interest`],
/// matching `get_revent`.
fn get_revent(events: i32) -> Interest {
    let mut interest = Interest::default();
    if events & POLLIN != 0 {
        interest |= Interest::READABLE;
    }
    if events & POLLOUT != 0 {
        interest |= Interest::WRITABLE;
    }
    if events & (POLLERR | POLLHUP) != 0 {
        interest |= Interest::ERROR;
    }
    interest
}

pub(crate) struct Selector {
    port: RawFd,
}

impl Selector {
    pub(crate) fn new() -> Result<Selector> {
        let port = syscall!(port_create())?;
        Ok(Selector { port })
    }

    pub(crate) fn associate(
        &self,
        fd: RawFd,
        _kind: DescriptorKind,
        interest: Interest,
        token: Token,
    ) -> Result<()> {
        let events = get_event(interest);
        syscall!(port_associate(
            self.port,
            PORT_SOURCE_FD,
            fd as usize,
            events,
            token.0 as *mut c_void,
        ))?;
        Ok(())
    }

    pub(crate) fn dissociate(&self, fd: RawFd) -> Result<()> {
        match syscall!(port_dissociate(self.port, PORT_SOURCE_FD, fd as usize)) {
            Ok(_) => Ok(()),
            // Already fired-and-not-rearmed is not an error here: the fd
            // is effectively already dissociated.
            Err(Status::Os(e)) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn raw_port(&self) -> RawFd {
        self.port
    }

    /// Block for events, translating the fired batch into `(Token,
    /// Interest)` pairs.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(Token, Interest)>> {
        const MAX_EVENTS: u32 = 128;
        let mut events: Vec<port_event_t> = Vec::with_capacity(MAX_EVENTS as usize);
        let mut nget: u32 = 1;

        let mut ts = timeout.map(|d| timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_mut().map_or(std::ptr::null_mut(), |t| t as *mut timespec);

        let res = unsafe {
            libc::port_getn(
                self.port,
                events.as_mut_ptr(),
                MAX_EVENTS,
                &mut nget,
                ts_ptr,
            )
        };

        if res == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ETIME) {
                return Ok(Vec::new());
            }
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(Status::from(err));
        }

        unsafe { events.set_len(nget as usize) };

        Ok(events
            .into_iter()
            .map(|ev| (Token(ev.portev_user as u64), get_revent(ev.portev_events)))
            .collect())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe { libc::close(self.port) };
    }
}
