//! Interrupting a blocked [`super::PollSet::poll`] call.
//!
//! Grounded on `create_wakeup_pipe`/`drain_wakeup_pipe`/`apr_pollset_wakeup`
//! in `poll/unix/port.c`: a self-connected `pipe(2)`, whose read end is
//! registered in the poll set like any other descriptor and whose write end
//! gets a single byte pushed onto it by `wakeup()`. `poll()` recognizes the
//! read end's token, drains whatever was written, and reports
//! [`crate::error::Status::Interrupted`] instead of handing the byte back as
//! an ordinary readiness event.

use std::os::fd::RawFd;

use crate::error::Result;

pub(crate) struct Awakener {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Awakener {
    pub(crate) fn new() -> Result<Awakener> {
        let mut fds = [0; 2];
        syscall!(pipe(fds.as_mut_ptr()))?;
        Ok(Awakener { read_fd: fds[0], write_fd: fds[1] })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Push a single byte onto the write end, waking a blocked `poll()`.
    pub(crate) fn wake(&self) -> Result<()> {
        let byte = [1u8];
        syscall!(write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1))?;
        Ok(())
    }

    /// Drain everything sitting on the read end after a wakeup fired, so it
    /// doesn't immediately fire again on the next poll. Mirrors
    /// `drain_wakeup_pipe`'s read-until-short-read loop.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 128];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < buf.len() as isize {
                break;
            }
        }
    }
}

impl Drop for Awakener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
