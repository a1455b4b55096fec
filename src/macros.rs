//! Helper macros shared by the `poll` backends.

/// Execute a libc system call, mapping a `-1` return into `Status::Os`.
///
/// Mirrors the `syscall!` helper the teacher crate defines ahead of its
/// `sys::unix` modules for the same reason: every raw FFI call in this
/// crate has the same "-1 means check errno" shape.
#[allow(unused_macros)]
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(crate::error::Status::from(std::io::Error::last_os_error()))
        } else {
            Ok(res)
        }
    }};
}
