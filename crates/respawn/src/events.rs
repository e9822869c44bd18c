//! Auto-reset synchronization events for the parent/child handshake.

use std::time::Duration;

use crate::errors::RespawnResult;

/// One side of the handshake event pair. `wait` returns `Ok(false)` on
/// timeout; mapping that to a fatal error is the caller's decision.
pub trait Event {
    fn signal(&self) -> RespawnResult<()>;
    fn wait(&self, timeout: Duration) -> RespawnResult<bool>;
    /// Handle value planted into the request block so the child can adopt
    /// the inherited descriptor.
    fn raw_handle(&self) -> u64;
}

#[cfg(unix)]
pub use fd_impl::EventFd;

#[cfg(unix)]
mod fd_impl {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::time::{Duration, Instant};

    use super::Event;
    use crate::errors::RespawnResult;

    /// Auto-reset event over an `eventfd(2)` descriptor. Created without
    /// `EFD_CLOEXEC` so it survives the exec into the child; the child finds
    /// the descriptor number in the request block.
    pub struct EventFd {
        fd: OwnedFd,
    }

    impl EventFd {
        pub fn new_inheritable() -> RespawnResult<Self> {
            let raw = unsafe { libc::eventfd(0, 0) };
            if raw < 0 {
                return Err(io::Error::last_os_error().into());
            }
            // SAFETY: eventfd just returned this descriptor; we own it.
            Ok(Self {
                fd: unsafe { OwnedFd::from_raw_fd(raw) },
            })
        }

        /// Adopt an inherited descriptor on the child side. The caller must
        /// pass a handle value read from the request block of a process that
        /// actually inherited it.
        pub unsafe fn from_inherited_handle(handle: u64) -> Self {
            Self {
                fd: OwnedFd::from_raw_fd(handle as RawFd),
            }
        }
    }

    impl Event for EventFd {
        fn signal(&self) -> RespawnResult<()> {
            let value = 1u64.to_ne_bytes();
            let written = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    value.as_ptr() as *const libc::c_void,
                    value.len(),
                )
            };
            if written != value.len() as isize {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }

        fn wait(&self, timeout: Duration) -> RespawnResult<bool> {
            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let millis = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
                let mut pfd = libc::pollfd {
                    fd: self.fd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                };
                let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
                if rc == 0 {
                    return Ok(false);
                }
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    return Err(err.into());
                }
                // Consume the counter so the event auto-resets.
                let mut value = [0u8; 8];
                let read = unsafe {
                    libc::read(
                        self.fd.as_raw_fd(),
                        value.as_mut_ptr() as *mut libc::c_void,
                        value.len(),
                    )
                };
                if read != value.len() as isize {
                    return Err(io::Error::last_os_error().into());
                }
                return Ok(true);
            }
        }

        fn raw_handle(&self) -> u64 {
            self.fd.as_raw_fd() as u64
        }
    }

}
