//! TUN device backed by a platform-provided file descriptor.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::TunDevice;

const CLOSED: RawFd = -1;

/// Owns the raw fd handed over by the platform's VPN service.
///
/// The fd is closed exactly once: on [`TunDevice::shutdown`] or on drop,
/// whichever comes first. Closing it also unblocks the reader thread.
pub struct FdTun {
    fd: AtomicI32,
    name: String,
}

impl FdTun {
    /// Takes ownership of `fd`; the caller must not use or close it
    /// afterwards.
    pub fn from_raw_fd(fd: RawFd, name: impl Into<String>) -> Self {
        Self {
            fd: AtomicI32::new(fd),
            name: name.into(),
        }
    }

    fn fd(&self) -> io::Result<RawFd> {
        match self.fd.load(Ordering::Acquire) {
            CLOSED => Err(io::Error::new(io::ErrorKind::NotConnected, "TUN fd closed")),
            fd => Ok(fd),
        }
    }
}

impl TunDevice for FdTun {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.fd()?;

        loop {
            // Safety: `buf` outlives the call and the fd is ours until
            // shutdown.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };

            if n >= 0 {
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();

            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }

            return Err(err);
        }
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        let fd = self.fd()?;

        loop {
            // Safety: `packet` outlives the call and the fd is ours until
            // shutdown.
            let n = unsafe { libc::write(fd, packet.as_ptr() as *const _, packet.len()) };

            if n >= 0 {
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();

            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }

            return Err(err);
        }
    }

    fn shutdown(&self) {
        let fd = self.fd.swap(CLOSED, Ordering::AcqRel);

        if fd != CLOSED {
            // Safety: the swap guarantees a single close.
            unsafe { libc::close(fd) };
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for FdTun {
    fn drop(&mut self) {
        self.shutdown();
    }
}
