//! An in-memory TUN device used by tests and the loopback harness.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::TunDevice;

/// How often a blocked read re-checks the shutdown flag.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A [`TunDevice`] backed by channels instead of a platform fd.
pub struct InMemoryTun {
    name: String,
    closed: AtomicBool,
    ingress: Mutex<mpsc::Receiver<Vec<u8>>>,
    egress: UnboundedSender<Vec<u8>>,
}

/// Test-side handle: inject frames "from the OS", observe frames the core
/// wrote back.
pub struct TunTestHandle {
    inject: mpsc::Sender<Vec<u8>>,
    written: tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>,
}

impl InMemoryTun {
    pub fn new(name: &str) -> (Self, TunTestHandle) {
        let (inject, ingress) = mpsc::channel();
        let (egress, written) = unbounded_channel();

        (
            Self {
                name: name.to_owned(),
                closed: AtomicBool::new(false),
                ingress: Mutex::new(ingress),
                egress,
            },
            TunTestHandle {
                inject,
                written: tokio::sync::Mutex::new(written),
            },
        )
    }
}

impl TunDevice for InMemoryTun {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let ingress = self
            .ingress
            .lock()
            .map_err(|_| io::Error::other("poisoned ingress lock"))?;

        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Ok(0);
            }

            match ingress.recv_timeout(READ_POLL_INTERVAL) {
                Ok(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);

                    return Ok(n);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        self.egress
            .send(packet.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

        Ok(packet.len())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl TunTestHandle {
    /// Delivers a frame to the core as if the OS had routed it to the TUN
    /// device.
    pub fn inject(&self, frame: Vec<u8>) -> io::Result<()> {
        self.inject
            .send(frame)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    /// The next frame the core wrote towards the OS.
    pub async fn next_written(&self) -> Option<Vec<u8>> {
        self.written.lock().await.recv().await
    }
}
