#![cfg_attr(test, allow(clippy::unwrap_used))]

mod memory;
#[cfg(target_family = "unix")]
pub mod unix;
mod writer;

pub use memory::{InMemoryTun, TunTestHandle};
pub use writer::{TunWriter, spawn_writer};

use std::io;

use ip_packet::{IpPacket, MTU, ParseError};
use tokio::sync::mpsc;

/// Capacity of the bounded channels between the device and the engine.
///
/// The writer side is a single consumer so OS-level write ordering is
/// preserved; overflow applies backpressure to every producer.
pub const PACKET_CHANNEL_CAPACITY: usize = 64;

/// A platform-provided virtual network interface delivering raw IP frames,
/// already stripped of any link-layer header.
///
/// Reads and writes block; both sides of the engine drive the device from
/// dedicated blocking tasks.
pub trait TunDevice: Send + Sync + 'static {
    /// Reads one IP frame into `buf`, blocking until one is available.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes one IP frame, consumed by the platform and injected back into
    /// the local network stack.
    fn write(&self, packet: &[u8]) -> io::Result<usize>;

    /// Unblocks pending reads and releases the underlying resource.
    ///
    /// Must be idempotent; the fd-backed device closes its fd exactly once,
    /// here or on drop.
    fn shutdown(&self) {}

    /// The name of the device, for diagnostics only.
    fn name(&self) -> &str;
}

/// Spawns the blocking TUN reader task.
///
/// Parsed IPv4 packets are delivered on the returned channel. IPv6 packets
/// are dropped on ingress without side effects; frames that fail to parse are
/// dropped with a debug log.
///
/// The task exits when the receiver is dropped or the device read fails.
pub fn spawn_reader(device: std::sync::Arc<dyn TunDevice>) -> mpsc::Receiver<IpPacket> {
    let (tx, rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; MTU];

        loop {
            let n = match device.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!(device = %device.name(), "TUN device closed");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(device = %device.name(), "TUN read failed: {e}");
                    break;
                }
            };

            let packet = match IpPacket::parse(buf[..n].to_vec()) {
                Ok(packet) => packet,
                Err(ParseError::Ipv6) => continue,
                Err(e) => {
                    tracing::debug!("Dropping unparseable TUN frame: {e}");
                    continue;
                }
            };

            if tx.blocking_send(packet).is_err() {
                break;
            }
        }
    });

    rx
}
