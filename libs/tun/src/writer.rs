use std::sync::Arc;

use anyhow::{Context as _, Result};
use ip_packet::IpPacket;
use tokio::sync::mpsc;

use crate::{PACKET_CHANNEL_CAPACITY, TunDevice};

/// Sending half of the serialised TUN write path.
///
/// Cheap to clone; every subsystem that synthesises packets towards the
/// client holds one.
#[derive(Clone)]
pub struct TunWriter {
    tx: mpsc::Sender<IpPacket>,
}

impl TunWriter {
    /// Queues a packet for the device, applying backpressure when the
    /// channel is full.
    pub async fn send(&self, packet: IpPacket) -> Result<()> {
        self.tx
            .send(packet)
            .await
            .context("TUN writer has shut down")?;

        Ok(())
    }
}

/// Spawns the single-consumer TUN writer task.
///
/// A single consumer guarantees OS-level write ordering across all
/// producers. The task exits when every [`TunWriter`] clone is dropped or a
/// device write fails.
pub fn spawn_writer(device: Arc<dyn TunDevice>) -> TunWriter {
    let (tx, mut rx) = mpsc::channel::<IpPacket>(PACKET_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        while let Some(packet) = rx.blocking_recv() {
            if let Err(e) = device.write(packet.as_bytes()) {
                tracing::debug!(device = %device.name(), "TUN write failed: {e}");
                break;
            }
        }
    });

    TunWriter { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryTun;
    use ip_packet::make::{self, TcpFlags};
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[tokio::test]
    async fn writes_are_ordered() {
        let (device, handle) = InMemoryTun::new("test0");
        let writer = spawn_writer(Arc::new(device));

        for seq in 0..10u32 {
            let packet = make::tcp(
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1),
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2),
                seq,
                0,
                TcpFlags::ACK,
                1024,
                b"",
            )
            .unwrap();

            writer.send(packet).await.unwrap();
        }

        for seq in 0..10u32 {
            let frame = handle.next_written().await.unwrap();
            let packet = IpPacket::parse(frame).unwrap();

            assert_eq!(packet.as_tcp().unwrap().sequence_number(), seq);
        }
    }
}
