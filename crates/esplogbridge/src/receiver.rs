// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP receiver for device log datagrams.
//!
//! Each datagram is attributed to a device by its source address, normalized into a single
//! line, stamped with the receive time and offered to the [`EventQueue`]. Datagrams from
//! unknown addresses, or that normalize to nothing, are dropped silently.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::devices::DeviceRegistry;
use crate::errors::BridgeError;
use crate::event::Event;
use crate::normalize::normalize;
use crate::queue::EventQueue;

// Largest payload a UDP datagram can carry.
const BUFFER_SIZE: usize = 65535;

enum DatagramReader {
    Socket(UdpSocket),

    /// Replays a fixed payload, for tests.
    #[allow(dead_code)]
    MirrorTest(Vec<u8>, SocketAddr),
}

impl DatagramReader {
    async fn read(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        match self {
            DatagramReader::Socket(socket) => socket.recv_from(buf).await,
            DatagramReader::MirrorTest(data, src) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, *src))
            }
        }
    }
}

/// Owns the UDP socket for the lifetime of a bridge run.
pub struct Receiver {
    reader: DatagramReader,
    devices: Arc<DeviceRegistry>,
    queue: Arc<EventQueue>,
    trim_to_level_marker: bool,
}

impl Receiver {
    /// Binds the UDP socket. A bind failure is fatal for the run.
    pub async fn bind(
        addr: &str,
        devices: Arc<DeviceRegistry>,
        queue: Arc<EventQueue>,
        trim_to_level_marker: bool,
    ) -> Result<Self, BridgeError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Receiver {
            reader: DatagramReader::Socket(socket),
            devices,
            queue,
            trim_to_level_marker,
        })
    }

    /// Address the socket is bound to. Useful when binding port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match &self.reader {
            DatagramReader::Socket(socket) => socket.local_addr(),
            DatagramReader::MirrorTest(_, src) => Ok(*src),
        }
    }

    /// Reads datagrams until `cancel_token` fires.
    ///
    /// Returns `Ok(())` on cancellation. Any read error seen before cancellation ends the
    /// receiver with [`BridgeError::Receive`]. The socket is dropped on return.
    pub async fn spin(self, cancel_token: CancellationToken) -> Result<(), BridgeError> {
        if let Ok(addr) = self.local_addr() {
            info!("Listening for device logs on udp {addr}");
        }

        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!("UDP receiver cancelled");
                    return Ok(());
                }
                read = self.reader.read(&mut buf) => read,
            };

            match read {
                Ok((len, src)) => {
                    self.handle_datagram(&buf[..len], src);
                }
                Err(e) if cancel_token.is_cancelled() => {
                    debug!("UDP read interrupted by shutdown: {e}");
                    return Ok(());
                }
                Err(e) => return Err(BridgeError::Receive(e)),
            }
        }
    }

    /// Turns one datagram into an [`Event`] and offers it to the queue.
    ///
    /// Returns `true` if an event was enqueued.
    pub fn handle_datagram(&self, payload: &[u8], src: SocketAddr) -> bool {
        let Some(device_id) = self.devices.lookup(src.ip()) else {
            trace!("Dropping datagram from unregistered source {}", src.ip());
            return false;
        };

        let text = String::from_utf8_lossy(payload);
        let Some(line) = normalize(&text, self.trim_to_level_marker) else {
            return false;
        };

        self.queue.offer(Event::new(Utc::now(), device_id, line));
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::num::NonZeroUsize;
    use std::time::Duration;

    const PORCH: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
    const STRANGER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 99));

    fn queue(capacity: usize) -> Arc<EventQueue> {
        Arc::new(EventQueue::new(NonZeroUsize::new(capacity).unwrap()))
    }

    fn receiver(payload: &str, src: IpAddr, queue: Arc<EventQueue>) -> Receiver {
        Receiver {
            reader: DatagramReader::MirrorTest(
                payload.as_bytes().to_vec(),
                SocketAddr::new(src, 40000),
            ),
            devices: Arc::new(DeviceRegistry::new([("192.168.1.20", "porch")]).unwrap()),
            queue,
            trim_to_level_marker: true,
        }
    }

    async fn consume_one(receiver: &Receiver) -> bool {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let (len, src) = receiver.reader.read(&mut buf).await.unwrap();
        receiver.handle_datagram(&buf[..len], src)
    }

    #[tokio::test]
    async fn test_registered_device_is_enqueued() {
        let queue = queue(4);
        let before = Utc::now();
        let receiver = receiver("<14>[I] Booting up\r\n", PORCH, Arc::clone(&queue));

        assert!(consume_one(&receiver).await);

        let event = queue.try_take().expect("event enqueued");
        assert_eq!(event.device_id, "porch");
        assert_eq!(event.raw_line, "[I] Booting up");
        assert!(event.timestamp >= before);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_device_is_dropped() {
        let queue = queue(4);
        let receiver = receiver("[I] hello", STRANGER, Arc::clone(&queue));

        assert!(!consume_one(&receiver).await);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_blank_payload_is_dropped() {
        let queue = queue(4);
        let receiver = receiver(" <14> \n\t", PORCH, Arc::clone(&queue));

        assert!(!consume_one(&receiver).await);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_kept_lossily() {
        let queue = queue(4);
        let receiver = Receiver {
            reader: DatagramReader::MirrorTest(
                vec![b'[', b'W', b']', b' ', 0xff, b'x'],
                SocketAddr::new(PORCH, 40000),
            ),
            devices: Arc::new(DeviceRegistry::new([("192.168.1.20", "porch")]).unwrap()),
            queue: Arc::clone(&queue),
            trim_to_level_marker: false,
        };

        assert!(consume_one(&receiver).await);
        assert_eq!(queue.try_take().unwrap().raw_line, "[W] \u{fffd}x");
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let devices = Arc::new(DeviceRegistry::new([("127.0.0.1", "local")]).unwrap());
        let queue = queue(1);
        let first = Receiver::bind(
            "127.0.0.1:0",
            Arc::clone(&devices),
            Arc::clone(&queue),
            true,
        )
        .await
        .unwrap();
        let taken = first.local_addr().unwrap().to_string();

        let second = Receiver::bind(&taken, devices, queue, true).await;
        assert!(matches!(second, Err(BridgeError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_spin_receives_and_stops_on_cancel() {
        let devices = Arc::new(DeviceRegistry::new([("127.0.0.1", "local")]).unwrap());
        let queue = queue(8);
        let receiver = Receiver::bind("127.0.0.1:0", devices, Arc::clone(&queue), true)
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();

        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(receiver.spin(cancel_token.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"<13>[D] ping", addr).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), queue.take())
            .await
            .expect("datagram never arrived");
        assert_eq!(event.device_id, "local");
        assert_eq!(event.raw_line, "[D] ping");

        cancel_token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("receiver did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
