// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching and flushing of received events.
//!
//! The [`Dispatcher`] is the only consumer of the [`EventQueue`]. It reacts to four things,
//! one at a time:
//!
//! - shutdown: flush what it holds and stop
//! - receiver exit: flush what it holds, stop, and surface the receiver's error
//! - a new event: append it, flushing immediately once the batch is full
//! - the flush timer: flush whatever has accumulated
//!
//! Every flush re-arms the timer for a full interval, so a size-triggered flush is never
//! followed by a stale timer expiry. Flushes are awaited inline: a slow endpoint delays the
//! next batch but never the receiver, whose enqueue cannot block.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::devices::DeviceRegistry;
use crate::errors::BridgeError;
use crate::event::Event;
use crate::loki::{LokiClient, Sink};
use crate::queue::EventQueue;
use crate::receiver::Receiver;

// Roughly 30 years, the same horizon tokio uses for an unbounded sleep.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Drains the queue into batches and hands them to a [`Sink`].
pub struct Dispatcher<S> {
    sink: S,
    queue: Arc<EventQueue>,
    max_items: usize,
    max_wait: Duration,
    batch: Vec<Event>,
}

impl<S: Sink> Dispatcher<S> {
    #[must_use]
    pub fn new(sink: S, queue: Arc<EventQueue>, max_items: usize, max_wait: Duration) -> Self {
        let max_items = max_items.max(1);
        Dispatcher {
            sink,
            queue,
            max_items,
            max_wait,
            batch: Vec::with_capacity(max_items),
        }
    }

    /// Runs until `cancel_token` fires or `receiver` ends.
    ///
    /// Returns the receiver's error if it failed while the bridge was not shutting down.
    pub async fn run(
        mut self,
        cancel_token: CancellationToken,
        mut receiver: JoinHandle<Result<(), BridgeError>>,
    ) -> Result<(), BridgeError> {
        debug!("Dispatcher started");

        let timer = sleep(self.max_wait);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!("Dispatcher received shutdown signal, flushing remaining events");
                    self.drain_and_flush().await;
                    return Ok(());
                }

                result = &mut receiver => {
                    self.drain_and_flush().await;
                    return match result {
                        Ok(Ok(())) => Ok(()),
                        _ if cancel_token.is_cancelled() => Ok(()),
                        Ok(Err(e)) => Err(e),
                        Err(join_error) => Err(BridgeError::ReceiverTask(join_error.to_string())),
                    };
                }

                event = self.queue.take() => {
                    self.batch.push(event);
                    if self.batch.len() >= self.max_items {
                        self.flush().await;
                        timer.as_mut().reset(self.next_deadline());
                    }
                }

                () = &mut timer => {
                    self.flush().await;
                    timer.as_mut().reset(self.next_deadline());
                }
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.max_wait).unwrap_or_else(|| now + FAR_FUTURE)
    }

    /// Moves everything still queued into batches and flushes them, then flushes the rest.
    ///
    /// Each `max_items` chunk is its own push, so shutdown may take several client timeouts
    /// when the queue is backed up.
    async fn drain_and_flush(&mut self) {
        while let Some(event) = self.queue.try_take() {
            self.batch.push(event);
            if self.batch.len() >= self.max_items {
                self.flush().await;
            }
        }
        self.flush().await;
    }

    /// Sends the current batch, if any. A failed push is logged and the batch dropped.
    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let count = self.batch.len();
        debug!("Flushing {count} events");
        if let Err(e) = self.sink.send_batch(&self.batch).await {
            error!("Failed to push {count} events, dropping batch: {e}");
        }
        self.batch.clear();
    }
}

/// Wires the receiver, queue and dispatcher together for one run.
#[derive(Clone)]
pub struct Bridge {
    config: Arc<Config>,
    devices: Arc<DeviceRegistry>,
    queue: Arc<EventQueue>,
}

impl Bridge {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let devices = Arc::new(config.devices.clone());
        let queue = Arc::new(EventQueue::new(config.udp_queue_size));
        Bridge {
            config,
            devices,
            queue,
        }
    }

    /// Binds the UDP socket, then relays to the configured Loki endpoint until
    /// `cancel_token` fires or the receiver fails.
    pub async fn run(self, cancel_token: CancellationToken) -> Result<(), BridgeError> {
        let sink = LokiClient::from_config(&self.config)?;
        self.run_with_sink(sink, cancel_token).await
    }

    /// Like [`Bridge::run`], delivering batches to `sink` instead of the configured endpoint.
    pub async fn run_with_sink<S: Sink + 'static>(
        self,
        sink: S,
        cancel_token: CancellationToken,
    ) -> Result<(), BridgeError> {
        let receiver = self.bind().await?;
        self.serve(receiver, sink, cancel_token).await
    }

    /// Binds the configured listen address.
    ///
    /// A bare `:port` tries the dual-stack wildcard first and falls back to IPv4 unless the
    /// port itself is taken.
    pub async fn bind(&self) -> Result<Receiver, BridgeError> {
        let mut last_error = None;
        for addr in self.config.bind_addrs() {
            match Receiver::bind(
                &addr,
                Arc::clone(&self.devices),
                Arc::clone(&self.queue),
                self.config.udp_trim_to_level_marker,
            )
            .await
            {
                Ok(receiver) => return Ok(receiver),
                Err(e) => {
                    debug!("Could not bind {addr}: {e}");
                    let in_use = matches!(
                        &e,
                        BridgeError::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse
                    );
                    last_error = Some(e);
                    if in_use {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BridgeError::Bind {
            addr: self.config.listen.clone(),
            source: io::Error::from(io::ErrorKind::InvalidInput),
        }))
    }

    /// Runs an already bound receiver and the dispatcher against `sink`.
    pub async fn serve<S: Sink + 'static>(
        self,
        receiver: Receiver,
        sink: S,
        cancel_token: CancellationToken,
    ) -> Result<(), BridgeError> {
        info!(
            "Relaying logs from {} devices to {} (batch {} items / {:?})",
            self.devices.len(),
            self.config.loki_url,
            self.config.batch_max_items,
            self.config.batch_max_wait
        );

        let receiver_task = tokio::spawn(receiver.spin(cancel_token.clone()));
        let dispatcher = Dispatcher::new(
            sink,
            Arc::clone(&self.queue),
            self.config.batch_max_items,
            self.config.batch_max_wait,
        );
        let result = dispatcher.run(cancel_token, receiver_task).await;

        let evicted = self.queue.evicted();
        if evicted > 0 {
            info!("Dropped {evicted} events due to a full queue");
        }
        result
    }
}
