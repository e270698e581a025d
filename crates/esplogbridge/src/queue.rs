// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded hand-off between the UDP receiver and the dispatcher.
//!
//! The producer never waits for space: when the ring is full the oldest unread event is
//! evicted to admit the new one. The single consumer parks on a [`Notify`] until something is
//! offered.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;
use tracing::debug;

use crate::event::Event;

/// Fixed-capacity FIFO of [`Event`] with a drop-oldest overload policy.
#[derive(Debug)]
pub struct EventQueue {
    ring: ArrayQueue<Event>,
    notify: Notify,
    evicted: AtomicU64,
}

impl EventQueue {
    /// Creates a queue holding at most `capacity` events.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        EventQueue {
            ring: ArrayQueue::new(capacity.get()),
            notify: Notify::new(),
            evicted: AtomicU64::new(0),
        }
    }

    /// Enqueues `event` without blocking. Returns the event that was evicted to make room,
    /// if the queue was full.
    pub fn offer(&self, event: Event) -> Option<Event> {
        let evicted = self.ring.force_push(event);
        if evicted.is_some() {
            let total = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Event queue full, dropped oldest event ({total} dropped so far)");
        }
        self.notify.notify_one();
        evicted
    }

    /// Takes the oldest event if one is available.
    pub fn try_take(&self) -> Option<Event> {
        self.ring.pop()
    }

    /// Waits until an event is available and takes it.
    ///
    /// Cancel safe: dropping the future never loses an event.
    pub async fn take(&self) -> Event {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.ring.pop() {
                return event;
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of events evicted by the overload policy since creation.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
