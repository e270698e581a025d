// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relay between ESPHome-style UDP log senders and a Loki push endpoint.
//!
//! Datagrams are received by the [`receiver::Receiver`], tagged with the device that sent
//! them, normalized into single-line records and offered to a bounded drop-oldest
//! [`queue::EventQueue`]. The [`bridge::Dispatcher`] drains that queue into batches and hands
//! each batch to a [`loki::Sink`] when it is full, when the flush interval elapses, or on
//! shutdown.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod bridge;
pub mod config;
pub mod devices;
pub mod errors;
pub mod event;
pub mod level;
pub mod loki;
pub mod normalize;
pub mod queue;
pub mod receiver;
