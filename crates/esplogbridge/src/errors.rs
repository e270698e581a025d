// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Errors raised while loading or validating the bridge configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: {0}")]
    Load(String),

    #[error("config: {0}")]
    Invalid(String),
}

/// Fatal errors that end a bridge run.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("udp receiver: listen {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("udp receiver: read: {0}")]
    Receive(#[source] std::io::Error),

    #[error("udp receiver: task failed: {0}")]
    ReceiverTask(String),

    #[error("failed to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Failure of a single push to Loki. The batch is dropped either way.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("failed to prepare payload: {0}")]
    Payload(String),

    #[error("push failed: {1}")]
    Destination(Option<StatusCode>, String),
}
