// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loki push client.
//!
//! A batch is grouped by device, every device becomes one labeled stream and the whole batch
//! is sent in a single `POST` to the push API:
//!
//! ```json
//! {"streams":[{"stream":{"job":"esphome","device_id":"porch"},
//!              "values":[["1700000000000000000","ts=... level=info msg=[I] Booting up"]]}]}
//! ```
//!
//! Failed pushes are reported to the caller and never retried here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use tracing::{debug, error};

use crate::config::Config;
use crate::errors::{BridgeError, PushError};
use crate::event::Event;
use crate::level::{detect_level, format_line};

/// Longest response body excerpt kept in a push error.
const MAX_ERROR_BODY_LEN: usize = 256;

/// Destination for flushed batches.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Delivers one batch in a single request. Errors are final: the batch is not retried.
    async fn send_batch(&self, batch: &[Event]) -> Result<(), PushError>;
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct PushRequest {
    pub streams: Vec<Stream>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct Stream {
    pub stream: StreamLabels,
    /// `(unix nanos, formatted line)` pairs in arrival order.
    pub values: Vec<(String, String)>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct StreamLabels {
    pub job: String,
    pub device_id: String,
}

/// Builds the push payload for `batch`.
///
/// Streams are ordered by the first appearance of their device in the batch, and each
/// stream keeps the arrival order of its events.
#[must_use]
pub fn build_push_request(job: &str, batch: &[Event]) -> PushRequest {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut streams: Vec<Stream> = Vec::new();

    for event in batch {
        let position = *index.entry(event.device_id.as_str()).or_insert_with(|| {
            streams.push(Stream {
                stream: StreamLabels {
                    job: job.to_string(),
                    device_id: event.device_id.clone(),
                },
                values: Vec::new(),
            });
            streams.len() - 1
        });

        let level = detect_level(&event.raw_line);
        streams[position].values.push((
            event.unix_nanos().to_string(),
            format_line(event.timestamp, level, &event.raw_line),
        ));
    }

    PushRequest { streams }
}

/// HTTP client for the Loki push API.
#[derive(Debug, Clone)]
pub struct LokiClient {
    client: reqwest::Client,
    url: String,
    job: String,
}

impl LokiClient {
    /// Creates a client for `url` with a per-request `timeout` and static `headers` sent on
    /// every push alongside `Content-Type: application/json`.
    pub fn new<'a>(
        url: impl Into<String>,
        job: impl Into<String>,
        timeout: Duration,
        headers: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self, BridgeError> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            // Config validation already rejected invalid headers; skip rather than fail.
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    default_headers.insert(name, value);
                }
                _ => error!("Skipping invalid push header {name}"),
            }
        }
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(BridgeError::HttpClient)?;

        Ok(LokiClient {
            client,
            url: url.into(),
            job: job.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, BridgeError> {
        Self::new(
            config.loki_url.clone(),
            config.loki_job.clone(),
            config.loki_timeout,
            &config.loki_headers,
        )
    }
}

#[async_trait]
impl Sink for LokiClient {
    async fn send_batch(&self, batch: &[Event]) -> Result<(), PushError> {
        let payload = build_push_request(&self.job, batch);
        let body =
            serde_json::to_vec(&payload).map_err(|e| PushError::Payload(e.to_string()))?;

        let resp = self
            .client
            .post(&self.url)
            .body(body)
            .send()
            .await
            .map_err(|e| PushError::Destination(e.status(), format!("post: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let mut text = resp.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY_LEN {
                let mut cut = MAX_ERROR_BODY_LEN;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(PushError::Destination(
                Some(status),
                format!("post: http {status}: {}", text.trim()),
            ));
        }

        debug!(
            "Pushed {} events in {} streams",
            batch.len(),
            payload.streams.len()
        );
        Ok(())
    }
}
