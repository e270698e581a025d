// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};

/// One normalized log line received from a known device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Receive time, stamped by the receiver.
    pub timestamp: DateTime<Utc>,
    /// Identifier resolved from the sender's address. Never empty.
    pub device_id: String,
    /// Normalized single-line text. Never empty.
    pub raw_line: String,
}

impl Event {
    #[must_use]
    pub fn new(
        timestamp: DateTime<Utc>,
        device_id: impl Into<String>,
        raw_line: impl Into<String>,
    ) -> Self {
        Event {
            timestamp,
            device_id: device_id.into(),
            raw_line: raw_line.into(),
        }
    }

    /// Unix epoch nanoseconds, as pushed alongside each line.
    ///
    /// Falls back to microsecond precision outside the range `i64` nanoseconds can hold.
    #[must_use]
    pub fn unix_nanos(&self) -> i128 {
        match self.timestamp.timestamp_nanos_opt() {
            Some(nanos) => i128::from(nanos),
            None => i128::from(self.timestamp.timestamp_micros()) * 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unix_nanos() {
        let ts = Utc
            .timestamp_opt(1_700_000_000, 123_456_789)
            .single()
            .expect("valid timestamp");
        let event = Event::new(ts, "porch", "[I] Booting up");
        assert_eq!(event.unix_nanos(), 1_700_000_000_123_456_789);
    }

    #[test]
    fn test_unix_nanos_epoch() {
        let epoch = Utc.timestamp_opt(0, 0).single().expect("valid timestamp");
        let event = Event::new(epoch, "porch", "x");
        assert_eq!(event.unix_nanos(), 0);
    }
}
