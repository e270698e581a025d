// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Coarse severity detection and logfmt-style rendering of pushed lines.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

/// Severity attached to every pushed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            _ => None,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'D' => Some(Level::Debug),
            b'I' | b'C' => Some(Level::Info),
            b'W' => Some(Level::Warn),
            b'E' => Some(Level::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guesses the severity of a normalized line.
///
/// A `level=<value>` token wins; otherwise a leading single-letter tag (`[D]`, `[I]`, `[W]`,
/// `[E]`, `[C]`) decides. Anything else is `info`.
#[must_use]
pub fn detect_level(line: &str) -> Level {
    if let Some((_, after)) = line.split_once("level=") {
        let token = after.split(' ').next().unwrap_or_default().trim();
        if let Some(level) = Level::from_token(token) {
            return level;
        }
    }

    match line.as_bytes() {
        [b'[', tag, b']', ..] => Level::from_tag(*tag).unwrap_or(Level::Info),
        _ => Level::Info,
    }
}

/// Renders the line pushed to Loki: `ts=<RFC3339 nanos> level=<level> msg=<escaped line>`.
#[must_use]
pub fn format_line(ts: DateTime<Utc>, level: Level, msg: &str) -> String {
    format!(
        "ts={} level={} msg={}",
        ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
        level,
        escape_msg(msg)
    )
}

/// Backslash-escapes `\` and `"`, and turns carriage returns and newlines into spaces.
#[must_use]
pub fn escape_msg(msg: &str) -> String {
    let mut escaped = String::with_capacity(msg.len());
    for c in msg.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\r' | '\n' => escaped.push(' '),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_detect_level_token() {
        assert_eq!(detect_level("level=ERROR disk fault"), Level::Error);
        assert_eq!(detect_level("boot level=debug"), Level::Debug);
        assert_eq!(detect_level("level=Warning low battery"), Level::Warn);
        assert_eq!(detect_level("level=warn"), Level::Warn);
        assert_eq!(detect_level("x level=info y"), Level::Info);
    }

    #[test]
    fn test_detect_level_unknown_token_falls_back_to_tag() {
        assert_eq!(detect_level("[E] level=fatal boom"), Level::Error);
        assert_eq!(detect_level("level=fatal boom"), Level::Info);
    }

    #[test]
    fn test_detect_level_token_wins_over_tag() {
        assert_eq!(detect_level("[D] level=error oops"), Level::Error);
    }

    #[test]
    fn test_detect_level_tag() {
        assert_eq!(detect_level("[D][sensor:093]: x"), Level::Debug);
        assert_eq!(detect_level("[I] Booting up"), Level::Info);
        assert_eq!(detect_level("[W][wifi:123]: lost"), Level::Warn);
        assert_eq!(detect_level("[E] boom"), Level::Error);
        assert_eq!(detect_level("[C][api]: config"), Level::Info);
    }

    #[test]
    fn test_detect_level_default() {
        assert_eq!(detect_level("hello world"), Level::Info);
        assert_eq!(detect_level("[X] odd tag"), Level::Info);
        assert_eq!(detect_level("[VV] verbose"), Level::Info);
        assert_eq!(detect_level(""), Level::Info);
        assert_eq!(detect_level("[E"), Level::Info);
    }

    #[test]
    fn test_escape_msg() {
        assert_eq!(escape_msg(r#"say "hi""#), r#"say \"hi\""#);
        assert_eq!(escape_msg(r"C:\path"), r"C:\\path");
        assert_eq!(escape_msg("a\r\nb"), "a  b");
        assert_eq!(escape_msg("plain"), "plain");
    }

    #[test]
    fn test_format_line() {
        let ts = Utc
            .timestamp_opt(1_700_000_000, 5)
            .single()
            .expect("valid timestamp");
        assert_eq!(
            format_line(ts, Level::Info, "[I] Booting up"),
            "ts=2023-11-14T22:13:20.000000005Z level=info msg=[I] Booting up"
        );
    }
}
