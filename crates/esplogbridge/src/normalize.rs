// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame normalization for raw device datagrams.

/// Log-level tags emitted by ESPHome devices at the start of each record.
const LEVEL_MARKERS: [&str; 7] = ["[E]", "[W]", "[I]", "[C]", "[D]", "[V]", "[VV]"];

/// Turns a raw datagram payload into a single-line record.
///
/// Strips a leading syslog priority (`<14>`), collapses every whitespace run (newlines
/// included) into one space and, when `trim_to_level_marker` is set, drops anything before
/// the first device level tag such as `[I]`. A prefix carrying a `level=` token is kept.
///
/// # Returns
///
/// * `Some(String)` - The normalized line
/// * `None` - If nothing is left after normalization
///
/// # Examples
///
/// ```
/// use esplogbridge::normalize::normalize;
///
/// assert_eq!(normalize("<14>[I] Booting up\n", true), Some("[I] Booting up".to_string()));
/// assert_eq!(normalize("  \r\n ", true), None);
/// ```
#[must_use]
pub fn normalize(payload: &str, trim_to_level_marker: bool) -> Option<String> {
    let stripped = strip_priority(payload.trim());
    let mut line = collapse_whitespace(stripped);
    if trim_to_level_marker {
        if let Some(start) = find_level_marker(&line) {
            if !line[..start].contains("level=") {
                line.replace_range(..start, "");
            }
        }
    }

    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

/// Removes a leading `<N>` priority tag, where `N` is one or more ASCII digits, plus the
/// spaces or tabs that follow it. Anything else is returned untouched.
#[must_use]
pub fn strip_priority(s: &str) -> &str {
    let Some(rest) = s.strip_prefix('<') else {
        return s;
    };
    let Some(end) = rest.find('>') else {
        return s;
    };

    let digits = &rest[..end];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return s;
    }

    rest[end + 1..].trim_start_matches([' ', '\t'])
}

/// Joins the whitespace-separated fields of `s` with single spaces.
#[must_use]
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn find_level_marker(line: &str) -> Option<usize> {
    LEVEL_MARKERS
        .iter()
        .filter_map(|marker| line.find(marker))
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_strip_priority() {
        assert_eq!(strip_priority("<14>[I] Booting up"), "[I] Booting up");
        assert_eq!(strip_priority("<191> \tmsg"), "msg");
        assert_eq!(strip_priority("<>msg"), "<>msg");
        assert_eq!(strip_priority("<ab>msg"), "<ab>msg");
        assert_eq!(strip_priority("<14 msg"), "<14 msg");
        assert_eq!(strip_priority("msg <14>"), "msg <14>");
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a \t b\r\n\nc  "), "a b c");
        assert_eq!(collapse_whitespace(" \n "), "");
    }

    #[test]
    fn test_normalize_round_trip_scenario() {
        assert_eq!(
            normalize("<14>[I] Booting up", false),
            Some("[I] Booting up".to_string())
        );
    }

    #[test]
    fn test_normalize_multiline_payload() {
        assert_eq!(
            normalize("\r\n<14>  [W][wifi:123]: lost\nconnection \r\n", true),
            Some("[W][wifi:123]: lost connection".to_string())
        );
    }

    #[test]
    fn test_normalize_empty_results() {
        assert_eq!(normalize("", true), None);
        assert_eq!(normalize("   \n\t", true), None);
        assert_eq!(normalize("<14>   ", true), None);
    }

    #[test]
    fn test_trim_to_level_marker() {
        assert_eq!(
            normalize("esp-porch 12:00:01 [D][sensor:093]: 'temp': 21.5", true),
            Some("[D][sensor:093]: 'temp': 21.5".to_string())
        );
        assert_eq!(
            normalize("esp-porch 12:00:01 [D][sensor:093]: 'temp': 21.5", false),
            Some("esp-porch 12:00:01 [D][sensor:093]: 'temp': 21.5".to_string())
        );
    }

    #[test]
    fn test_trim_uses_first_marker() {
        assert_eq!(
            normalize("boot [VV] trace [E] later", true),
            Some("[VV] trace [E] later".to_string())
        );
    }

    #[test]
    fn test_trim_keeps_prefix_with_level_token() {
        let line = normalize("level=error disk fault [I] retrying", true);
        assert_eq!(line.as_deref(), Some("level=error disk fault [I] retrying"));
        assert_eq!(
            crate::level::detect_level(line.as_deref().unwrap_or_default()),
            crate::level::Level::Error
        );
    }

    #[test]
    fn test_no_marker_keeps_line() {
        assert_eq!(
            normalize("level=ERROR disk fault", true),
            Some("level=ERROR disk fault".to_string())
        );
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(payload in "(<[0-9]{1,3}>)?[ -~\t\r\n]{0,64}", trim in any::<bool>()) {
            if let Some(once) = normalize(&payload, trim) {
                // A second pass only differs if a nested priority tag was exposed.
                if strip_priority(&once) == once {
                    prop_assert_eq!(normalize(&once, trim), Some(once.clone()));
                }
                prop_assert!(!once.is_empty());
                prop_assert!(!once.contains('\n'));
                prop_assert!(!once.contains("  "));
            }
        }
    }
}
