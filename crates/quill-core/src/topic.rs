//! Topic name and filter validation, and filter matching.
//!
//! Rules from the MQTT specification, section 4.7:
//! - [MQTT-4.7.1-2] `#` matches the remainder of the topic and must be the
//!   last character of the filter, alone in its level.
//! - [MQTT-4.7.1-3] `+` matches exactly one level and must occupy a whole
//!   level by itself.
//! - [MQTT-4.7.2-1] Filters starting with a wildcard do not match topic
//!   names starting with `$`.

/// Longest topic name or filter: the wire format carries a two-byte length
/// prefix.
const MAX_LENGTH: usize = 65_535;

/// Check whether `topic` is a valid topic name for publishing.
///
/// Topic names must be non-empty, at most 65 535 bytes, and contain no
/// wildcard or NUL characters.
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= MAX_LENGTH && !topic.contains(['+', '#', '\0'])
}

/// Check whether `filter` is a valid topic filter for subscribing.
///
/// Wildcards are allowed: `+` as the sole character of any level, `#` as the
/// sole character of the final level.
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > MAX_LENGTH || filter.contains('\0') {
        return false;
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        if level.contains('#') && (level != "#" || !is_last) {
            return false;
        }
        if level.contains('+') && level != "+" {
            return false;
        }
    }
    true
}

/// Check whether a published `topic` matches a subscribed `filter`.
///
/// Comparison is case-sensitive and byte-exact per level. The caller is
/// expected to have validated both strings.
pub fn matches(topic: &str, filter: &str) -> bool {
    // Wildcards at the first level never match $-prefixed topics.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "#" also covers the parent level itself: "a/b" matches "a/b/#".
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(level), Some(name)) if level == name => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_validation() {
        for valid in ["/", "/test", "one/two/three", "one//three", "$SYS", "$SYS/test"] {
            assert!(is_valid_topic_name(valid), "{valid:?} should be valid");
        }

        for invalid in [
            "", "\0", "#", "+", "one/+/three", "one/two/#", "/+", "/#", "test/+", "test/#",
            "+/", "+/test", "#/", "#/test", "one/two#", "one/two+",
        ] {
            assert!(!is_valid_topic_name(invalid), "{invalid:?} should be invalid");
        }

        assert!(is_valid_topic_name(&"a".repeat(65_535)));
        assert!(!is_valid_topic_name(&"a".repeat(65_536)));
    }

    #[test]
    fn topic_filter_validation() {
        for valid in [
            "one/two/three", "one//three", "$SYS", "$SYS/test", "/", "/test", "#", "+",
            "one/+/three", "one/two/#", "/+", "/#", "test/+", "test/#", "+/", "+/test",
        ] {
            assert!(is_valid_topic_filter(valid), "{valid:?} should be valid");
        }

        for invalid in [
            "", "\0", "#/", "#/test", "one/#/three", "one/two#", "one/two+", "one/+two/three",
            "one/two+/three",
        ] {
            assert!(!is_valid_topic_filter(invalid), "{invalid:?} should be invalid");
        }

        assert!(!is_valid_topic_filter(&format!("{}/#", "a".repeat(65_534))));
    }

    #[test]
    fn exact_and_single_level_matches() {
        assert!(matches("one/two/three", "one/two/three"));
        assert!(matches("one/two/three", "one/+/three"));
        assert!(!matches("one/two/three", "One/Two/Three"));
        assert!(!matches("one/two/three", "one/two"));
        assert!(!matches("one/two/three", "one/+"));
        assert!(!matches("one/two/three", "one/two/three/four"));
        assert!(!matches("one/two/three", "one/two/three/+"));
        assert!(!matches("/one/two/three", "one/two/three"));
        assert!(matches("/one/two/three", "/one/two/three"));
        assert!(!matches("one", "one/+"));
    }

    #[test]
    fn multi_level_matches() {
        assert!(matches("one/two/three", "one/#"));
        assert!(matches("one/two/three", "#"));
        assert!(matches("one/two/three/four/five/six", "one/two/#"));
        assert!(matches("one/two/three/four/five/six", "one/+/three/#"));
        assert!(matches("one/two/three/four/five/six", "one/two/+/four/+/six"));
        // The parent level itself is covered by "#".
        assert!(matches("one", "one/#"));
        assert!(matches("one/two/three", "one/two/three/#"));
    }

    #[test]
    fn dollar_topics_not_matched_by_leading_wildcards() {
        assert!(!matches("$SYS/test", "+/test"));
        assert!(!matches("$SYS/test", "#"));
        assert!(matches("$SYS/test", "$SYS/+"));
        assert!(matches("$SYS/test", "$SYS/#"));
        assert!(matches("$SYS/broker/clients", "$SYS/#"));
    }
}
