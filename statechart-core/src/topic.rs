/// Matches a slash-delimited topic against a subscription pattern. `+`
/// matches exactly one segment; `#` matches one or more trailing segments and
/// is only meaningful as the pattern's last segment.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let topic_segments: Vec<&str> = topic.split('/').collect();
    matches_segments(&pattern_segments, &topic_segments)
}

fn matches_segments(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.first() {
        None => topic.is_empty(),
        Some(&"#") => !topic.is_empty(),
        Some(&"+") => !topic.is_empty() && matches_segments(&pattern[1..], &topic[1..]),
        Some(seg) => topic.first() == Some(seg) && matches_segments(&pattern[1..], &topic[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b/d"));
    }

    #[test]
    fn single_segment_wildcard() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/c/d"));
    }

    #[test]
    fn multi_segment_trailing_wildcard() {
        assert!(topic_matches("a/#", "a/b/c/d"));
        assert!(topic_matches("a/#", "a/b"));
        assert!(!topic_matches("a/#", "a"));
    }

    #[test]
    fn wildcard_must_match_at_least_one_segment() {
        assert!(!topic_matches("a/+", "a"));
    }
}
