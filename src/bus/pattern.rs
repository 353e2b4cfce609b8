//! Glob pattern matching over dot-separated event names.
//!
//! `*` matches exactly one segment; `**` matches any number of segments
//! (including zero), and may appear anywhere in the pattern, not only as a
//! trailing wildcard.

/// Returns true if `event_type` matches `pattern`.
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    let pat: Vec<&str> = pattern.split('.').collect();
    let evt: Vec<&str> = event_type.split('.').collect();
    matches_segments(&pat, &evt)
}

fn matches_segments(pat: &[&str], evt: &[&str]) -> bool {
    match pat.first() {
        None => evt.is_empty(),
        Some(&"**") => {
            let rest = &pat[1..];
            if matches_segments(rest, evt) {
                return true;
            }
            if evt.is_empty() {
                return false;
            }
            matches_segments(pat, &evt[1..])
        }
        Some(&seg) => match evt.first() {
            None => false,
            Some(&e0) => (seg == "*" || seg == e0) && matches_segments(&pat[1..], &evt[1..]),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::pattern_matches;

    #[test]
    fn exact_match() {
        assert!(pattern_matches("state:changed", "state:changed"));
        assert!(!pattern_matches("state:changed", "state:other"));
    }

    #[test]
    fn single_segment_wildcard() {
        assert!(pattern_matches("orchestrator.stage.*", "orchestrator.stage.complete"));
        assert!(!pattern_matches(
            "orchestrator.stage.*",
            "orchestrator.stage.complete.extra"
        ));
    }

    #[test]
    fn suffix_double_wildcard() {
        assert!(pattern_matches("orchestrator.**", "orchestrator.stage.complete"));
        assert!(pattern_matches("orchestrator.**", "orchestrator.complete"));
        assert!(pattern_matches("orchestrator.**", "orchestrator"));
    }

    #[test]
    fn bare_double_wildcard_matches_everything() {
        assert!(pattern_matches("**", "anything.at.all"));
        assert!(pattern_matches("**", "anything"));
    }

    #[test]
    fn double_wildcard_in_middle() {
        assert!(pattern_matches("orchestrator.**.complete", "orchestrator.stage.a.complete"));
        assert!(pattern_matches("orchestrator.**.complete", "orchestrator.complete"));
        assert!(!pattern_matches("orchestrator.**.complete", "orchestrator.stage.failed"));
    }

    #[test]
    fn mismatched_length_without_wildcard_fails() {
        assert!(!pattern_matches("a.b", "a.b.c"));
        assert!(!pattern_matches("a.b.c", "a.b"));
    }
}
