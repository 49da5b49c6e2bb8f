//! Glob restrictions on access-control entries.
//!
//! A restriction narrows the paths an entry applies to, relative to the
//! node the entry sits on: the empty pattern matches that node alone,
//! `*` in a pattern matches exactly one path segment, and a fully matched
//! pattern covers the matched path and everything below it.

/// A glob restriction attached to an access-control entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobRestriction {
    pattern: String,
}

impl GlobRestriction {
    /// Builds a restriction from its textual pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// The raw pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the entry applies to a target `rest` below the entry's
    /// node (`rest` is `""` for the node itself, `"/a/b"` for a
    /// descendant).
    pub fn applies_to(&self, rest: &str) -> bool {
        if self.pattern.is_empty() {
            return rest.is_empty();
        }
        if rest.is_empty() {
            return false;
        }
        let pattern_segments: Vec<&str> =
            self.pattern.trim_start_matches('/').split('/').collect();
        let rest_segments: Vec<&str> = rest.trim_start_matches('/').split('/').collect();
        if rest_segments.len() < pattern_segments.len() {
            return false;
        }
        pattern_segments
            .iter()
            .zip(rest_segments.iter())
            .all(|(pat, seg)| *pat == "*" || pat == seg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pattern_matches_node_only() {
        let glob = GlobRestriction::new("");
        assert!(glob.applies_to(""));
        assert!(!glob.applies_to("/child"));
    }

    #[test]
    fn star_matches_one_segment() {
        let glob = GlobRestriction::new("/*/leaf");
        assert!(glob.applies_to("/a/leaf"));
        assert!(glob.applies_to("/b/leaf"));
        assert!(!glob.applies_to("/a/other"));
        assert!(!glob.applies_to("/leaf"));
        assert!(!glob.applies_to(""));
    }

    #[test]
    fn matched_prefix_covers_descendants() {
        let glob = GlobRestriction::new("/*/leaf");
        assert!(glob.applies_to("/a/leaf/child"));
        assert!(glob.applies_to("/a/leaf/child/grandchild"));
    }

    #[test]
    fn literal_segments_must_match() {
        let glob = GlobRestriction::new("/docs");
        assert!(glob.applies_to("/docs"));
        assert!(glob.applies_to("/docs/readme"));
        assert!(!glob.applies_to("/src"));
    }
}
