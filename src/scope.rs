//! Glob-pattern overlap between phase scopes.
//!
//! The test is pattern-vs-pattern, never a filesystem walk: two patterns
//! overlap when some path could match both. Segment rules:
//! - `**` covers any number of segments (including zero)
//! - a segment containing `*`/`?`/`[` covers any literal segment the glob
//!   matches, and two wildcard segments always overlap
//! - a trailing `/` (directory prefix) behaves as `prefix/**`

use crate::phase::PhaseSpec;
use glob::Pattern;

/// First overlapping pair between two scope lists, for diagnostics.
pub fn scopes_overlap(a: &[String], b: &[String]) -> Option<(String, String)> {
    for pa in a {
        for pb in b {
            if patterns_overlap(pa, pb) {
                return Some((pa.clone(), pb.clone()));
            }
        }
    }
    None
}

/// Whether two phases are in scope conflict, ignoring DAG ordering: both
/// declare scopes, neither opts out, and the scopes overlap.
pub fn specs_conflict(a: &PhaseSpec, b: &PhaseSpec) -> bool {
    if a.allow_scope_overlap || b.allow_scope_overlap {
        return false;
    }
    if a.scope.is_empty() || b.scope.is_empty() {
        return false;
    }
    scopes_overlap(&a.scope, &b.scope).is_some()
}

/// Whether any path can match both glob patterns.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let sa = segments(a);
    let sb = segments(b);
    lists_overlap(&sa, &sb)
}

fn segments(pattern: &str) -> Vec<String> {
    let mut segs: Vec<String> = pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    // "internal/" claims everything under internal.
    if pattern.ends_with('/') {
        segs.push("**".to_string());
    }
    segs
}

fn is_wild(seg: &str) -> bool {
    seg.contains('*') || seg.contains('?') || seg.contains('[')
}

fn seg_overlap(a: &str, b: &str) -> bool {
    match (is_wild(a), is_wild(b)) {
        (false, false) => a == b,
        // Two wildcard segments can always agree on some literal.
        (true, true) => true,
        (true, false) => Pattern::new(a).map(|p| p.matches(b)).unwrap_or(false),
        (false, true) => Pattern::new(b).map(|p| p.matches(a)).unwrap_or(false),
    }
}

fn lists_overlap(a: &[String], b: &[String]) -> bool {
    match (a.first(), b.first()) {
        (None, None) => true,
        (Some(x), _) if x == "**" => {
            // ** absorbs zero segments, or one of b's.
            lists_overlap(&a[1..], b) || (!b.is_empty() && lists_overlap(a, &b[1..]))
        }
        (_, Some(y)) if y == "**" => {
            lists_overlap(a, &b[1..]) || (!a.is_empty() && lists_overlap(&a[1..], b))
        }
        (None, _) | (_, None) => false,
        (Some(x), Some(y)) => seg_overlap(x, y) && lists_overlap(&a[1..], &b[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_patterns_overlap() {
        assert!(patterns_overlap("src/main.rs", "src/main.rs"));
        assert!(!patterns_overlap("src/main.rs", "src/lib.rs"));
    }

    #[test]
    fn doublestar_covers_nested_patterns() {
        assert!(patterns_overlap("internal/**", "internal/loop/**"));
        assert!(patterns_overlap("internal/loop/**", "internal/**"));
        assert!(!patterns_overlap("internal/**", "cmd/**"));
    }

    #[test]
    fn doublestar_matches_zero_segments() {
        assert!(patterns_overlap("src/**", "src"));
        assert!(patterns_overlap("**", "anything/at/all.rs"));
    }

    #[test]
    fn single_star_covers_literals_in_segment() {
        assert!(patterns_overlap("src/*.rs", "src/main.rs"));
        assert!(!patterns_overlap("src/*.rs", "src/deep/main.rs"));
        assert!(patterns_overlap("src/*/mod.rs", "src/core/mod.rs"));
    }

    #[test]
    fn two_wildcard_segments_overlap() {
        assert!(patterns_overlap("src/*.rs", "src/main.*"));
    }

    #[test]
    fn directory_prefix_claims_subtree() {
        assert!(patterns_overlap("internal/", "internal/loop/runner.rs"));
        assert!(patterns_overlap("internal/loop/x.rs", "internal/"));
        assert!(!patterns_overlap("internal/", "cmd/main.rs"));
    }

    #[test]
    fn literal_prefix_alone_does_not_claim_subtree() {
        // "internal" names one path; only "internal/" or "internal/**" claim below it.
        assert!(!patterns_overlap("internal", "internal/loop/x.rs"));
    }

    #[test]
    fn scopes_overlap_reports_first_offending_pair() {
        let a = vec!["docs/**".to_string(), "internal/**".to_string()];
        let b = vec!["cmd/**".to_string(), "internal/loop/**".to_string()];
        let (pa, pb) = scopes_overlap(&a, &b).unwrap();
        assert_eq!(pa, "internal/**");
        assert_eq!(pb, "internal/loop/**");

        let disjoint = vec!["ui/**".to_string()];
        assert!(scopes_overlap(&a, &disjoint).is_none());
    }

    #[test]
    fn specs_conflict_honors_opt_out_and_empty_scopes() {
        use crate::phase::PhaseSpec;

        let a = PhaseSpec::new("a", "A").with_scope(&["internal/**"]);
        let b = PhaseSpec::new("b", "B").with_scope(&["internal/loop/**"]);
        assert!(specs_conflict(&a, &b));

        let mut b_opted = b.clone();
        b_opted.allow_scope_overlap = true;
        assert!(!specs_conflict(&a, &b_opted));

        let unscoped = PhaseSpec::new("c", "C");
        assert!(!specs_conflict(&a, &unscoped));
    }
}
