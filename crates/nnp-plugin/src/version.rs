//! Host/plugin version compatibility.

use std::cmp::Ordering;

/// Check whether a declared `[min, max]` range admits the host version.
///
/// Ranges that are empty, not wrapped in brackets, or do not split into
/// exactly two bounds are unconstrained. Bounds are compared as plain
/// strings, so `"10.0.0"` sorts before `"2.0.0"`.
pub fn is_version_compatible(range: &str, host_version: &str) -> bool {
    if range.is_empty() || !range.starts_with('[') || !range.ends_with(']') {
        return true;
    }

    let inner = &range[1..range.len() - 1];
    let bounds: Vec<&str> = inner.split(',').collect();
    if bounds.len() != 2 {
        return true;
    }

    let min = bounds[0].trim();
    let max = bounds[1].trim();
    let compatible = host_version >= min && host_version <= max;

    if let Some(semver_compatible) = semver_in_range(min, max, host_version) {
        if semver_compatible != compatible {
            tracing::warn!(
                range = %range,
                host = %host_version,
                compatible,
                "string comparison of versions disagrees with semver ordering"
            );
        }
    }

    compatible
}

/// Same range check under semver ordering, when every version parses.
fn semver_in_range(min: &str, max: &str, host: &str) -> Option<bool> {
    let min = semver::Version::parse(min).ok()?;
    let max = semver::Version::parse(max).ok()?;
    let host = semver::Version::parse(host).ok()?;
    Some(host.cmp(&min) != Ordering::Less && host.cmp(&max) != Ordering::Greater)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Bounded ranges ──────────────────────────────────────────────

    #[test]
    fn test_host_inside_range() {
        assert!(is_version_compatible("[1.0.0, 2.0.0]", "1.5.0"));
    }

    #[test]
    fn test_host_above_range() {
        assert!(!is_version_compatible("[1.0.0, 2.0.0]", "3.0.0"));
    }

    #[test]
    fn test_host_below_range() {
        assert!(!is_version_compatible("[1.0.0, 2.0.0]", "0.9.0"));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        assert!(is_version_compatible("[1.0.0, 2.0.0]", "1.0.0"));
        assert!(is_version_compatible("[1.0.0, 2.0.0]", "2.0.0"));
    }

    #[test]
    fn test_bounds_are_trimmed() {
        assert!(is_version_compatible("[  1.0.0  ,2.0.0 ]", "1.2.0"));
    }

    // ── Unconstrained ranges ────────────────────────────────────────

    #[test]
    fn test_empty_range_is_compatible() {
        assert!(is_version_compatible("", "0.0.1"));
    }

    #[test]
    fn test_unbracketed_range_is_compatible() {
        assert!(is_version_compatible("not-a-range", "0.0.1"));
        assert!(is_version_compatible("1.0.0, 2.0.0", "9.9.9"));
    }

    #[test]
    fn test_brackets_checked_on_raw_string() {
        assert!(is_version_compatible(" [1.0.0, 2.0.0]", "9.9.9"));
    }

    #[test]
    fn test_wrong_bound_count_is_compatible() {
        assert!(is_version_compatible("[1.0.0]", "9.9.9"));
        assert!(is_version_compatible("[1.0.0, 2.0.0, 3.0.0]", "9.9.9"));
    }

    // ── String ordering ─────────────────────────────────────────────

    #[test]
    fn test_comparison_is_lexicographic() {
        // "10.0.0" < "2.0.0" as strings.
        assert!(is_version_compatible("[1.0.0, 2.0.0]", "10.0.0"));
        assert!(!is_version_compatible("[1.0.0, 10.0.0]", "2.0.0"));
    }

    #[test]
    fn test_semver_helper() {
        assert_eq!(semver_in_range("1.0.0", "10.0.0", "2.0.0"), Some(true));
        assert_eq!(semver_in_range("1.0.0", "2.0.0", "10.0.0"), Some(false));
        assert_eq!(semver_in_range("1.0", "2.0.0", "1.5.0"), None);
    }
}
