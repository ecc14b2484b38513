//! Lenient semantic-version handling for engine and operator versions.
//!
//! Versions reported by operators and users are not always full `MAJOR.MINOR.PATCH`
//! triples: `v8.0`, `16` and `1.17.0-rc1` all appear in practice.

use std::cmp::Ordering;

use semver::Version;

/// Parse a possibly abbreviated version (`v1`, `1.2`, `v1.2.3-rc1`), padding
/// missing components with zero. A leading `v` is optional.
pub fn parse(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let core_end = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(core_end);

    let normalized = match core.matches('.').count() {
        0 => format!("{core}.0.0{suffix}"),
        1 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };
    Version::parse(&normalized).ok()
}

/// Total order over version strings: parseable versions compare semantically
/// and sort before unparseable ones, which compare lexically.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}
