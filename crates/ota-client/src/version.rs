//! Version comparison for `MAJOR.MINOR.PATCH[-pre]` strings.

use std::cmp::Ordering;

/// How a candidate version relates to the installed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    Newer,
    Same,
    Older,
}

impl From<Ordering> for VersionOrdering {
    fn from(ordering: Ordering) -> Self {
        match ordering {
            Ordering::Greater => Self::Newer,
            Ordering::Equal => Self::Same,
            Ordering::Less => Self::Older,
        }
    }
}

/// Whether `version` carries a pre-release suffix.
pub fn is_prerelease(version: &str) -> bool {
    version.contains('-')
}

/// Compare candidate `new` against installed `old`.
///
/// Identical strings are `Same`. A pre-release candidate is always `Older`,
/// whatever it is compared against, including another pre-release. A release
/// candidate is `Newer` than a pre-release. Otherwise the first three
/// dot-separated components are compared numerically; a component's value is
/// its leading digits, and missing or non-numeric components count as 0.
pub fn compare(new: &str, old: &str) -> VersionOrdering {
    if new == old {
        return VersionOrdering::Same;
    }
    if is_prerelease(new) {
        return VersionOrdering::Older;
    }
    if is_prerelease(old) {
        return VersionOrdering::Newer;
    }
    components(new).cmp(&components(old)).into()
}

fn components(version: &str) -> [u32; 3] {
    let mut parts = version.split('.');
    [(); 3].map(|_| parts.next().map_or(0, leading_number))
}

fn leading_number(part: &str) -> u32 {
    part.bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u32, |acc, digit| {
            acc.saturating_mul(10).saturating_add(u32::from(digit - b'0'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use VersionOrdering::*;

    #[test]
    fn test_identical_strings_are_same() {
        assert_eq!(compare("1.2.3", "1.2.3"), Same);
        assert_eq!(compare("1.2.3-beta", "1.2.3-beta"), Same);
        assert_eq!(compare("", ""), Same);
    }

    #[test]
    fn test_numeric_ordering() {
        assert_eq!(compare("2.0.0", "1.9.0"), Newer);
        assert_eq!(compare("1.10.0", "1.9.9"), Newer);
        assert_eq!(compare("1.2.3", "1.2.4"), Older);
        assert_eq!(compare("0.0.10", "0.0.9"), Newer);
    }

    #[test]
    fn test_missing_components_are_zero() {
        assert_eq!(compare("1.2", "1.2.0"), Same);
        assert_eq!(compare("1", "0.9.9"), Newer);
        assert_eq!(compare("1.x.5", "1.0.4"), Newer);
    }

    #[test]
    fn test_prerelease_is_always_older() {
        assert_eq!(compare("9.9.9-rc1", "1.0.0"), Older);
        assert_eq!(compare("1.0.0", "9.9.9-rc1"), Newer);
    }

    #[test]
    fn test_prerelease_candidate_never_newer() {
        assert_eq!(compare("2.0.0-rc2", "2.0.0-rc1"), Older);
        assert_eq!(compare("2.0.0-rc1", "2.0.0-rc2"), Older);
        assert_eq!(compare("2.1.0-rc1", "2.0.0-rc9"), Older);
        assert_eq!(compare("2.0.0-rc1", "1.9.0"), Older);
    }

    #[test]
    fn test_huge_components_saturate() {
        assert_eq!(compare("99999999999.0.0", "4294967295.0.0"), Same);
        assert_eq!(leading_number("12abc"), 12);
    }
}
