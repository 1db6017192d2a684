//! Small helpers.

/// Glob matching over primary names: `*` matches any run, `?` any single
/// character, everything else literally.
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(pat: &[u8], text: &[u8]) -> bool {
        match (pat.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pat[1..], text) || (!text.is_empty() && inner(pat, &text[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&pat[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => inner(&pat[1..], &text[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("*", "anything", true)]
    #[test_case("cache", "cache", true)]
    #[test_case("cache", "cache2", false)]
    #[test_case("cache*", "cache-eu", true)]
    #[test_case("*-eu", "cache-eu", true)]
    #[test_case("c?che", "cache", true)]
    #[test_case("c?che", "cche", false)]
    #[test_case("*cache*", "my-cache-eu", true)]
    #[test_case("", "", true)]
    #[test_case("", "x", false)]
    fn matches(pattern: &str, name: &str, expected: bool) {
        assert_eq!(glob_match(pattern, name), expected);
    }
}
