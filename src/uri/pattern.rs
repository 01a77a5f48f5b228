use globset::{GlobBuilder, GlobMatcher};

use super::decode;
use crate::error::{FileOpError, FileOpResult};

/// Matcher for one encoded path segment containing `*` or `?`.
///
/// Wildcards never cross a `/`. Escaped `%2A`/`%3F` match literally.
/// A leading wildcard does not match a leading `.`, so `*` skips dotfiles
/// while `.*` selects them.
#[derive(Debug, Clone)]
pub struct SegmentPattern {
    matcher: GlobMatcher,
    skip_hidden: bool,
}

impl SegmentPattern {
    pub fn new(encoded: &str, case_insensitive: bool) -> FileOpResult<Self> {
        let mut glob = String::with_capacity(encoded.len() * 2);
        let mut literal = String::new();

        for ch in encoded.chars() {
            match ch {
                '*' | '?' => {
                    push_escaped(&mut glob, &decode(&literal));
                    literal.clear();
                    glob.push(ch);
                }
                _ => literal.push(ch),
            }
        }
        push_escaped(&mut glob, &decode(&literal));

        let compiled = GlobBuilder::new(&glob)
            .literal_separator(true)
            .backslash_escape(true)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| FileOpError::malformed(encoded, e.to_string()))?;

        Ok(Self {
            matcher: compiled.compile_matcher(),
            skip_hidden: encoded.starts_with(['*', '?']),
        })
    }

    /// Match against a decoded entry name.
    pub fn is_match(&self, name: &str) -> bool {
        if self.skip_hidden && name.starts_with('.') {
            return false;
        }
        self.matcher.is_match(name)
    }
}

fn push_escaped(glob: &mut String, literal: &str) {
    for ch in literal.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '{' | '}' | '\\' | '!' | ',') {
            glob.push('\\');
        }
        glob.push(ch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_and_question_mark() {
        let p = SegmentPattern::new("f*.tmp", false).unwrap();
        assert!(p.is_match("f.tmp"));
        assert!(p.is_match("found.tmp"));
        assert!(!p.is_match("other.txt"));

        let q = SegmentPattern::new("a?c", false).unwrap();
        assert!(q.is_match("abc"));
        assert!(!q.is_match("ac"));
    }

    #[test]
    fn test_escaped_wildcards_are_literal() {
        let p = SegmentPattern::new("x%2A*", false).unwrap();
        assert!(p.is_match("x*yz"));
        assert!(!p.is_match("xyz"));
    }

    #[test]
    fn test_glob_metacharacters_in_names() {
        let p = SegmentPattern::new("[draft]%7B1%7D*", false).unwrap();
        assert!(p.is_match("[draft]{1}.md"));
        assert!(!p.is_match("d{1}.md"));
    }

    #[test]
    fn test_leading_wildcard_skips_dotfiles() {
        let star = SegmentPattern::new("*", false).unwrap();
        assert!(star.is_match("visible"));
        assert!(!star.is_match(".hidden"), "Star should not match a dotfile");
        assert!(!SegmentPattern::new("?git", false).unwrap().is_match(".git"));

        let dotted = SegmentPattern::new(".*", false).unwrap();
        assert!(dotted.is_match(".hidden"), "Explicit dot should match dotfiles");
        assert!(SegmentPattern::new("a*", false).unwrap().is_match("a.b"));
    }

    #[test]
    fn test_case_sensitivity() {
        let sensitive = SegmentPattern::new("*.TXT", false).unwrap();
        assert!(!sensitive.is_match("a.txt"));
        let insensitive = SegmentPattern::new("*.TXT", true).unwrap();
        assert!(insensitive.is_match("a.txt"));
    }
}
