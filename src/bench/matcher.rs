//! Benchmark name matching
//!
//! A run pattern is split on unbracketed, unparenthesized `/` into one
//! regular expression per nesting level. A unit runs when every level of its
//! name matches the corresponding level of the pattern.

use crate::{BenchkitError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Pattern-matching capability
pub trait MatchString: Send + Sync {
    /// Whether `name` matches `pattern`; an invalid pattern is an error
    fn match_string(&self, pattern: &str, name: &str) -> Result<bool>;
}

/// `MatchString` backed by the `regex` crate, with compiled patterns cached
#[derive(Debug, Default)]
pub struct RegexMatcher {
    cache: Mutex<HashMap<String, Regex>>,
}

impl RegexMatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MatchString for RegexMatcher {
    fn match_string(&self, pattern: &str, name: &str) -> Result<bool> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(re) = cache.get(pattern) {
            return Ok(re.is_match(name));
        }
        let re = Regex::new(pattern)?;
        let matched = re.is_match(name);
        cache.insert(pattern.to_string(), re);
        Ok(matched)
    }
}

/// Run-pattern filter plus the registry of sub-unit names
pub struct Matcher {
    filter: Vec<String>,
    match_fn: Arc<dyn MatchString>,
    sub_names: Mutex<HashMap<String, u32>>,
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::all()
    }
}

impl Matcher {
    /// Matcher for `pattern`; every level must be a valid pattern.
    /// `flag` names the option the pattern came from in error messages.
    pub fn new(pattern: &str, flag: &str, match_fn: Arc<dyn MatchString>) -> Result<Self> {
        let mut filter = Vec::new();
        if !pattern.is_empty() {
            filter = split_regex(pattern);
            for (i, level) in filter.iter_mut().enumerate() {
                *level = rewrite(level);
                // Validate the pattern on a non-empty name.
                if let Err(err) = match_fn.match_string(level, "non-empty") {
                    return Err(BenchkitError::ConfigError(format!(
                        "invalid regexp for element {} of {} ({:?}): {}",
                        i, flag, level, err
                    )));
                }
            }
        }
        Ok(Self {
            filter,
            match_fn,
            sub_names: Mutex::new(HashMap::new()),
        })
    }

    /// Matcher that accepts every name
    pub fn all() -> Self {
        Self {
            filter: Vec::new(),
            match_fn: Arc::new(RegexMatcher::new()),
            sub_names: Mutex::new(HashMap::new()),
        }
    }

    /// Full name of sub-unit `subname` and whether it should run.
    ///
    /// `parent` is the name of the creating unit, `None` for top-level units.
    /// Returns the name, whether it matched, and whether it only matched a
    /// prefix of the pattern levels (so its own sub-units must be filtered).
    pub fn full_name(&self, parent: Option<&str>, subname: &str) -> (String, bool, bool) {
        let name = match parent {
            Some(parent) => self.unique(parent, &rewrite(subname)),
            None => subname.to_string(),
        };

        let elems: Vec<&str> = name.split('/').collect();
        for (i, elem) in elems.iter().enumerate() {
            let Some(pattern) = self.filter.get(i) else {
                break;
            };
            if !self.match_fn.match_string(pattern, elem).unwrap_or(false) {
                return (name, false, false);
            }
        }
        let partial = elems.len() < self.filter.len();
        (name, true, partial)
    }

    /// Whether a top-level `name` passes the first pattern level
    pub fn matches_top_level(&self, name: &str) -> bool {
        self.full_name(None, name).1
    }

    /// Forget every sub-unit name handed out so far
    pub fn reset(&self) {
        self.sub_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn unique(&self, parent: &str, subname: &str) -> String {
        let mut sub_names = self.sub_names.lock().unwrap_or_else(PoisonError::into_inner);
        let mut name = format!("{}/{}", parent, subname);
        let mut empty = subname.is_empty();
        loop {
            let next = sub_names.get(&name).copied();
            match next {
                None if !empty => {
                    sub_names.insert(name.clone(), 1);
                    return name;
                }
                _ => {
                    let count = next.unwrap_or(0);
                    sub_names.insert(name.clone(), count + 1);
                    name = format!("{}#{:02}", name, count);
                    empty = false;
                }
            }
        }
    }
}

/// Split a pattern on `/` outside brackets and parentheses
pub fn split_regex(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut brackets = 0i32;
    let mut parens = 0i32;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match c {
            '[' => brackets += 1,
            ']' => brackets = (brackets - 1).max(0),
            '(' if brackets == 0 => parens += 1,
            ')' if brackets == 0 => parens -= 1,
            '\\' => {
                current.push(c);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
                continue;
            }
            '/' if brackets == 0 && parens == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);
    parts
}

/// Replace whitespace with `_` and escape non-printable characters
pub fn rewrite(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_whitespace() {
            out.push('_');
        } else if c.is_control() {
            out.extend(c.escape_default());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(pattern: &str) -> Matcher {
        Matcher::new(pattern, "--bench", Arc::new(RegexMatcher::new())).unwrap()
    }

    #[test]
    fn test_split_regex_respects_groups() {
        assert_eq!(split_regex("A/B"), vec!["A", "B"]);
        assert_eq!(split_regex("A[/]B/C"), vec!["A[/]B", "C"]);
        assert_eq!(split_regex("(a/b)/c"), vec!["(a/b)", "c"]);
        assert_eq!(split_regex("a\\/b"), vec!["a\\/b"]);
        assert_eq!(split_regex(""), vec![""]);
    }

    #[test]
    fn test_rewrite() {
        assert_eq!(rewrite("a b\tc"), "a_b_c");
        assert_eq!(rewrite("x\u{7}"), "x\\u{7}");
    }

    #[test]
    fn test_levels_match_independently() {
        let m = matcher("Sort/size=1K");
        assert!(m.full_name(None, "BenchmarkSort").1);
        assert!(!m.full_name(None, "BenchmarkHash").1);
        let (name, ok, partial) = m.full_name(Some("BenchmarkSort"), "size=1K");
        assert_eq!(name, "BenchmarkSort/size=1K");
        assert!(ok && !partial);
        assert!(!m.full_name(Some("BenchmarkSort"), "size=1M").1);
    }

    #[test]
    fn test_partial_match_reported() {
        let m = matcher("Sort/small");
        let (_, ok, partial) = m.full_name(None, "BenchmarkSort");
        assert!(ok && partial);
    }

    #[test]
    fn test_unique_names() {
        let m = Matcher::all();
        assert_eq!(m.full_name(Some("B"), "x").0, "B/x");
        assert_eq!(m.full_name(Some("B"), "x").0, "B/x#01");
        assert_eq!(m.full_name(Some("B"), "x").0, "B/x#02");
        assert_eq!(m.full_name(Some("B"), "").0, "B/#00");
        assert_eq!(m.full_name(Some("B"), "").0, "B/#01");
        m.reset();
        assert_eq!(m.full_name(Some("B"), "x").0, "B/x");
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = Matcher::new("a/(", "--bench", Arc::new(RegexMatcher::new())).unwrap_err();
        assert!(matches!(err, BenchkitError::ConfigError(_)));
        assert!(err.to_string().contains("element 1"));
    }
}
