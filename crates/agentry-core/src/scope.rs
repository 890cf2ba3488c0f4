//! Write-scope glob matching.
//!
//! A write scope is a set of path globs (relative to the repository root)
//! a run is authorised to modify. Supported syntax:
//!
//! - `*` matches within one path segment
//! - `**` matches across segments; `**/` may also match nothing
//! - `?` matches one character other than `/`
//!
//! Anything else matches literally.

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled set of write-scope globs.
#[derive(Debug, Clone)]
pub struct WriteScope {
    patterns: Vec<String>,
    compiled: Vec<Regex>,
}

impl WriteScope {
    /// Compile a list of glob patterns.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let compiled = patterns
            .iter()
            .map(String::as_str)
            .map(compile_glob)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns, compiled })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `path` is covered by any pattern. Leading `./` is ignored.
    pub fn allows(&self, path: &str) -> bool {
        let path = path.strip_prefix("./").unwrap_or(path);
        self.compiled.iter().any(|re| re.is_match(path))
    }

    /// Paths from `paths` that fall outside the scope, in input order.
    pub fn violations<'a, I>(&self, paths: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths.into_iter().filter(|p| !self.allows(p)).collect()
    }
}

fn compile_glob(pattern: &str) -> Result<Regex> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return Err(Error::ScopePattern {
            pattern: pattern.to_string(),
            reason: "pattern is empty".to_string(),
        });
    }
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);

    let mut re = String::with_capacity(trimmed.len() * 2 + 2);
    re.push('^');
    let mut chars = trimmed.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    re.push_str("(?:.*/)?");
                } else {
                    re.push_str(".*");
                }
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');

    Regex::new(&re).map_err(|e| Error::ScopePattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
