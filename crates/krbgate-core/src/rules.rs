/// Bypass rules for the `no-proxy` host list.
///
/// Entries come in three shapes: plain host names matched verbatim,
/// `.suffix` entries covering a domain and everything under it, and
/// glob-style entries using `*`/`?`.

use anyhow::{Context, Result};
use regex::Regex;

enum Pattern {
    /// Whole-host comparison, e.g. `intranet`.
    Exact(String),
    /// Domain-and-subdomains form written with a leading dot, e.g.
    /// `.corp.local`. Stored without the dot, lowercased.
    Suffix(String),
    /// Anything containing `*` or `?`, compiled to an anchored regex.
    Glob(Regex),
}

impl Pattern {
    fn compile(raw: &str) -> Result<Option<Pattern>> {
        let pattern = raw.trim();
        if pattern.is_empty() {
            return Ok(None);
        }
        if let Some(suffix) = pattern.strip_prefix('.') {
            return Ok(Some(Pattern::Suffix(suffix.to_ascii_lowercase())));
        }
        if pattern.contains(['*', '?']) {
            return Ok(Some(Pattern::Glob(glob_regex(pattern)?)));
        }
        Ok(Some(Pattern::Exact(pattern.to_ascii_lowercase())))
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            Pattern::Exact(name) => host.eq_ignore_ascii_case(name),
            Pattern::Suffix(suffix) => {
                let host = host.to_ascii_lowercase();
                host == *suffix
                    || host
                        .strip_suffix(suffix.as_str())
                        .is_some_and(|head| head.ends_with('.'))
            }
            Pattern::Glob(re) => re.is_match(host),
        }
    }
}

/// Translate a glob into an anchored, case-insensitive regex. Literal runs
/// are escaped whole; `*` spans any run of characters, `?` exactly one.
fn glob_regex(pattern: &str) -> Result<Regex> {
    let mut translated = String::from(r"(?i)\A");
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                if !literal.is_empty() {
                    translated.push_str(&regex::escape(&literal));
                    literal.clear();
                }
                translated.push_str(if c == '*' { ".*" } else { "." });
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        translated.push_str(&regex::escape(&literal));
    }
    translated.push_str(r"\z");
    Regex::new(&translated).with_context(|| format!("invalid no-proxy pattern: {}", pattern))
}

// ---------------------------------------------------------------------------
// NoProxy — compiled once at startup, consulted per request
// ---------------------------------------------------------------------------

/// Compiled `no-proxy` pattern list deciding which target hosts bypass the
/// upstream proxy.
pub struct NoProxy {
    patterns: Vec<Pattern>,
}

impl NoProxy {
    pub fn new(list: &[String]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(list.len());
        for raw in list {
            if let Some(pattern) = Pattern::compile(raw)? {
                patterns.push(pattern);
            }
        }
        Ok(NoProxy { patterns })
    }

    /// Split a comma-separated pattern list as it appears on the CLI.
    pub fn parse(list: &str) -> Vec<String> {
        list.split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                (!entry.is_empty()).then(|| entry.to_string())
            })
            .collect()
    }

    /// Returns `true` if `host` must bypass the upstream proxy.
    pub fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(host))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn no_proxy(patterns: &[&str]) -> NoProxy {
        let owned: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        NoProxy::new(&owned).unwrap()
    }

    #[test]
    fn test_exact_host() {
        let np = no_proxy(&["intranet"]);
        assert!(np.matches("intranet"));
        assert!(np.matches("INTRANET"));
        assert!(!np.matches("intranet.example.com"));
    }

    #[test]
    fn test_glob_star() {
        let np = no_proxy(&["*.example.com"]);
        assert!(np.matches("sub.example.com"));
        assert!(np.matches("a.b.Example.COM"));
        assert!(!np.matches("example.com"));
    }

    #[test]
    fn test_glob_question_mark() {
        let np = no_proxy(&["h?st"]);
        assert!(np.matches("host"));
        assert!(!np.matches("hst"));
        assert!(!np.matches("hoost"));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        // The dots are literal dots, not regex wildcards.
        let np = no_proxy(&["10.0.0.*"]);
        assert!(np.matches("10.0.0.7"));
        assert!(!np.matches("10x0y0z7"));
    }

    #[test]
    fn test_dot_suffix_covers_domain_and_subdomains() {
        let np = no_proxy(&[".corp.local"]);
        assert!(np.matches("corp.local"));
        assert!(np.matches("git.corp.local"));
        assert!(np.matches("a.b.corp.local"));
        assert!(!np.matches("notcorp.local"));
    }

    #[test]
    fn test_parse_list_drops_blanks() {
        let patterns = NoProxy::parse("intranet, .corp.local,,10.0.0.1");
        assert_eq!(patterns, vec!["intranet", ".corp.local", "10.0.0.1"]);
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let np = no_proxy(&[]);
        assert!(np.is_empty());
        assert!(!np.matches("example.com"));
    }
}
