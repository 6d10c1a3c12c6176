//! Compiled path templates.
//!
//! A template is a `/` separated list of segments. Each segment is either a
//! literal, a single segment parameter (`:name`), an optional trailing
//! wildcard (`*name`, zero or more segments) or a required trailing wildcard
//! (`+name`, one or more segments).
//!
//! ```
//! use ferrite::Pattern;
//!
//! let pattern = Pattern::compile("/files/:owner/*path").unwrap();
//! let params = pattern.match_path("/files/bob/a/b.txt").unwrap();
//! assert_eq!(params.get("owner"), Some("bob"));
//! assert_eq!(params.get("path"), Some("a/b.txt"));
//! ```

use std::collections::HashSet;
use std::fmt;

use regex::Regex;

use crate::error::{ParamKind, PatternError};
use crate::request::Params;

/// A compiled path template.
#[derive(Clone)]
pub struct Pattern {
    template: String,
    matcher: Matcher,
}

#[derive(Clone)]
enum Matcher {
    /// No parameters, plain string comparison.
    Equals(String),
    Capturing { regex: Regex, names: Vec<String> },
}

impl Pattern {
    /// Compiles a template.
    ///
    /// # Errors
    /// Fails for invalid or duplicated parameter names and for multi-segment
    /// wildcards that are not the last segment.
    pub fn compile(template: &str) -> Result<Pattern, PatternError> {
        let stripped = template.strip_prefix('/').unwrap_or(template);

        let mut segments: Vec<&str> = stripped.split('/').collect();
        while segments.len() > 1 && segments.last().map_or(false, |s| s.is_empty()) {
            segments.pop();
        }

        let mut names: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut source = String::new();
        let last = segments.len() - 1;

        for (index, segment) in segments.iter().enumerate() {
            if let Some(name) = segment.strip_prefix(':') {
                register(template, name, &mut seen, &mut names)?;
                source.push_str(&format!("/(?P<{}>[^/]+)", name));
            } else if let Some(name) = segment.strip_prefix('*') {
                if index != last {
                    return Err(PatternError::MisplacedWildcard(segment.to_string()));
                }
                register(template, name, &mut seen, &mut names)?;
                source.push_str(&format!("(?:/(?P<{}>.*))?", name));
            } else if let Some(name) = segment.strip_prefix('+') {
                if index != last {
                    return Err(PatternError::MisplacedWildcard(segment.to_string()));
                }
                register(template, name, &mut seen, &mut names)?;
                source.push_str(&format!("/(?P<{}>.+)", name));
            } else {
                source.push('/');
                source.push_str(&regex::escape(segment));
            }
        }

        let matcher = if names.is_empty() {
            let mut literal = String::from("/");
            literal.push_str(&segments.join("/"));
            Matcher::Equals(literal)
        } else {
            let regex = Regex::new(&format!("^{}$", source)).map_err(|e| PatternError::Regex {
                pattern: template.to_string(),
                reason: e.to_string(),
            })?;
            Matcher::Capturing { regex, names }
        };

        Ok(Pattern {
            template: template.to_string(),
            matcher,
        })
    }

    /// Returns `true` if `path` matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            Matcher::Equals(literal) => literal == path,
            Matcher::Capturing { regex, .. } => regex.is_match(path),
        }
    }

    /// Matches `path` and extracts the declared parameters in declaration
    /// order. An optional wildcard that matched nothing is reported as `""`.
    pub fn match_path(&self, path: &str) -> Option<Params> {
        match &self.matcher {
            Matcher::Equals(literal) => (literal == path).then(|| Params::new(ParamKind::Path)),
            Matcher::Capturing { regex, names } => {
                let captures = regex.captures(path)?;
                let entries = names
                    .iter()
                    .map(|name| {
                        let value = captures.name(name).map_or("", |m| m.as_str());
                        (name.clone(), value.to_string())
                    })
                    .collect();
                Some(Params::from_entries(ParamKind::Path, entries))
            }
        }
    }

    /// The template this pattern was compiled from.
    pub fn as_str(&self) -> &str {
        &self.template
    }
}

fn register(
    template: &str,
    name: &str,
    seen: &mut HashSet<String>,
    names: &mut Vec<String>,
) -> Result<(), PatternError> {
    if !is_identifier(name) {
        return Err(PatternError::InvalidIdentifier(name.to_string()));
    }
    if !seen.insert(name.to_string()) {
        return Err(PatternError::DuplicateIdentifier {
            name: name.to_string(),
            pattern: template.to_string(),
        });
    }
    names.push(name.to_string());
    Ok(())
}

/// `[a-zA-Z][0-9a-zA-Z]*`
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => chars.all(|c| c.is_ascii_alphanumeric()),
        _ => false,
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.template == other.template
    }
}

impl Eq for Pattern {}

impl std::hash::Hash for Pattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.template.hash(state);
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.template).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pattern: &str, path: &str) -> Option<Vec<(String, String)>> {
        Pattern::compile(pattern)
            .unwrap()
            .match_path(path)
            .map(|p| p.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    fn pairs(values: &[(&str, &str)]) -> Vec<(String, String)> {
        values.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_literal_patterns() {
        let pattern = Pattern::compile("/a/b").unwrap();
        assert!(pattern.matches("/a/b"));
        assert!(!pattern.matches("/a/b/c"));
        assert!(!pattern.matches("/a"));

        assert!(Pattern::compile("/").unwrap().matches("/"));
        assert!(Pattern::compile("a/b/").unwrap().matches("/a/b"));
    }

    #[test]
    fn test_literal_segments_are_escaped() {
        let pattern = Pattern::compile("/files/:name/v1.0").unwrap();
        assert!(pattern.matches("/files/a/v1.0"));
        assert!(!pattern.matches("/files/a/v100"));
    }

    /// Substituting concrete values yields exactly those values back.
    #[test]
    fn test_parameters_round_trip() {
        assert_eq!(
            params("/users/:id/posts/:post", "/users/42/posts/hello"),
            Some(pairs(&[("id", "42"), ("post", "hello")]))
        );
        assert_eq!(
            params("/files/:owner/+path", "/files/bob/a/b/c.txt"),
            Some(pairs(&[("owner", "bob"), ("path", "a/b/c.txt")]))
        );
        assert_eq!(params("/users/:id", "/users/1/2"), None);
    }

    #[test]
    fn test_optional_wildcard() {
        assert_eq!(params("/a/*path", "/a"), Some(pairs(&[("path", "")])));
        assert_eq!(params("/a/*path", "/a/"), Some(pairs(&[("path", "")])));
        assert_eq!(params("/a/*path", "/a/b/c"), Some(pairs(&[("path", "b/c")])));
        assert_eq!(params("/a/*path", "/ab"), None);
    }

    #[test]
    fn test_required_wildcard() {
        assert_eq!(params("/a/+path", "/a"), None);
        assert_eq!(params("/a/+path", "/a/"), None);
        assert_eq!(params("/a/+path", "/a/b"), Some(pairs(&[("path", "b")])));
    }

    #[test]
    fn test_duplicate_names_fail_at_compile_time() {
        assert!(matches!(
            Pattern::compile("/:x/:x"),
            Err(PatternError::DuplicateIdentifier { .. })
        ));
        assert!(matches!(
            Pattern::compile("/:x/*x"),
            Err(PatternError::DuplicateIdentifier { .. })
        ));
        assert!(matches!(
            Pattern::compile("/:x/+x"),
            Err(PatternError::DuplicateIdentifier { .. })
        ));
    }

    #[test]
    fn test_invalid_identifiers() {
        assert_eq!(
            Pattern::compile("/:1abc"),
            Err(PatternError::InvalidIdentifier("1abc".into()))
        );
        assert!(Pattern::compile("/:a-b").is_err());
        assert!(Pattern::compile("/*").is_err());
        assert!(Pattern::compile("/:ab9").is_ok());
    }

    #[test]
    fn test_wildcards_must_be_last() {
        assert_eq!(
            Pattern::compile("/*path/b"),
            Err(PatternError::MisplacedWildcard("*path".into()))
        );
        assert!(Pattern::compile("/+path/:id").is_err());
    }

    #[test]
    fn test_equality_by_template() {
        assert_eq!(Pattern::compile("/a/:id").unwrap(), Pattern::compile("/a/:id").unwrap());
        assert_ne!(Pattern::compile("/a/:id").unwrap(), Pattern::compile("/a/:key").unwrap());
        assert_eq!(Pattern::compile("/a/:id").unwrap().to_string(), "/a/:id");
    }
}
