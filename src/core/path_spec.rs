//! Route templates.
//!
//! A template is literal text with `{name}` and `{name:regex}` parameters; a
//! `*` standing alone as a path segment is a catch-all parameter named
//! [`WILDCARD`]. The template compiles to one anchored regex with a named
//! group per parameter.
use std::{cmp::Ordering, collections::HashMap, fmt};

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use super::error::RouterError;

/// Parameter name given to a bare `*` segment.
pub const WILDCARD: &str = "_wildcard";

const DEFAULT_PARAM_PATTERN: &str = "[^/]+";
const WILDCARD_PATTERN: &str = ".*";

static PARAM_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid regex"));

#[derive(Clone)]
pub struct PathSpec {
    template: String,
    regex: Regex,
    names: Vec<String>,
}

impl PathSpec {
    pub fn new(template: &str) -> Result<Self, RouterError> {
        Self::compile(template, false)
    }

    pub fn compile(template: &str, case_insensitive: bool) -> Result<Self, RouterError> {
        let invalid = |reason: String| RouterError::InvalidTemplate {
            template: template.to_string(),
            reason,
        };

        let chars: Vec<char> = template.chars().collect();
        let mut pattern = String::from("^");
        let mut names: Vec<String> = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '{' => {
                    let close = matching_brace(&chars, i)
                        .ok_or_else(|| invalid(format!("unclosed '{{' at offset {i}")))?;
                    let token: String = chars[i + 1..close].iter().collect();
                    let (name, param_pattern) = match token.split_once(':') {
                        Some((name, regex)) => (name.trim(), regex),
                        None => (token.trim(), DEFAULT_PARAM_PATTERN),
                    };
                    validate_name(name).map_err(invalid)?;
                    if param_pattern.is_empty() {
                        return Err(invalid(format!("empty pattern for parameter '{name}'")));
                    }
                    if names.iter().any(|existing| existing == name) {
                        return Err(invalid(format!("duplicate parameter '{name}'")));
                    }
                    pattern.push_str(&regex::escape(&std::mem::take(&mut literal)));
                    pattern.push_str(&format!("(?P<p{}>{})", names.len(), param_pattern));
                    names.push(name.to_string());
                    i = close + 1;
                }
                '}' => return Err(invalid(format!("unmatched '}}' at offset {i}"))),
                '*' if is_bare_segment(&chars, i) => {
                    let name = match names.iter().filter(|n| n.starts_with(WILDCARD)).count() {
                        0 => WILDCARD.to_string(),
                        n => format!("{WILDCARD}{n}"),
                    };
                    pattern.push_str(&regex::escape(&std::mem::take(&mut literal)));
                    pattern.push_str(&format!("(?P<p{}>{})", names.len(), WILDCARD_PATTERN));
                    names.push(name);
                    i += 1;
                }
                c => {
                    literal.push(c);
                    i += 1;
                }
            }
        }
        pattern.push_str(&regex::escape(&literal));
        pattern.push('$');

        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            template: template.to_string(),
            regex,
            names,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Parameter names in template order.
    pub fn param_names(&self) -> &[String] {
        &self.names
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Match the whole of `path`, returning every parameter (percent-decoded)
    /// or `None` when the path does not match.
    pub fn match_and_collect(&self, path: &str) -> Option<HashMap<String, String>> {
        let captures = self.regex.captures(path)?;
        let mut params = HashMap::with_capacity(self.names.len());
        for (index, name) in self.names.iter().enumerate() {
            let raw = captures
                .name(&format!("p{index}"))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let value = urlencoding::decode(raw)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| raw.to_string());
            params.insert(name.clone(), value);
        }
        Some(params)
    }
}

fn matching_brace(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, c) in chars[open..].iter().enumerate() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_bare_segment(chars: &[char], index: usize) -> bool {
    let starts = index == 0 || chars[index - 1] == '/';
    let ends = index + 1 == chars.len() || chars[index + 1] == '/';
    starts && ends
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("empty parameter name".to_string());
    }
    if !PARAM_NAME.is_match(name) {
        return Err(format!("invalid parameter name '{name}'"));
    }
    Ok(())
}

fn rank(c: char) -> u8 {
    match c {
        '{' => 1,
        '*' => 2,
        _ => 0,
    }
}

/// Specificity order: at the first differing character literal text sorts
/// before `{`, which sorts before `*`. When one template is a prefix of the
/// other the longer one sorts first.
pub fn compare_templates(a: &str, b: &str) -> Ordering {
    for (x, y) in a.chars().zip(b.chars()) {
        if x != y {
            return rank(x).cmp(&rank(y)).then(x.cmp(&y));
        }
    }
    b.chars().count().cmp(&a.chars().count())
}

impl PartialEq for PathSpec {
    fn eq(&self, other: &Self) -> bool {
        self.template == other.template
    }
}

impl Eq for PathSpec {}

impl PartialOrd for PathSpec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathSpec {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_templates(&self.template, &other.template)
    }
}

impl fmt::Debug for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathSpec")
            .field("template", &self.template)
            .field("names", &self.names)
            .finish()
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_parameters() {
        let spec = PathSpec::new("/api/{id}/items/{itemId:[0-9]+}").unwrap();
        let params = spec.match_and_collect("/api/42/items/7").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params["id"], "42");
        assert_eq!(params["itemId"], "7");
        assert!(spec.match_and_collect("/api/42/items/abc").is_none());
    }

    #[test]
    fn test_regex_with_braces() {
        let spec = PathSpec::new("/year/{y:[0-9]{4}}").unwrap();
        assert!(spec.matches("/year/2024"));
        assert!(!spec.matches("/year/24"));
    }

    #[test]
    fn test_no_parameters_yields_empty_map() {
        let spec = PathSpec::new("/health").unwrap();
        assert_eq!(spec.match_and_collect("/health"), Some(HashMap::new()));
        assert_eq!(spec.match_and_collect("/health/x"), None);
    }

    #[test]
    fn test_wildcard_segment() {
        let spec = PathSpec::new("/static/*").unwrap();
        let params = spec.match_and_collect("/static/css/site.css").unwrap();
        assert_eq!(params[WILDCARD], "css/site.css");
        // a star inside a segment is literal
        let spec = PathSpec::new("/files/*.txt").unwrap();
        assert!(spec.matches("/files/*.txt"));
        assert!(!spec.matches("/files/a.txt"));
    }

    #[test]
    fn test_literal_text_is_escaped() {
        let spec = PathSpec::new("/v1.0/(x)").unwrap();
        assert!(spec.matches("/v1.0/(x)"));
        assert!(!spec.matches("/v1x0/(x)"));
    }

    #[test]
    fn test_values_are_percent_decoded() {
        let spec = PathSpec::new("/files/{name}").unwrap();
        let params = spec.match_and_collect("/files/hello%20world").unwrap();
        assert_eq!(params["name"], "hello world");
    }

    #[test]
    fn test_case_insensitive_compile() {
        let spec = PathSpec::compile("/Users/{id}", true).unwrap();
        assert!(spec.matches("/users/1"));
        assert!(!PathSpec::new("/Users/{id}").unwrap().matches("/users/1"));
    }

    #[test]
    fn test_invalid_templates() {
        for template in ["/a/{", "/a/}", "/a/{}", "/a/{x}/{x}", "/a/{x:(}", "/a/{x y}"] {
            assert!(
                matches!(
                    PathSpec::new(template),
                    Err(RouterError::InvalidTemplate { .. })
                ),
                "{template} should be rejected"
            );
        }
    }

    #[test]
    fn test_specificity_order() {
        let mut specs: Vec<PathSpec> = ["/users/*", "/users/{id}", "/users/admin"]
            .into_iter()
            .map(|t| PathSpec::new(t).unwrap())
            .collect();
        specs.sort();
        let order: Vec<&str> = specs.iter().map(|s| s.template()).collect();
        assert_eq!(order, vec!["/users/admin", "/users/{id}", "/users/*"]);
    }

    #[test]
    fn test_prefix_ties_prefer_longer() {
        assert_eq!(compare_templates("/a/b", "/a"), Ordering::Less);
        assert_eq!(compare_templates("/a", "/a"), Ordering::Equal);
    }
}
