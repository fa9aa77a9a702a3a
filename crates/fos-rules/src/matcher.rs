//! Rule Matcher
//!
//! Pure URL normalization and rule selection. No state.
//!
//! Matching rules:
//! - Host: exact, or any subdomain when `include_subdomains` is set
//! - Path: plain string prefix (`/docs` matches `/docs/intro` and `/docsearch`)
//! - Selection: the first enabled matching rule in list order wins

use crate::rule::Rule;
use url::Url;

/// Normalized host and path of a browsed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    /// Lowercase host without a leading `www.`
    pub host: String,
    /// Always starts with `/`
    pub path: String,
}

/// Host and optional path constraint parsed from user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlInput {
    pub host: String,
    pub path: Option<String>,
}

/// Result of selecting a rule for a URL.
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    /// Winning rule (first matching enabled rule)
    pub rule: Option<&'a Rule>,
    /// Every enabled rule that matched, in list order
    pub matching: Vec<&'a Rule>,
}

/// Lowercase and strip one leading `www.`.
pub fn normalize_host(host: &str) -> String {
    let lower = host.trim().to_lowercase();
    match lower.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// Normalize a rule path. `None` means "no path constraint".
pub fn normalize_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return None;
    }

    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{}", trimmed))
    }
}

/// Parse a browsed URL. Returns `None` for non-http(s) or malformed URLs.
pub fn parse_url(raw: &str) -> Option<UrlParts> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let host = normalize_host(url.host_str()?);
    if host.is_empty() {
        return None;
    }

    let path = match url.path() {
        "" => "/".to_string(),
        p => p.to_string(),
    };

    Some(UrlParts { host, path })
}

/// Parse what a user typed into the "website" field.
///
/// The scheme is optional; `example.com/docs` is read as
/// `https://example.com/docs`.
pub fn parse_url_input(raw: &str) -> Option<UrlInput> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let url = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("https://{}", trimmed))
    }
    .ok()?;

    let host = normalize_host(url.host_str()?);
    if host.is_empty() {
        return None;
    }

    Some(UrlInput {
        host,
        path: normalize_path(url.path()),
    })
}

/// Display label: `host` followed by the path when there is one.
pub fn host_label(host: &str, path: Option<&str>) -> String {
    match path {
        Some(p) => format!("{}{}", host, p),
        None => host.to_string(),
    }
}

/// Does `rule` cover `parts`? Ignores the `enabled` flag.
pub fn matches(parts: &UrlParts, rule: &Rule) -> bool {
    let host_matches = parts.host == rule.host
        || (rule.include_subdomains
            && parts
                .host
                .strip_suffix(rule.host.as_str())
                .is_some_and(|prefix| prefix.ends_with('.')));

    if !host_matches {
        return false;
    }

    match rule.path.as_deref() {
        None => true,
        Some(path) => parts.path.starts_with(path),
    }
}

/// Pick the rule for `parts`. Priority is list position, not specificity.
pub fn select<'a>(rules: &'a [Rule], parts: &UrlParts) -> Selection<'a> {
    let matching: Vec<&Rule> = rules
        .iter()
        .filter(|rule| rule.enabled && matches(parts, rule))
        .collect();

    Selection {
        rule: matching.first().copied(),
        matching,
    }
}
