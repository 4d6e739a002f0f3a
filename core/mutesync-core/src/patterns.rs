//! URL match patterns used to find conferencing tabs.
//!
//! Patterns follow the extension match-pattern shape
//! `<scheme>://<host><path>`, where `*` in the scheme means http or https,
//! a leading `*.` in the host matches any subdomain, and `*` elsewhere
//! matches any run of characters.

use regex::Regex;

use crate::error::{MuteError, Result};

#[derive(Debug, Clone)]
pub struct UrlPattern {
    raw: String,
    regex: Regex,
}

impl UrlPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |details: &str| MuteError::InvalidPattern {
            pattern: raw.to_string(),
            details: details.to_string(),
        };

        if raw == "<all_urls>" {
            return Self::compile(raw, r"^(?:https?|file)://.*$");
        }

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme separator"))?;
        let scheme_re = match scheme {
            "*" => "https?".to_string(),
            "http" | "https" | "file" => regex::escape(scheme),
            _ => return Err(invalid("unsupported scheme")),
        };

        let (host, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => return Err(invalid("missing path")),
        };
        let host_re = if host == "*" {
            "[^/]+".to_string()
        } else if let Some(domain) = host.strip_prefix("*.") {
            format!(r"(?:[^/]+\.)?{}", regex::escape(domain))
        } else if host.contains('*') {
            return Err(invalid("wildcard only allowed as leading host label"));
        } else {
            regex::escape(host)
        };

        let path_re = path
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        Self::compile(raw, &format!("^{}://{}{}$", scheme_re, host_re, path_re))
    }

    fn compile(raw: &str, expression: &str) -> Result<Self> {
        let regex = Regex::new(expression).map_err(|err| MuteError::InvalidPattern {
            pattern: raw.to_string(),
            details: err.to_string(),
        })?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, url: &str) -> bool {
        // Query strings and fragments do not take part in matching.
        let trimmed = url.split(['?', '#']).next().unwrap_or(url);
        self.regex.is_match(trimmed)
    }
}

pub fn matches_any(patterns: &[UrlPattern], url: &str) -> bool {
    patterns.iter().any(|pattern| pattern.matches(url))
}
