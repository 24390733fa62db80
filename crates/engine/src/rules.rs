#![forbid(unsafe_code)]

//! Ad-block style domain rules.
//!
//! Supported syntax:
//!
//! * `! comment` and `[Adblock Plus 2.0]` headers are ignored;
//! * `@@rule` is an exception, it un-matches whatever `rule` matches;
//! * `||example.com` anchors at a domain boundary of the host;
//! * `|` at either end anchors at the start or end of the URL;
//! * `*` matches anything, `^` matches a separator or the end of the URL;
//! * `/.../` is a raw regular expression.
//!
//! Rule options (`$third-party`, ...) are not supported and rejected.
//! Matching is ASCII case-insensitive.

use crate::error::Error;
use regex::{RegexSet, RegexSetBuilder};
use tracing::debug;
use url::Url;

/// Scheme and any number of leading host labels.
const DOMAIN_ANCHOR: &str = r"^[a-z][a-z0-9+.\-]*://([^/?#]*\.)?";
const SEPARATOR: &str = r"(?:[^\w.%-]|$)";

/// Compiled whitelist. Immutable once built.
#[derive(Debug, Clone)]
pub struct DomainRules {
    rules: RegexSet,
    exceptions: RegexSet,
}

impl DomainRules {
    /// Compile `patterns`, one rule per entry.
    pub fn new<I, S>(patterns: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        let mut exceptions = Vec::new();
        for pattern in patterns {
            let line = pattern.as_ref().trim();
            if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
                continue;
            }
            match line.strip_prefix("@@") {
                Some(rule) => exceptions.push(translate(rule)?),
                None => rules.push(translate(line)?),
            }
        }
        debug!(
            rules = rules.len(),
            exceptions = exceptions.len(),
            "compiled domain rules"
        );

        Ok(Self {
            rules: build(&rules)?,
            exceptions: build(&exceptions)?,
        })
    }

    /// Rules that never match.
    pub fn empty() -> Self {
        Self {
            rules: RegexSet::empty(),
            exceptions: RegexSet::empty(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether a request for `url` is covered by the rules.
    pub fn matches(&self, url: &str) -> bool {
        self.rules.is_match(url) && !self.exceptions.is_match(url)
    }

    /// Whether a request to `https://<domain>/` is covered by the rules.
    pub fn matches_domain(&self, domain: &str) -> bool {
        if self.is_empty() {
            return false;
        }
        match request_url(domain) {
            Some(url) => self.matches(url.as_str()),
            None => false,
        }
    }
}

impl Default for DomainRules {
    fn default() -> Self {
        Self::empty()
    }
}

/// The URL a DNS question for `domain` stands for.
pub fn request_url(domain: &str) -> Option<Url> {
    Url::parse(&format!("https://{domain}/")).ok()
}

fn build(patterns: &[String]) -> Result<RegexSet, Error> {
    Ok(RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()?)
}

fn translate(rule: &str) -> Result<String, Error> {
    let invalid = |reason: &str| Error::InvalidRule {
        rule: rule.to_owned(),
        reason: reason.to_owned(),
    };

    if rule.len() > 2 && rule.starts_with('/') && rule.ends_with('/') {
        return Ok(rule[1..rule.len() - 1].to_owned());
    }
    if rule.contains('$') {
        return Err(invalid("rule options are not supported"));
    }

    let mut regex = String::with_capacity(rule.len() * 2);
    let mut body = rule;
    if let Some(rest) = body.strip_prefix("||") {
        regex.push_str(DOMAIN_ANCHOR);
        body = rest;
    } else if let Some(rest) = body.strip_prefix('|') {
        regex.push('^');
        body = rest;
    }
    let anchored_end = match body.strip_suffix('|') {
        Some(rest) => {
            body = rest;
            true
        }
        None => false,
    };
    if body.is_empty() {
        return Err(invalid("empty pattern"));
    }

    let mut literal = [0u8; 4];
    for c in body.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '^' => regex.push_str(SEPARATOR),
            c => regex.push_str(&regex::escape(c.encode_utf8(&mut literal))),
        }
    }
    if anchored_end {
        regex.push('$');
    }
    Ok(regex)
}
