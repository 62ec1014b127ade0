//! Rule compilation and the first-match rule engine

use regex::Regex;
use std::fmt;
use std::str::FromStr;

use super::bypass::BypassCache;
use super::challenge::{self, BypassSecret};
use crate::config::RuleConfig;

/// Information about a request to be authorized
#[derive(Debug, Clone, Default)]
pub struct RequestInfo<'a> {
    /// Client IP address, used as the bypass identity
    pub client_ip: Option<&'a str>,
    /// Host as sent by the client (may include a port)
    pub host: &'a str,
    /// URL path
    pub path: &'a str,
    /// Full request URL
    pub url: &'a str,
    /// Raw `Proxy-Authorization` header value
    pub proxy_authorization: Option<&'a str>,
}

impl<'a> RequestInfo<'a> {
    pub fn new(host: &'a str, path: &'a str, url: &'a str) -> Self {
        Self {
            client_ip: None,
            host,
            path,
            url,
            proxy_authorization: None,
        }
    }

    pub fn with_client_ip(mut self, ip: &'a str) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_proxy_authorization(mut self, value: Option<&'a str>) -> Self {
        self.proxy_authorization = value;
        self
    }

    fn field(&self, rule_type: RuleType) -> &'a str {
        match rule_type {
            RuleType::Host => self.host,
            RuleType::Path => self.path,
            RuleType::Url => self.url,
        }
    }
}

/// Whether a matching rule lets the request through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuleAccess {
    Allow,
    #[default]
    Block,
}

impl FromStr for RuleAccess {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "allow" => Ok(RuleAccess::Allow),
            "block" => Ok(RuleAccess::Block),
            _ => Err(()),
        }
    }
}

impl fmt::Display for RuleAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleAccess::Allow => "allow",
            RuleAccess::Block => "block",
        })
    }
}

/// Which part of the request a rule's pattern is matched against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuleType {
    #[default]
    Host,
    Path,
    Url,
}

impl FromStr for RuleType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "host" => Ok(RuleType::Host),
            "path" => Ok(RuleType::Path),
            "url" => Ok(RuleType::Url),
            _ => Err(()),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleType::Host => "host",
            RuleType::Path => "path",
            RuleType::Url => "url",
        })
    }
}

/// A validated access rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub access: RuleAccess,
    pub rule_type: RuleType,
    pub pattern: String,
    pub password_bypass: bool,
}

impl Rule {
    pub fn new(access: RuleAccess, rule_type: RuleType, pattern: impl Into<String>) -> Self {
        Self {
            access,
            rule_type,
            pattern: pattern.into(),
            password_bypass: false,
        }
    }

    pub fn with_password_bypass(mut self, bypass: bool) -> Self {
        self.password_bypass = bypass;
        self
    }

    /// Build a rule from its config form, repairing invalid fields.
    ///
    /// Unknown `access`/`type` values fall back to `block`/`host`, a missing
    /// `passwordBypass` means `true`. Returns `None` when the pattern is empty.
    pub fn from_config(index: usize, raw: &RuleConfig) -> Option<Self> {
        let access = match raw.access.as_deref() {
            None => RuleAccess::default(),
            Some(s) => s.parse().unwrap_or_else(|_| {
                tracing::warn!(rule = index + 1, access = %s, "Invalid rule access, using block");
                RuleAccess::default()
            }),
        };

        let rule_type = match raw.rule_type.as_deref() {
            None => RuleType::default(),
            Some(s) => s.parse().unwrap_or_else(|_| {
                tracing::warn!(rule = index + 1, rule_type = %s, "Invalid rule type, using host");
                RuleType::default()
            }),
        };

        let pattern = raw.pattern.clone().unwrap_or_default();
        if pattern.is_empty() {
            tracing::warn!(rule = index + 1, "Dropping rule with empty pattern");
            return None;
        }

        Some(Self {
            access,
            rule_type,
            pattern,
            password_bypass: raw.password_bypass.unwrap_or(true),
        })
    }
}

/// Outcome of authorizing one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No rule matched; requests are allowed by default
    NoMatch,
    Allowed,
    Blocked,
    /// Blocked pending the bypass password; answer with a 407 challenge
    Challenge,
}

impl Verdict {
    pub fn matched(&self) -> bool {
        !matches!(self, Verdict::NoMatch)
    }

    pub fn allowed(&self) -> bool {
        matches!(self, Verdict::NoMatch | Verdict::Allowed)
    }
}

/// A rule with its pattern compiled once at install time
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: Rule,
    regex: Regex,
}

impl CompiledRule {
    pub fn compile(rule: Rule) -> std::result::Result<Self, regex::Error> {
        let regex = Regex::new(&rule.pattern)?;
        Ok(Self { rule, regex })
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Check if this rule's pattern matches the selected request field
    pub fn matches(&self, request: &RequestInfo) -> bool {
        self.regex.is_match(request.field(self.rule.rule_type))
    }
}

/// Ordered rule set evaluated first-match-wins
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
}

impl RuleEngine {
    /// Compile the given rules. Rules whose pattern is not a valid regular
    /// expression are dropped with a warning; they could never match.
    pub fn new(rules: Vec<Rule>) -> Self {
        let compiled = rules
            .into_iter()
            .filter(|rule| !rule.pattern.is_empty())
            .filter_map(|rule| match CompiledRule::compile(rule) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping rule with invalid pattern");
                    None
                }
            })
            .collect();
        Self { rules: compiled }
    }

    /// Build the engine from config rules, repairing or dropping defective entries
    pub fn from_config(rules: &[RuleConfig]) -> Self {
        Self::new(
            rules
                .iter()
                .enumerate()
                .filter_map(|(i, raw)| Rule::from_config(i, raw))
                .collect(),
        )
    }

    /// An engine with no rules (allows everything)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Authorize a request against the rules in order.
    ///
    /// The first matching rule decides. Block rules with password bypass hand
    /// over to the challenge protocol, which may consult and update `cache`.
    pub fn authorize(
        &self,
        request: &RequestInfo,
        secret: &BypassSecret,
        cache: &BypassCache,
    ) -> Verdict {
        for compiled in &self.rules {
            if !compiled.matches(request) {
                continue;
            }

            let rule = compiled.rule();
            let verdict = match (rule.access, rule.password_bypass) {
                (RuleAccess::Allow, _) => Verdict::Allowed,
                (RuleAccess::Block, false) => Verdict::Blocked,
                (RuleAccess::Block, true) => challenge::verify(request, &rule.pattern, secret, cache),
            };

            tracing::debug!(
                url = %request.url,
                pattern = %rule.pattern,
                access = %rule.access,
                rule_type = %rule.rule_type,
                allowed = verdict.allowed(),
                "Rule matched"
            );
            return verdict;
        }

        tracing::debug!(url = %request.url, "No matching rules, allowing access");
        Verdict::NoMatch
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|c| c.rule())
    }

    /// Get the number of installed rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
