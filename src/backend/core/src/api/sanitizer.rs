//! Injection screening for author-provided rule text.
//!
//! Rule names and expressions arrive from the authoring UI as free text and
//! are rejected before they touch the registry when they carry XSS, SQL,
//! LDAP, shell-metacharacter, or path-traversal patterns. Screening is
//! scoped to author input; span data is never screened here.

use metrics::counter;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InjectionType {
    SqlInjection,
    Xss,
    LdapInjection,
    ShellMetacharacter,
    PathTraversal,
}

impl fmt::Display for InjectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SqlInjection => write!(f, "SQL Injection"),
            Self::Xss => write!(f, "XSS"),
            Self::LdapInjection => write!(f, "LDAP Injection"),
            Self::ShellMetacharacter => write!(f, "Shell Metacharacter"),
            Self::PathTraversal => write!(f, "Path Traversal"),
        }
    }
}

pub struct InputScreen {
    sql: Vec<Regex>,
    xss: Vec<Regex>,
    ldap: Vec<Regex>,
    shell: Vec<Regex>,
    path: Vec<Regex>,
}

impl Default for InputScreen {
    fn default() -> Self {
        Self {
            sql: vec![
                Regex::new(r"(?i)\bunion\b\s+\bselect\b").unwrap(),
                Regex::new(r"(?i)\bselect\b.+\bfrom\b").unwrap(),
                Regex::new(r"(?i)\bdrop\b\s+\btable\b").unwrap(),
                Regex::new(r"(?i)'\s*(or|and)\s+\d+\s*=\s*\d+").unwrap(),
                Regex::new(r"/\*|\*/|--").unwrap(),
                Regex::new(r"(?i)\bsleep\b\s*\(").unwrap(),
            ],
            xss: vec![
                Regex::new(r"(?i)<\s*script").unwrap(),
                Regex::new(r"(?i)javascript\s*:").unwrap(),
                Regex::new(r"(?i)\bon(error|load|click|mouseover)\s*=").unwrap(),
                Regex::new(r"(?i)<\s*(iframe|object|embed|svg)\b").unwrap(),
            ],
            ldap: vec![
                Regex::new(r"\)\(").unwrap(),
                Regex::new(r"\(\|").unwrap(),
                Regex::new(r"\(&").unwrap(),
                Regex::new(r"\*\)").unwrap(),
            ],
            shell: vec![
                Regex::new(r"[;`]").unwrap(),
                Regex::new(r"\$\(").unwrap(),
                Regex::new(r"&&|\|\|").unwrap(),
                Regex::new(r">\s*/").unwrap(),
            ],
            path: vec![
                Regex::new(r"\.\./|\.\.\\").unwrap(),
                Regex::new(r"%2e%2e%2f|%2e%2e/").unwrap(),
                Regex::new(r"%00|%0d%0a").unwrap(),
            ],
        }
    }
}

impl InputScreen {
    /// First injection pattern matched, if any.
    pub fn detect(&self, text: &str) -> Option<InjectionType> {
        let groups: [(&[Regex], InjectionType); 5] = [
            (&self.path, InjectionType::PathTraversal),
            (&self.sql, InjectionType::SqlInjection),
            (&self.xss, InjectionType::Xss),
            (&self.ldap, InjectionType::LdapInjection),
            (&self.shell, InjectionType::ShellMetacharacter),
        ];
        for (patterns, kind) in groups {
            if patterns.iter().any(|p| p.is_match(text)) {
                return Some(kind);
            }
        }
        None
    }

    /// Screen one author-provided field; increments the blocked counter on
    /// detection.
    pub fn screen(&self, field: &str, text: &str) -> Result<(), InjectionType> {
        if let Some(kind) = self.detect(text) {
            counter!("betrace_sanitizer_blocked").increment(1);
            warn!(field, injection = %kind, "rejecting author input");
            return Err(kind);
        }
        Ok(())
    }
}
