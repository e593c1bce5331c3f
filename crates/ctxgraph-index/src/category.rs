//! Keyword-based category tagging for chunks.

use serde::{Deserialize, Serialize};

use crate::search::tokenize;

/// Category assigned when no rule matches.
pub const FALLBACK_CATEGORY: &str = "general";

/// A named category and the keywords that select it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub name: String,
    pub keywords: Vec<String>,
}

impl CategoryRule {
    pub fn new(name: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    /// A term matches when it starts with one of the keywords.
    fn matches(&self, terms: &[String]) -> bool {
        terms
            .iter()
            .any(|term| self.keywords.iter().any(|k| term.starts_with(k.as_str())))
    }
}

/// Ordered category rules. The first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRules {
    rules: Vec<CategoryRule>,
}

impl Default for CategoryRules {
    fn default() -> Self {
        Self {
            rules: vec![
                CategoryRule::new(
                    "auth",
                    &[
                        "auth", "login", "logout", "session", "token", "password", "oauth",
                        "jwt", "credential", "permission",
                    ],
                ),
                CategoryRule::new(
                    "api",
                    &[
                        "api", "endpoint", "route", "handler", "controller", "request",
                        "response", "graphql",
                    ],
                ),
                CategoryRule::new(
                    "database",
                    &["db", "database", "sql", "query", "migration", "schema", "repository"],
                ),
                CategoryRule::new(
                    "ui",
                    &["ui", "component", "view", "page", "style", "css", "render", "widget"],
                ),
                CategoryRule::new("test", &["test", "spec", "mock", "fixture"]),
                CategoryRule::new("config", &["config", "settings", "env", "setup"]),
            ],
        }
    }
}

impl CategoryRules {
    pub fn new(rules: Vec<CategoryRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|r| CategoryRule {
                keywords: r.keywords.iter().map(|k| k.to_lowercase()).collect(),
                name: r.name,
            })
            .collect();
        Self { rules }
    }

    pub fn rules(&self) -> &[CategoryRule] {
        &self.rules
    }

    /// Category for a chunk, from its source path and title.
    ///
    /// Path segments are checked before the title, so `src/auth/util.rs`
    /// tags every chunk in it as `auth`.
    pub fn categorize(&self, path: Option<&str>, title: &str) -> String {
        let path_terms = path.map(terms).unwrap_or_default();
        let title_terms = terms(title);

        for candidates in [&path_terms, &title_terms] {
            if let Some(rule) = self.rules.iter().find(|r| r.matches(candidates)) {
                return rule.name.clone();
            }
        }
        FALLBACK_CATEGORY.to_string()
    }
}

/// Lowercased terms, with snake_case and camelCase split into parts.
fn terms(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
        for part in word.split('_') {
            out.extend(split_camel(part));
        }
    }
    out.extend(tokenize(text));
    out.retain(|t| !t.is_empty());
    out
}

fn split_camel(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in word.chars() {
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
