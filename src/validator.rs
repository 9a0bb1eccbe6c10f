use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    // Wording kept as players know it; only SELECT/WITH pass the prefix check.
    #[error("Query contains forbidden operations. Only SELECT, INSERT, and UPDATE are allowed.")]
    ForbiddenOperation,

    #[error("Query must start with SELECT or WITH statement.")]
    UnsupportedStatement,
}

/// Operations that are refused wherever they appear in the query text.
const FORBIDDEN_PATTERNS: &[(&str, &str)] = &[
    ("drop database", r"drop\s+database"),
    ("drop table", r"drop\s+table"),
    ("alter table", r"alter\s+table"),
    ("create table", r"create\s+table"),
    ("delete from", r"delete\s+from"),
    ("truncate", r"truncate"),
    ("pragma", r"pragma"),
    ("attach", r"attach"),
    ("detach", r"detach"),
];

const ALLOWED_PREFIXES: &[&str] = &["select", "with"];

fn forbidden_matchers() -> &'static [(&'static str, Regex)] {
    static MATCHERS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        FORBIDDEN_PATTERNS
            .iter()
            .map(|(name, pattern)| {
                let re = Regex::new(&format!("(?i){pattern}")).expect("valid forbidden pattern");
                (*name, re)
            })
            .collect()
    })
}

/// Textual gate in front of the sandbox. No SQL parsing happens here.
pub fn validate(query: &str) -> Result<(), Rejection> {
    let trimmed = query.trim();

    if let Some((name, _)) = forbidden_matchers()
        .iter()
        .find(|(_, re)| re.is_match(trimmed))
    {
        debug!(pattern = name, "query rejected by denylist");
        return Err(Rejection::ForbiddenOperation);
    }

    let lower = trimmed.to_ascii_lowercase();
    if !ALLOWED_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return Err(Rejection::UnsupportedStatement);
    }

    Ok(())
}
