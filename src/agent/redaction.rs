use regex::{Regex, RegexBuilder};
use tracing::warn;

pub const REDACTED: &str = "[REDACTED]";

/// Scrubs secrets from text before it reaches the model, the user or
/// the logs.
///
/// Two kinds of rules: literal values (API keys, skill secrets) and
/// case-insensitive regex patterns from `[redaction] patterns`.
#[derive(Debug, Default)]
pub struct Redactor {
    literals: Vec<String>,
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Invalid patterns are logged and skipped.
    pub fn new<I, S>(literals: I, patterns: &[String]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut literals: Vec<String> = literals
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        // Longest first, so a secret containing another is replaced whole.
        literals.sort_by_key(|s| std::cmp::Reverse(s.len()));

        let patterns = patterns
            .iter()
            .filter_map(|p| match RegexBuilder::new(p).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Skipping invalid redaction pattern {p:?}: {e}");
                    None
                }
            })
            .collect();

        Self { literals, patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty() && self.patterns.is_empty()
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for literal in &self.literals {
            if out.contains(literal.as_str()) {
                out = out.replace(literal.as_str(), REDACTED);
            }
        }
        for re in &self.patterns {
            out = re.replace_all(&out, REDACTED).into_owned();
        }
        out
    }
}
