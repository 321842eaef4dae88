//! Match terms used by banned-term and vocabulary rules.
//!
//! A term is written either as a bare string (case-insensitive substring) or
//! as `{ "term": ..., "match": "substring" | "word" | "regex" }`. The pattern
//! is compiled when the term is deserialized, so a malformed regex surfaces
//! while the protocol is loading rather than during validation.

use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a term is matched against response text. Always case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Plain substring anywhere in the text.
    #[default]
    Substring,
    /// Substring bounded by word boundaries on both sides.
    Word,
    /// The term is a regular expression.
    Regex,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchMode::Substring => "substring",
            MatchMode::Word => "word",
            MatchMode::Regex => "regex",
        };
        f.write_str(name)
    }
}

/// Errors building a term.
#[derive(Error, Debug)]
pub enum TermError {
    #[error("term must not be empty")]
    Empty,

    #[error("invalid {mode} term {term:?}: {source}")]
    InvalidPattern {
        term: String,
        mode: MatchMode,
        #[source]
        source: regex::Error,
    },
}

/// A compiled, case-insensitive match term.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "TermSpec", into = "TermSpec")]
pub struct Term {
    text: String,
    mode: MatchMode,
    regex: Regex,
}

/// Serialized form of a [`Term`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TermSpec {
    Plain(String),
    Detailed {
        term: String,
        #[serde(default, rename = "match")]
        mode: MatchMode,
    },
}

impl Term {
    /// Compile a term with the given match mode.
    pub fn new(text: impl Into<String>, mode: MatchMode) -> Result<Self, TermError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(TermError::Empty);
        }

        let pattern = match mode {
            MatchMode::Substring => regex::escape(&text),
            MatchMode::Word => word_pattern(&text),
            MatchMode::Regex => text.clone(),
        };

        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| TermError::InvalidPattern {
                term: text.clone(),
                mode,
                source,
            })?;

        Ok(Self { text, mode, regex })
    }

    /// Shorthand for a substring term.
    pub fn substring(text: impl Into<String>) -> Result<Self, TermError> {
        Self::new(text, MatchMode::Substring)
    }

    /// The term as written in the protocol.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Every non-overlapping occurrence as `(byte offset, matched text)`.
    pub fn find_all<'t>(&self, text: &'t str) -> Vec<(usize, &'t str)> {
        self.regex
            .find_iter(text)
            .filter(|m| !m.as_str().is_empty())
            .map(|m| (m.start(), m.as_str()))
            .collect()
    }

    /// Whether the term occurs at least once.
    pub fn is_found(&self, text: &str) -> bool {
        self.regex.find_iter(text).any(|m| !m.as_str().is_empty())
    }
}

/// `\b` only binds between a word and a non-word character, so it is emitted
/// only on the sides where the term itself starts or ends with a word
/// character (`100%` is bounded on the left only).
fn word_pattern(text: &str) -> String {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let leading = text.chars().next().is_some_and(is_word);
    let trailing = text.chars().next_back().is_some_and(is_word);

    format!(
        "{}{}{}",
        if leading { r"\b" } else { "" },
        regex::escape(text),
        if trailing { r"\b" } else { "" }
    )
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text && self.mode == other.mode
    }
}

impl Eq for Term {}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            MatchMode::Substring => f.write_str(&self.text),
            mode => write!(f, "{} ({})", self.text, mode),
        }
    }
}

impl TryFrom<TermSpec> for Term {
    type Error = TermError;

    fn try_from(spec: TermSpec) -> Result<Self, Self::Error> {
        match spec {
            TermSpec::Plain(text) => Term::new(text, MatchMode::Substring),
            TermSpec::Detailed { term, mode } => Term::new(term, mode),
        }
    }
}

impl From<Term> for TermSpec {
    fn from(term: Term) -> Self {
        match term.mode {
            MatchMode::Substring => TermSpec::Plain(term.text),
            mode => TermSpec::Detailed {
                term: term.text,
                mode,
            },
        }
    }
}
