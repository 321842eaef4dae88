//! Rule kinds checked against candidate responses.
//!
//! Every kind implements [`RuleCheck`]. The validator only ever sees
//! `dyn RuleCheck`, so adding a kind means adding a variant to [`RuleKind`]
//! and a check type here; the validation loop stays as it is.

use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::protocol::Term;

lazy_static! {
    /// http(s) links as they appear in prose.
    static ref LINK_PATTERN: Regex = Regex::new(
        r#"(?i)\bhttps?://[^\s<>()\[\]{}"'`]+"#
    ).unwrap();

    /// Scheme prefix on a configured origin (`https://example.org`).
    static ref SCHEME_PREFIX: Regex = Regex::new(r"(?i)^[a-z][a-z0-9+.-]*://").unwrap();
}

/// Category of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    BannedTerm,
    Vocabulary,
}

/// One rule violation found in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,

    /// Rule id, when the protocol gave one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,

    /// Offending substring, or the unmet pattern for presence checks
    pub matched: String,

    /// Byte offset into the response for text matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,

    pub message: String,
}

/// A vocabulary rule as configured in `sourcing.vocabulary_rules`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(flatten)]
    pub rule: RuleKind,
}

/// The configured check of a vocabulary rule, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    /// The phrase must not appear.
    AvoidPhrase { phrase: Term },

    /// At least one marker must appear. With `when` triggers, only applies
    /// when one of the triggers appears.
    RequireMarker {
        markers: Vec<Term>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        when: Vec<Term>,
    },

    /// The response must link to at least one http(s) source.
    RequireCitation {
        #[serde(default)]
        allowed_origins_only: bool,
    },
}

impl RuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            RuleKind::AvoidPhrase { .. } => "avoid_phrase",
            RuleKind::RequireMarker { .. } => "require_marker",
            RuleKind::RequireCitation { .. } => "require_citation",
        }
    }
}

/// Read-only data a check may consult besides the response text.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub allowed_origins: &'a BTreeSet<String>,
}

/// A single check against response text.
pub trait RuleCheck {
    /// Which violation category this check reports.
    fn kind(&self) -> ViolationKind;

    /// Short label used in pass reports.
    fn label(&self) -> String;

    /// Run the check. Never fails; an empty vec means the rule is satisfied.
    fn check(&self, text: &str, ctx: &CheckContext<'_>) -> Vec<Violation>;
}

impl VocabularyRule {
    /// The check implementing this rule.
    pub fn as_check(&self) -> Box<dyn RuleCheck + '_> {
        let id = self.id.as_deref();
        match &self.rule {
            RuleKind::AvoidPhrase { phrase } => Box::new(PhraseCheck::avoided(id, phrase)),
            RuleKind::RequireMarker { markers, when } => Box::new(MarkerCheck {
                rule_id: id,
                markers,
                when,
            }),
            RuleKind::RequireCitation {
                allowed_origins_only,
            } => Box::new(CitationCheck {
                rule_id: id,
                allowed_origins_only: *allowed_origins_only,
            }),
        }
    }
}

/// Every occurrence of a term is a violation.
pub struct PhraseCheck<'a> {
    pub kind: ViolationKind,
    pub rule_id: Option<&'a str>,
    pub term: &'a Term,
}

impl<'a> PhraseCheck<'a> {
    pub fn banned(term: &'a Term) -> Self {
        Self {
            kind: ViolationKind::BannedTerm,
            rule_id: None,
            term,
        }
    }

    pub fn avoided(rule_id: Option<&'a str>, term: &'a Term) -> Self {
        Self {
            kind: ViolationKind::Vocabulary,
            rule_id,
            term,
        }
    }
}

impl RuleCheck for PhraseCheck<'_> {
    fn kind(&self) -> ViolationKind {
        self.kind
    }

    fn label(&self) -> String {
        match self.kind {
            ViolationKind::BannedTerm => format!("banned term absent: {}", self.term),
            ViolationKind::Vocabulary => format!("avoided phrase absent: {}", self.term),
        }
    }

    fn check(&self, text: &str, _ctx: &CheckContext<'_>) -> Vec<Violation> {
        self.term
            .find_all(text)
            .into_iter()
            .map(|(offset, matched)| Violation {
                kind: self.kind,
                rule_id: self.rule_id.map(str::to_string),
                matched: matched.to_string(),
                offset: Some(offset),
                message: match self.kind {
                    ViolationKind::BannedTerm => {
                        format!("banned term '{}' at byte {}", self.term, offset)
                    }
                    ViolationKind::Vocabulary => {
                        format!("avoided phrase '{}' at byte {}", self.term, offset)
                    }
                },
            })
            .collect()
    }
}

/// Presence of at least one marker phrase.
struct MarkerCheck<'a> {
    rule_id: Option<&'a str>,
    markers: &'a [Term],
    when: &'a [Term],
}

impl RuleCheck for MarkerCheck<'_> {
    fn kind(&self) -> ViolationKind {
        ViolationKind::Vocabulary
    }

    fn label(&self) -> String {
        format!("marker present: {}", join_terms(self.markers))
    }

    fn check(&self, text: &str, _ctx: &CheckContext<'_>) -> Vec<Violation> {
        let trigger = if self.when.is_empty() {
            None
        } else {
            match self.when.iter().find_map(|t| t.find_all(text).into_iter().next()) {
                Some(hit) => Some(hit),
                // Not triggered, nothing to require.
                None => return vec![],
            }
        };

        if self.markers.iter().any(|m| m.is_found(text)) {
            return vec![];
        }

        let expected = join_terms(self.markers);
        let message = match trigger {
            Some((offset, phrase)) => format!(
                "'{}' at byte {} requires one of: {}",
                phrase, offset, expected
            ),
            None => format!("response must contain one of: {}", expected),
        };

        vec![Violation {
            kind: ViolationKind::Vocabulary,
            rule_id: self.rule_id.map(str::to_string),
            matched: expected,
            offset: trigger.map(|(offset, _)| offset),
            message,
        }]
    }
}

/// At least one http(s) link, optionally restricted to allowed origins.
struct CitationCheck<'a> {
    rule_id: Option<&'a str>,
    allowed_origins_only: bool,
}

impl RuleCheck for CitationCheck<'_> {
    fn kind(&self) -> ViolationKind {
        ViolationKind::Vocabulary
    }

    fn label(&self) -> String {
        if self.allowed_origins_only {
            "citation from allowed origin present".to_string()
        } else {
            "citation present".to_string()
        }
    }

    fn check(&self, text: &str, ctx: &CheckContext<'_>) -> Vec<Violation> {
        let links = find_links(text);
        let rule_id = self.rule_id.map(str::to_string);

        if links.is_empty() {
            return vec![Violation {
                kind: ViolationKind::Vocabulary,
                rule_id,
                matched: "http(s) link".to_string(),
                offset: None,
                message: "response contains no source link".to_string(),
            }];
        }

        if !self.allowed_origins_only {
            return vec![];
        }

        links
            .into_iter()
            .filter(|(_, link)| !origin_allowed(&link_host(link), ctx.allowed_origins))
            .map(|(offset, link)| Violation {
                kind: ViolationKind::Vocabulary,
                rule_id: rule_id.clone(),
                matched: link.to_string(),
                offset: Some(offset),
                message: format!("link to '{}' is outside the allowed origins", link_host(link)),
            })
            .collect()
    }
}

fn join_terms(terms: &[Term]) -> String {
    terms
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Links with trailing sentence punctuation removed.
fn find_links(text: &str) -> Vec<(usize, &str)> {
    LINK_PATTERN
        .find_iter(text)
        .map(|m| {
            let link = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
            (m.start(), link)
        })
        .collect()
}

/// Lower-cased host of an http(s) link.
fn link_host(link: &str) -> String {
    let rest = SCHEME_PREFIX.replace(link, "");
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    host.split(':').next().unwrap_or_default().to_lowercase()
}

/// Whether `host` is one of the origins or a subdomain of one.
pub fn origin_allowed(host: &str, origins: &BTreeSet<String>) -> bool {
    origins.iter().any(|origin| {
        let origin = link_host(origin);
        !origin.is_empty() && (host == origin || host.ends_with(&format!(".{}", origin)))
    })
}
