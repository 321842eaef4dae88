//! Response validation against a derived constraint set.
//!
//! Validation never fails on its input: any string, including the empty one,
//! produces a [`ValidationResult`]. Rule configuration problems are caught
//! when the protocol is loaded, so there is nothing left to go wrong here.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::derive::GroundingConstraintSet;
use crate::rules::{CheckContext, PhraseCheck, RuleCheck, Violation, ViolationKind};

const RECOMMEND_FIX: &str =
    "Ensure factual claims are cited; stay within boundaries and vocabulary.";
const RECOMMEND_CONTINUE: &str =
    "Response passes basic protocol checks; continue to verify sourcing and boundaries.";

/// A check that found nothing to report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassedCheck {
    pub kind: ViolationKind,
    pub check: String,
}

/// Outcome of validating one response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// True iff `violations` is empty
    pub passed: bool,

    /// Banned-term hits in order of appearance, then vocabulary rule
    /// violations in rule order
    pub violations: Vec<Violation>,

    pub passed_checks: Vec<PassedCheck>,

    pub recommendation: String,
}

impl ValidationResult {
    pub fn violations_of(&self, kind: ViolationKind) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(move |v| v.kind == kind)
    }
}

/// The checks a constraint set implies, banned terms first.
pub fn checks(constraints: &GroundingConstraintSet) -> Vec<Box<dyn RuleCheck + '_>> {
    let vocabulary = &constraints.vocabulary;
    let mut checks: Vec<Box<dyn RuleCheck + '_>> = Vec::with_capacity(constraints.rule_count());

    for term in &vocabulary.banned_terms {
        checks.push(Box::new(PhraseCheck::banned(term)));
    }
    for rule in &vocabulary.rules {
        checks.push(rule.as_check());
    }
    for phrase in &vocabulary.language_avoid {
        checks.push(Box::new(PhraseCheck::avoided(None, phrase)));
    }

    checks
}

/// Check `text` against every rule in `constraints`.
pub fn validate(text: &str, constraints: &GroundingConstraintSet) -> ValidationResult {
    let ctx = CheckContext {
        allowed_origins: &constraints.data_sources.allowed_origins,
    };

    let mut banned = Vec::new();
    let mut vocabulary = Vec::new();
    let mut passed_checks = Vec::new();

    for check in checks(constraints) {
        let found = check.check(text, &ctx);
        if found.is_empty() {
            passed_checks.push(PassedCheck {
                kind: check.kind(),
                check: check.label(),
            });
            continue;
        }
        match check.kind() {
            ViolationKind::BannedTerm => banned.extend(found),
            ViolationKind::Vocabulary => vocabulary.extend(found),
        }
    }

    // Stable: equal offsets keep rule order.
    banned.sort_by_key(|v| v.offset);

    let mut violations = banned;
    violations.append(&mut vocabulary);
    let passed = violations.is_empty();

    debug!(
        passed,
        violations = violations.len(),
        text_len = text.len(),
        "response validated"
    );

    ValidationResult {
        passed,
        violations,
        passed_checks,
        recommendation: if passed {
            RECOMMEND_CONTINUE
        } else {
            RECOMMEND_FIX
        }
        .to_string(),
    }
}
