//! Deterministic rule pass
//!
//! Rules run in ascending `priority_order`. Every matching rule may
//! contribute fields, but a field keeps the first value it received, so
//! earlier rules win on conflicts.

use regex::{Captures, Regex, RegexBuilder};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::{FieldValue, ParsedFields, ParsingRule};

/// Compiled patterns above this size are rejected like invalid ones.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

pub struct ParsingEngine {
    rules: Vec<ParsingRule>,
    /// Compiled patterns by rule id; rules missing here never match
    compiled: HashMap<Uuid, Regex>,
    invalid: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    pub fields: ParsedFields,
    pub matched_rule_ids: Vec<Uuid>,
    /// Lowercased text of each rule match, deduplicated
    pub keywords: Vec<String>,
}

/// Compiles a rule pattern the way the engine evaluates it.
pub fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
}

impl ParsingEngine {
    pub fn new(mut rules: Vec<ParsingRule>) -> Self {
        rules.retain(|r| r.is_active);
        rules.sort_by_key(|r| (r.priority_order, r.created_at));

        let mut compiled = HashMap::new();
        let mut invalid = Vec::new();
        for rule in &rules {
            match compile(&rule.pattern) {
                Ok(regex) => {
                    compiled.insert(rule.id, regex);
                }
                Err(e) => {
                    tracing::warn!(
                        rule_id = %rule.id,
                        rule_name = %rule.name,
                        error = %e,
                        "Parsing rule has an invalid pattern and will never match"
                    );
                    invalid.push(rule.id);
                }
            }
        }

        Self {
            rules,
            compiled,
            invalid,
        }
    }

    /// Rules whose pattern failed to compile.
    pub fn invalid_rules(&self) -> &[Uuid] {
        &self.invalid
    }

    pub fn apply(&self, text: &str) -> ParseOutcome {
        let mut outcome = ParseOutcome::default();

        for rule in &self.rules {
            let Some(regex) = self.compiled.get(&rule.id) else {
                continue;
            };
            let Some(caps) = regex.captures(text) else {
                continue;
            };
            if !rule.conditions.iter().all(|c| c.holds(text)) {
                continue;
            }

            for (key, value) in &rule.action.assign {
                if let Some(raw) = resolve(value, &caps) {
                    outcome.fields.set_if_absent(*key, &raw);
                }
            }

            outcome.matched_rule_ids.push(rule.id);
            if let Some(m) = caps.get(0) {
                let keyword = m.as_str().trim().to_lowercase();
                if !keyword.is_empty() && !outcome.keywords.contains(&keyword) {
                    outcome.keywords.push(keyword);
                }
            }
        }

        outcome
    }
}

fn resolve(value: &FieldValue, caps: &Captures<'_>) -> Option<String> {
    match value {
        FieldValue::Literal(literal) => Some(literal.clone()),
        FieldValue::Capture(group) => {
            let m = match group.parse::<usize>() {
                Ok(index) => caps.get(index),
                Err(_) => caps.name(group),
            };
            m.map(|m| m.as_str().to_string())
        }
    }
}
