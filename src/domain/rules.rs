//! Parsing rule domain types
//!
//! Deterministic keyword/pattern rules evaluated before the AI pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Field a rule can assign
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    Title,
    Description,
    StartAt,
    EndAt,
    Location,
    Priority,
    Category,
}

/// Where an assigned value comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "from", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Literal(String),
    /// Capture group, by name or by index ("1", "2", ...)
    Capture(String),
}

/// Field assignments performed when a rule matches
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleAction {
    pub assign: BTreeMap<FieldKey, FieldValue>,
}

/// Extra predicate that must hold besides the pattern match.
/// Text comparisons are case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RuleCondition {
    Contains(String),
    NotContains(String),
    MinLength(usize),
    MaxLength(usize),
}

impl RuleCondition {
    pub fn holds(&self, text: &str) -> bool {
        match self {
            RuleCondition::Contains(needle) => {
                text.to_lowercase().contains(&needle.to_lowercase())
            }
            RuleCondition::NotContains(needle) => {
                !text.to_lowercase().contains(&needle.to_lowercase())
            }
            RuleCondition::MinLength(min) => text.chars().count() >= *min,
            RuleCondition::MaxLength(max) => text.chars().count() <= *max,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsingRule {
    pub id: Uuid,
    pub name: String,
    pub pattern: String,
    pub action: RuleAction,
    pub conditions: Vec<RuleCondition>,
    /// None for global rules
    pub profession: Option<String>,
    /// Lower is evaluated first
    pub priority_order: i32,
    pub is_active: bool,
    pub usage_count: i64,
    pub success_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParsingRule {
    pub fn accuracy_rate(&self) -> Option<f64> {
        if self.usage_count == 0 {
            None
        } else {
            Some(self.success_count as f64 / self.usage_count as f64)
        }
    }

    /// Global rules apply to everyone; scoped rules only to their profession.
    pub fn applies_to(&self, profession: Option<&str>) -> bool {
        match (&self.profession, profession) {
            (None, _) => true,
            (Some(scope), Some(p)) => scope.eq_ignore_ascii_case(p),
            (Some(_), None) => false,
        }
    }
}

/// Create rule request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsingRuleInput {
    pub name: String,
    pub pattern: String,
    pub action: RuleAction,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub profession: Option<String>,
    pub priority_order: Option<i32>,
}

impl ParsingRuleInput {
    pub fn into_rule(self, now: DateTime<Utc>) -> ParsingRule {
        ParsingRule {
            id: Uuid::new_v4(),
            name: self.name,
            pattern: self.pattern,
            action: self.action,
            conditions: self.conditions,
            profession: self.profession.map(|p| p.trim().to_lowercase()),
            priority_order: self.priority_order.unwrap_or(100),
            is_active: true,
            usage_count: 0,
            success_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Rule response with derived accuracy
#[derive(Debug, Clone, Serialize)]
pub struct ParsingRuleResponse {
    #[serde(flatten)]
    pub rule: ParsingRule,
    pub accuracy_rate: Option<f64>,
}

impl From<ParsingRule> for ParsingRuleResponse {
    fn from(rule: ParsingRule) -> Self {
        let accuracy_rate = rule.accuracy_rate();
        Self {
            rule,
            accuracy_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_round_trips_through_json_column_shape() {
        let raw = json!({
            "assign": {
                "category": { "from": "literal", "value": "meeting" },
                "title": { "from": "capture", "value": "what" }
            }
        });
        let action: RuleAction = serde_json::from_value(raw).unwrap();
        assert_eq!(
            action.assign.get(&FieldKey::Category),
            Some(&FieldValue::Literal("meeting".into()))
        );
        assert_eq!(
            action.assign.get(&FieldKey::Title),
            Some(&FieldValue::Capture("what".into()))
        );
    }

    #[test]
    fn scoped_rules_only_apply_to_their_profession() {
        let rule = ParsingRuleInput {
            name: "standup".into(),
            pattern: "standup".into(),
            action: RuleAction::default(),
            conditions: vec![],
            profession: Some("Engineering".into()),
            priority_order: None,
        }
        .into_rule(Utc::now());

        assert!(rule.applies_to(Some("engineering")));
        assert!(!rule.applies_to(Some("business")));
        assert!(!rule.applies_to(None));
        assert_eq!(rule.accuracy_rate(), None);
    }

    #[test]
    fn conditions_are_case_insensitive() {
        assert!(RuleCondition::Contains("FRIDAY".into()).holds("meeting friday"));
        assert!(RuleCondition::NotContains("cancelled".into()).holds("meeting friday"));
        assert!(!RuleCondition::MinLength(50).holds("short"));
    }
}
