use serde::{Deserialize, Serialize};

/// How a rule's pattern is applied to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Contains,
    Word,
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Contains => "contains",
            MatchType::Word => "word",
            MatchType::Regex => "regex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(MatchType::Exact),
            "contains" => Some(MatchType::Contains),
            "word" => Some(MatchType::Word),
            "regex" => Some(MatchType::Regex),
            _ => None,
        }
    }
}

/// What happens when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Warn,
    Block,
    Command,
    Webhook,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Warn => "warn",
            RuleAction::Block => "block",
            RuleAction::Command => "command",
            RuleAction::Webhook => "webhook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warn" => Some(RuleAction::Warn),
            "block" => Some(RuleAction::Block),
            "command" => Some(RuleAction::Command),
            "webhook" => Some(RuleAction::Webhook),
            _ => None,
        }
    }
}

/// A stored moderation / auto-response rule.
///
/// An empty `enabled_entity_ids` list means the rule is global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringRule {
    pub id: i64,
    pub pattern: String,
    pub match_type: MatchType,
    pub case_sensitive: bool,
    pub enabled_entity_ids: Vec<String>,
    pub action: RuleAction,
    pub command_to_execute: Option<String>,
    pub command_parameters: Vec<String>,
    pub webhook_url: Option<String>,
    pub warning_message: Option<String>,
    pub block_message: Option<String>,
    pub priority: i64,
    pub is_active: bool,
    pub match_count: i64,
    pub last_matched: Option<String>,
    pub created_by: String,
    pub created_at: String,
}

/// Fields supplied when creating a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraft {
    pub pattern: String,
    #[serde(default = "default_match_type")]
    pub match_type: MatchType,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub enabled_entity_ids: Vec<String>,
    pub action: RuleAction,
    #[serde(default)]
    pub command_to_execute: Option<String>,
    #[serde(default)]
    pub command_parameters: Vec<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub warning_message: Option<String>,
    #[serde(default)]
    pub block_message: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_match_type() -> MatchType {
    MatchType::Exact
}
fn default_priority() -> i64 {
    100
}
fn default_created_by() -> String {
    "system".to_string()
}

/// Partial update for `PUT /router/string-rules/{id}` — absent fields keep
/// their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub pattern: Option<String>,
    pub match_type: Option<MatchType>,
    pub case_sensitive: Option<bool>,
    pub enabled_entity_ids: Option<Vec<String>>,
    pub action: Option<RuleAction>,
    pub command_to_execute: Option<String>,
    pub command_parameters: Option<Vec<String>>,
    pub webhook_url: Option<String>,
    pub warning_message: Option<String>,
    pub block_message: Option<String>,
    pub priority: Option<i64>,
    pub is_active: Option<bool>,
}

/// First matching rule for a message, shaped for dispatch.
#[derive(Debug, Clone)]
pub struct StringMatch {
    pub rule_id: i64,
    pub action: RuleAction,
    pub message: String,
    pub pattern: String,
    pub match_type: MatchType,
    pub command_to_execute: Option<String>,
    pub command_parameters: Vec<String>,
    pub webhook_url: Option<String>,
    pub priority: i64,
}
