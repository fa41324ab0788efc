use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info};
use waddle_cache::TtlCache;

use crate::db::init_db;
use crate::error::{Result, StringMatchError};
use crate::types::{MatchType, RuleAction, RuleDraft, RuleUpdate, StringMatch, StringRule};

/// How long a per-entity rule set stays cached.
const RULES_CACHE_TTL: Duration = Duration::from_secs(300);

/// Content-pattern engine, consulted when a chat message is not a command.
///
/// Rules are loaded per entity and cached for five minutes; compiled
/// regexes are cached for the process lifetime, keyed by
/// (pattern, case_sensitive). An invalid regex is remembered as a
/// permanent non-match so it is compiled (and logged) only once.
pub struct StringMatcher {
    db: Mutex<Connection>,
    cache: Arc<TtlCache>,
    regex_cache: Mutex<HashMap<(String, bool), Option<Regex>>>,
}

impl StringMatcher {
    pub fn new(conn: Connection, cache: Arc<TtlCache>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            cache,
            regex_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Test a message against every rule applicable to the entity, in
    /// ascending priority order. The first match wins; its hit counter is
    /// bumped before returning.
    pub fn check(&self, message_content: &str, entity_id: &str) -> Result<Option<StringMatch>> {
        let rules = self.rules_for_entity(entity_id)?;
        for rule in &rules {
            if self.rule_matches(message_content, rule) {
                self.record_match(rule.id);
                debug!(rule_id = rule.id, entity_id, "string rule matched");
                return Ok(Some(StringMatch {
                    rule_id: rule.id,
                    action: rule.action,
                    message: action_message(rule),
                    pattern: rule.pattern.clone(),
                    match_type: rule.match_type,
                    command_to_execute: rule.command_to_execute.clone(),
                    command_parameters: rule.command_parameters.clone(),
                    webhook_url: rule.webhook_url.clone(),
                    priority: rule.priority,
                }));
            }
        }
        Ok(None)
    }

    fn rule_matches(&self, message: &str, rule: &StringRule) -> bool {
        // "*" is the catch-all: any non-empty message, any match type.
        if rule.pattern == "*" {
            return !message.is_empty();
        }

        match rule.match_type {
            MatchType::Exact => {
                if rule.case_sensitive {
                    message == rule.pattern
                } else {
                    message.to_lowercase() == rule.pattern.to_lowercase()
                }
            }
            MatchType::Contains => {
                if rule.case_sensitive {
                    message.contains(&rule.pattern)
                } else {
                    message.to_lowercase().contains(&rule.pattern.to_lowercase())
                }
            }
            MatchType::Word => {
                let pattern = format!(r"\b{}\b", regex::escape(&rule.pattern));
                self.regex_is_match(&pattern, rule.case_sensitive, message)
            }
            MatchType::Regex => self.regex_is_match(&rule.pattern, rule.case_sensitive, message),
        }
    }

    fn regex_is_match(&self, pattern: &str, case_sensitive: bool, text: &str) -> bool {
        let key = (pattern.to_string(), case_sensitive);
        let mut cache = self.regex_cache.lock().unwrap();
        let compiled = cache.entry(key).or_insert_with(|| {
            let source = if case_sensitive {
                pattern.to_string()
            } else {
                format!("(?i){}", pattern)
            };
            match Regex::new(&source) {
                Ok(re) => Some(re),
                Err(e) => {
                    error!(pattern, error = %e, "invalid string-rule regex; treating as non-matching");
                    None
                }
            }
        });
        compiled.as_ref().is_some_and(|re| re.is_match(text))
    }

    /// Active rules applicable to an entity (global rules plus rules that
    /// list it), ascending priority, served from cache when fresh.
    pub fn rules_for_entity(&self, entity_id: &str) -> Result<Vec<StringRule>> {
        let cache_key = format!("stringrules:{}", entity_id);
        if let Some(cached) = self.cache.get(&cache_key) {
            if let Ok(rules) = serde_json::from_value::<Vec<StringRule>>(cached) {
                return Ok(rules);
            }
        }

        let rules: Vec<StringRule> = self
            .all_active_rules()?
            .into_iter()
            .filter(|r| {
                r.enabled_entity_ids.is_empty()
                    || r.enabled_entity_ids.iter().any(|e| e == entity_id)
            })
            .collect();

        self.cache.set_with_ttl(
            &cache_key,
            serde_json::to_value(&rules)?,
            RULES_CACHE_TTL,
        );
        Ok(rules)
    }

    fn all_active_rules(&self) -> Result<Vec<StringRule>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{} WHERE is_active = 1 ORDER BY priority, id",
            RULE_SELECT
        ))?;
        let rows = stmt.query_map([], row_to_rule)?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    fn record_match(&self, rule_id: i64) {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        if let Err(e) = db.execute(
            "UPDATE stringmatch
             SET match_count = match_count + 1, last_matched = ?2
             WHERE id = ?1",
            params![rule_id, now],
        ) {
            error!(rule_id, error = %e, "failed to record string match");
        }
    }

    // ── rule management ───────────────────────────────────────────────────────

    pub fn get_rule(&self, id: i64) -> Result<Option<StringRule>> {
        let db = self.db.lock().unwrap();
        let found = db
            .query_row(
                &format!("{} WHERE id = ?1", RULE_SELECT),
                params![id],
                row_to_rule,
            )
            .optional()?;
        Ok(found)
    }

    /// Active rules, optionally narrowed to those applying to one entity.
    pub fn list_rules(&self, entity_id: Option<&str>) -> Result<Vec<StringRule>> {
        let rules = self.all_active_rules()?;
        Ok(match entity_id {
            Some(entity) => rules
                .into_iter()
                .filter(|r| {
                    r.enabled_entity_ids.is_empty()
                        || r.enabled_entity_ids.iter().any(|e| e == entity)
                })
                .collect(),
            None => rules,
        })
    }

    pub fn create_rule(&self, draft: &RuleDraft) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let id = {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO stringmatch
                 (pattern, match_type, case_sensitive, enabled_entity_ids, action,
                  command_to_execute, command_parameters, webhook_url, warning_message,
                  block_message, priority, is_active, match_count, created_by,
                  created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,1,0,?12,?13,?13)",
                params![
                    draft.pattern,
                    draft.match_type.as_str(),
                    draft.case_sensitive,
                    serde_json::to_string(&draft.enabled_entity_ids)?,
                    draft.action.as_str(),
                    draft.command_to_execute,
                    serde_json::to_string(&draft.command_parameters)?,
                    draft.webhook_url,
                    draft.warning_message,
                    draft.block_message,
                    draft.priority,
                    draft.created_by,
                    now,
                ],
            )?;
            db.last_insert_rowid()
        };

        self.invalidate_entities(&draft.enabled_entity_ids);
        info!(rule_id = id, pattern = %draft.pattern, "string rule created");
        Ok(id)
    }

    pub fn update_rule(&self, id: i64, update: &RuleUpdate) -> Result<()> {
        let existing = self
            .get_rule(id)?
            .ok_or(StringMatchError::RuleNotFound(id))?;

        let pattern = update.pattern.clone().unwrap_or(existing.pattern);
        let match_type = update.match_type.unwrap_or(existing.match_type);
        let case_sensitive = update.case_sensitive.unwrap_or(existing.case_sensitive);
        let entity_ids = update
            .enabled_entity_ids
            .clone()
            .unwrap_or_else(|| existing.enabled_entity_ids.clone());
        let action = update.action.unwrap_or(existing.action);
        let command_to_execute = update
            .command_to_execute
            .clone()
            .or(existing.command_to_execute);
        let command_parameters = update
            .command_parameters
            .clone()
            .unwrap_or(existing.command_parameters);
        let webhook_url = update.webhook_url.clone().or(existing.webhook_url);
        let warning_message = update.warning_message.clone().or(existing.warning_message);
        let block_message = update.block_message.clone().or(existing.block_message);
        let priority = update.priority.unwrap_or(existing.priority);
        let is_active = update.is_active.unwrap_or(existing.is_active);
        let now = Utc::now().to_rfc3339();

        {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE stringmatch SET
                    pattern = ?2, match_type = ?3, case_sensitive = ?4,
                    enabled_entity_ids = ?5, action = ?6, command_to_execute = ?7,
                    command_parameters = ?8, webhook_url = ?9, warning_message = ?10,
                    block_message = ?11, priority = ?12, is_active = ?13, updated_at = ?14
                 WHERE id = ?1",
                params![
                    id,
                    pattern,
                    match_type.as_str(),
                    case_sensitive,
                    serde_json::to_string(&entity_ids)?,
                    action.as_str(),
                    command_to_execute,
                    serde_json::to_string(&command_parameters)?,
                    webhook_url,
                    warning_message,
                    block_message,
                    priority,
                    is_active,
                    now,
                ],
            )?;
        }

        // Invalidate both the old and the new entity scope.
        let mut affected = existing.enabled_entity_ids;
        affected.extend(entity_ids);
        self.invalidate_entities(&affected);
        Ok(())
    }

    /// Soft-delete: the rule stops matching but stays for audit.
    pub fn delete_rule(&self, id: i64) -> Result<()> {
        let existing = self
            .get_rule(id)?
            .ok_or(StringMatchError::RuleNotFound(id))?;
        let now = Utc::now().to_rfc3339();
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE stringmatch SET is_active = 0, updated_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
        }
        self.invalidate_entities(&existing.enabled_entity_ids);
        info!(rule_id = id, "string rule deactivated");
        Ok(())
    }

    /// Drop cached rule sets affected by a write. A global rule (empty
    /// entity list) touches every entity, so the whole namespace goes.
    fn invalidate_entities(&self, entity_ids: &[String]) {
        if entity_ids.is_empty() {
            self.cache.delete_prefix("stringrules:");
        } else {
            for entity in entity_ids {
                self.cache.delete(&format!("stringrules:{}", entity));
            }
        }
    }

    pub fn stats(&self) -> Result<serde_json::Value> {
        let db = self.db.lock().unwrap();
        let (total, matches): (i64, i64) = db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(match_count), 0)
             FROM stringmatch WHERE is_active = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let mut by_action = serde_json::Map::new();
        let mut stmt = db.prepare(
            "SELECT action, COUNT(*) FROM stringmatch WHERE is_active = 1 GROUP BY action",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (action, count) = row?;
            by_action.insert(action, count.into());
        }
        let regex_cache_size = self.regex_cache.lock().unwrap().len();
        Ok(serde_json::json!({
            "total_rules": total,
            "total_matches": matches,
            "rules_by_action": by_action,
            "compiled_regex_cache_size": regex_cache_size,
        }))
    }
}

const RULE_SELECT: &str = "SELECT id, pattern, match_type, case_sensitive, enabled_entity_ids,
        action, command_to_execute, command_parameters, webhook_url, warning_message,
        block_message, priority, is_active, match_count, last_matched, created_by, created_at
 FROM stringmatch";

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<StringRule> {
    let match_type: String = row.get(2)?;
    let entity_ids: String = row.get(4)?;
    let action: String = row.get(5)?;
    let parameters: String = row.get(7)?;

    Ok(StringRule {
        id: row.get(0)?,
        pattern: row.get(1)?,
        match_type: MatchType::parse(&match_type).unwrap_or(MatchType::Exact),
        case_sensitive: row.get(3)?,
        enabled_entity_ids: serde_json::from_str(&entity_ids).unwrap_or_default(),
        action: RuleAction::parse(&action).unwrap_or(RuleAction::Warn),
        command_to_execute: row.get(6)?,
        command_parameters: serde_json::from_str(&parameters).unwrap_or_default(),
        webhook_url: row.get(8)?,
        warning_message: row.get(9)?,
        block_message: row.get(10)?,
        priority: row.get(11)?,
        is_active: row.get(12)?,
        match_count: row.get(13)?,
        last_matched: row.get(14)?,
        created_by: row.get(15)?,
        created_at: row.get(16)?,
    })
}

/// The message carried back to the channel for a matched rule.
fn action_message(rule: &StringRule) -> String {
    match rule.action {
        RuleAction::Warn => rule.warning_message.clone().unwrap_or_else(|| {
            "Warning: Your message contains content that may violate community guidelines."
                .to_string()
        }),
        RuleAction::Block => rule.block_message.clone().unwrap_or_else(|| {
            "Your message has been blocked due to policy violations.".to_string()
        }),
        RuleAction::Command => format!(
            "Executing command: {}",
            rule.command_to_execute.as_deref().unwrap_or("unknown")
        ),
        RuleAction::Webhook => format!(
            "Sending to webhook: {}",
            rule.webhook_url.as_deref().unwrap_or("unknown")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> StringMatcher {
        let cache = Arc::new(TtlCache::new(
            Duration::from_secs(300),
            Duration::from_secs(600),
        ));
        StringMatcher::new(Connection::open_in_memory().unwrap(), cache).unwrap()
    }

    fn draft(pattern: &str, match_type: MatchType, action: RuleAction) -> RuleDraft {
        RuleDraft {
            pattern: pattern.to_string(),
            match_type,
            case_sensitive: false,
            enabled_entity_ids: Vec::new(),
            action,
            command_to_execute: None,
            command_parameters: Vec::new(),
            webhook_url: None,
            warning_message: None,
            block_message: None,
            priority: 100,
            created_by: "system".to_string(),
        }
    }

    #[test]
    fn contains_match_is_case_insensitive_by_default() {
        let m = matcher();
        let mut rule = draft("badword", MatchType::Contains, RuleAction::Warn);
        rule.warning_message = Some("Please be civil.".to_string());
        let id = m.create_rule(&rule).unwrap();

        let hit = m.check("this has BadWord in it", "twitch+42").unwrap().unwrap();
        assert_eq!(hit.rule_id, id);
        assert_eq!(hit.message, "Please be civil.");

        assert!(m.check("clean message", "twitch+42").unwrap().is_none());
        // Match counter advanced.
        assert_eq!(m.get_rule(id).unwrap().unwrap().match_count, 1);
    }

    #[test]
    fn exact_match_respects_case_sensitivity() {
        let m = matcher();
        let mut rule = draft("Hello", MatchType::Exact, RuleAction::Warn);
        rule.case_sensitive = true;
        m.create_rule(&rule).unwrap();

        assert!(m.check("Hello", "e").unwrap().is_some());
        assert!(m.check("hello", "e").unwrap().is_none());
        assert!(m.check("Hello there", "e").unwrap().is_none());
    }

    #[test]
    fn word_match_requires_boundaries() {
        let m = matcher();
        m.create_rule(&draft("spam", MatchType::Word, RuleAction::Block))
            .unwrap();

        assert!(m.check("buy spam now", "e").unwrap().is_some());
        assert!(m.check("spamming is fun", "e").unwrap().is_none());
    }

    #[test]
    fn invalid_regex_never_matches() {
        let m = matcher();
        m.create_rule(&draft("[unclosed", MatchType::Regex, RuleAction::Warn))
            .unwrap();
        assert!(m.check("[unclosed", "e").unwrap().is_none());
    }

    #[test]
    fn star_pattern_matches_any_nonempty_message() {
        let m = matcher();
        m.create_rule(&draft("*", MatchType::Exact, RuleAction::Webhook))
            .unwrap();
        assert!(m.check("anything at all", "e").unwrap().is_some());
        assert!(m.check("", "e").unwrap().is_none());
    }

    #[test]
    fn lowest_priority_rule_wins() {
        let m = matcher();
        let mut low = draft("word", MatchType::Contains, RuleAction::Block);
        low.priority = 10;
        let low_id = m.create_rule(&low).unwrap();
        let mut high = draft("word", MatchType::Contains, RuleAction::Warn);
        high.priority = 50;
        m.create_rule(&high).unwrap();

        let hit = m.check("word", "e").unwrap().unwrap();
        assert_eq!(hit.rule_id, low_id);
        assert_eq!(hit.action, RuleAction::Block);
    }

    #[test]
    fn entity_scoping_filters_rules() {
        let m = matcher();
        let mut scoped = draft("scoped", MatchType::Contains, RuleAction::Warn);
        scoped.enabled_entity_ids = vec!["twitch+42".to_string()];
        m.create_rule(&scoped).unwrap();

        assert!(m.check("scoped", "twitch+42").unwrap().is_some());
        assert!(m.check("scoped", "discord+g+c").unwrap().is_none());
    }

    #[test]
    fn update_invalidates_cached_rules() {
        let m = matcher();
        let id = m
            .create_rule(&draft("old", MatchType::Contains, RuleAction::Warn))
            .unwrap();
        // Prime the cache for this entity.
        assert!(m.check("old", "e").unwrap().is_some());

        m.update_rule(
            id,
            &RuleUpdate {
                pattern: Some("new".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(m.check("old", "e").unwrap().is_none());
        assert!(m.check("new", "e").unwrap().is_some());
    }

    #[test]
    fn delete_stops_matching() {
        let m = matcher();
        let id = m
            .create_rule(&draft("gone", MatchType::Contains, RuleAction::Warn))
            .unwrap();
        assert!(m.check("gone", "e").unwrap().is_some());

        m.delete_rule(id).unwrap();
        assert!(m.check("gone", "e").unwrap().is_none());
        assert!(m.delete_rule(9999).is_err());
    }
}
