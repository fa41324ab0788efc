pub mod db;
pub mod error;
pub mod matcher;
pub mod types;

pub use matcher::StringMatcher;
pub use types::{MatchType, RuleAction, RuleDraft, RuleUpdate, StringMatch, StringRule};
