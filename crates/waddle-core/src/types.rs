use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{PREFIX_COMMUNITY, PREFIX_LOCAL};

/// The closed set of event types collectors may submit.
///
/// Wire names are a mix of camelCase (chat) and snake_case (platform
/// lifecycle events) — they must match the collector protocol exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "chatMessage")]
    ChatMessage,
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "follow")]
    Follow,
    #[serde(rename = "donation")]
    Donation,
    #[serde(rename = "cheer")]
    Cheer,
    #[serde(rename = "raid")]
    Raid,
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "subgift")]
    Subgift,
    #[serde(rename = "resub")]
    Resub,
    #[serde(rename = "reaction")]
    Reaction,
    #[serde(rename = "member_join")]
    MemberJoin,
    #[serde(rename = "member_leave")]
    MemberLeave,
    #[serde(rename = "voice_join")]
    VoiceJoin,
    #[serde(rename = "voice_leave")]
    VoiceLeave,
    #[serde(rename = "voice_time")]
    VoiceTime,
    #[serde(rename = "boost")]
    Boost,
    #[serde(rename = "ban")]
    Ban,
    #[serde(rename = "kick")]
    Kick,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "file_share")]
    FileShare,
    #[serde(rename = "app_mention")]
    AppMention,
    #[serde(rename = "channel_join")]
    ChannelJoin,
}

impl MessageType {
    /// The wire name collectors send.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ChatMessage => "chatMessage",
            MessageType::Subscription => "subscription",
            MessageType::Follow => "follow",
            MessageType::Donation => "donation",
            MessageType::Cheer => "cheer",
            MessageType::Raid => "raid",
            MessageType::Host => "host",
            MessageType::Subgift => "subgift",
            MessageType::Resub => "resub",
            MessageType::Reaction => "reaction",
            MessageType::MemberJoin => "member_join",
            MessageType::MemberLeave => "member_leave",
            MessageType::VoiceJoin => "voice_join",
            MessageType::VoiceLeave => "voice_leave",
            MessageType::VoiceTime => "voice_time",
            MessageType::Boost => "boost",
            MessageType::Ban => "ban",
            MessageType::Kick => "kick",
            MessageType::Timeout => "timeout",
            MessageType::Warn => "warn",
            MessageType::FileShare => "file_share",
            MessageType::AppMention => "app_mention",
            MessageType::ChannelJoin => "channel_join",
        }
    }

    /// Event name used by the reputation service. Most names pass through;
    /// chat and subscription events are renamed on its side of the fence.
    pub fn reputation_event_name(&self) -> &'static str {
        match self {
            MessageType::ChatMessage => "message",
            MessageType::Subscription => "sub",
            other => other.as_str(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event as POSTed by a collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub platform: String,
    pub server_id: String,
    #[serde(default)]
    pub channel_id: String,
    pub user_id: String,
    pub user_name: String,
    pub message_content: String,
    pub message_type: MessageType,
    /// Platform-specific extras, forwarded to the reputation service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
}

impl InboundEvent {
    pub fn entity_id(&self) -> String {
        entity_id(&self.platform, &self.server_id, &self.channel_id)
    }
}

/// Derive the canonical entity id for a chat location.
///
/// Format is `platform+server+channel`. Twitch has no sub-channels, so its
/// entities are always `twitch+<channel>`; any platform without a channel
/// id collapses to the server-wide form.
pub fn entity_id(platform: &str, server_id: &str, channel_id: &str) -> String {
    if platform == "twitch" || channel_id.is_empty() {
        format!("{}+{}", platform, server_id)
    } else {
        format!("{}+{}+{}", platform, server_id, channel_id)
    }
}

/// Which prefix introduced a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPrefix {
    /// `!` — local container interaction modules.
    Local,
    /// `#` — community marketplace modules.
    Community,
}

impl CommandPrefix {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            PREFIX_LOCAL => Some(CommandPrefix::Local),
            PREFIX_COMMUNITY => Some(CommandPrefix::Community),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            CommandPrefix::Local => PREFIX_LOCAL,
            CommandPrefix::Community => PREFIX_COMMUNITY,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandPrefix::Local => "!",
            CommandPrefix::Community => "#",
        }
    }
}

/// A parsed command, ready for lookup and dispatch.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub message_id: String,
    pub entity_id: String,
    pub user_id: String,
    pub user_name: String,
    pub command: String,
    pub parameters: Vec<String>,
    pub raw_message: String,
    pub platform: String,
    pub server_id: String,
    pub channel_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one dispatch, shaped for the response envelope and the
/// execution audit log.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub response_data: Value,
    pub execution_time_ms: i64,
    pub status_code: u16,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl CommandResult {
    pub fn failure(status_code: u16, message: &str, execution_time_ms: i64) -> Self {
        Self {
            success: false,
            response_data: serde_json::json!({ "error": message }),
            execution_time_ms,
            status_code,
            error_message: Some(message.to_string()),
            retry_count: 0,
        }
    }
}

/// Unique id for one inbound message; doubles as the execution id.
pub fn message_id(platform: &str, server_id: &str, channel_id: &str) -> String {
    format!(
        "{}_{}_{}_{}",
        platform,
        server_id,
        channel_id,
        Utc::now().timestamp_micros()
    )
}

/// Split a chat message into a command request, if it is one.
///
/// A command is a message whose first character is a registered prefix
/// followed by at least one non-empty token. The command token is
/// lowercased; the remaining whitespace-separated tokens become positional
/// parameters.
pub fn parse_message(
    message_content: &str,
    platform: &str,
    server_id: &str,
    channel_id: &str,
    user_id: &str,
    user_name: &str,
) -> Option<CommandRequest> {
    if message_content.len() < 2 {
        return None;
    }

    let mut chars = message_content.chars();
    CommandPrefix::from_char(chars.next()?)?;

    let mut parts = message_content[1..].split_whitespace();
    let command = parts.next()?.to_lowercase();
    if command.is_empty() {
        return None;
    }
    let parameters: Vec<String> = parts.map(str::to_string).collect();

    Some(CommandRequest {
        message_id: message_id(platform, server_id, channel_id),
        entity_id: entity_id(platform, server_id, channel_id),
        user_id: user_id.to_string(),
        user_name: user_name.to_string(),
        command,
        parameters,
        raw_message: message_content.to_string(),
        platform: platform.to_string(),
        server_id: server_id.to_string(),
        channel_id: channel_id.to_string(),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twitch_entity_drops_channel() {
        assert_eq!(entity_id("twitch", "42", "ignored"), "twitch+42");
        assert_eq!(entity_id("twitch", "42", ""), "twitch+42");
    }

    #[test]
    fn discord_entity_includes_channel_when_present() {
        assert_eq!(entity_id("discord", "g1", "c1"), "discord+g1+c1");
        assert_eq!(entity_id("discord", "g1", ""), "discord+g1");
    }

    #[test]
    fn parse_extracts_command_and_parameters() {
        let req = parse_message("!Help me  please", "twitch", "42", "", "u1", "alice").unwrap();
        assert_eq!(req.command, "help");
        assert_eq!(req.parameters, vec!["me", "please"]);
        assert_eq!(req.entity_id, "twitch+42");
        assert_eq!(req.raw_message, "!Help me  please");
    }

    #[test]
    fn parse_accepts_community_prefix() {
        let req = parse_message("#so alice", "discord", "g", "c", "u", "bob").unwrap();
        assert_eq!(req.command, "so");
        assert_eq!(req.parameters, vec!["alice"]);
    }

    #[test]
    fn parse_rejects_non_commands() {
        assert!(parse_message("hello there", "twitch", "42", "", "u", "n").is_none());
        assert!(parse_message("!", "twitch", "42", "", "u", "n").is_none());
        assert!(parse_message("!   ", "twitch", "42", "", "u", "n").is_none());
        assert!(parse_message("", "twitch", "42", "", "u", "n").is_none());
    }

    #[test]
    fn message_type_wire_names_round_trip() {
        for (wire, expected) in [
            ("chatMessage", MessageType::ChatMessage),
            ("member_join", MessageType::MemberJoin),
            ("voice_time", MessageType::VoiceTime),
        ] {
            let parsed: MessageType =
                serde_json::from_value(Value::String(wire.to_string())).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(parsed.as_str(), wire);
        }
        assert!(serde_json::from_value::<MessageType>(Value::String("bogus".into())).is_err());
    }

    #[test]
    fn reputation_names_remap_chat_and_subscription() {
        assert_eq!(MessageType::ChatMessage.reputation_event_name(), "message");
        assert_eq!(MessageType::Subscription.reputation_event_name(), "sub");
        assert_eq!(MessageType::Cheer.reputation_event_name(), "cheer");
    }
}
