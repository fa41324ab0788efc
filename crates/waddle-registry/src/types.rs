use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a command executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Container,
    Lambda,
    Openwhisk,
    Webhook,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Container => "container",
            CommandType::Lambda => "lambda",
            CommandType::Openwhisk => "openwhisk",
            CommandType::Webhook => "webhook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "container" => Some(CommandType::Container),
            "lambda" => Some(CommandType::Lambda),
            "openwhisk" => Some(CommandType::Openwhisk),
            "webhook" => Some(CommandType::Webhook),
            _ => None,
        }
    }
}

/// What fires a module: explicit commands, inbound events, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Command,
    Event,
    Both,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Command => "command",
            TriggerType::Event => "event",
            TriggerType::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "command" => Some(TriggerType::Command),
            "event" => Some(TriggerType::Event),
            "both" => Some(TriggerType::Both),
            _ => None,
        }
    }
}

/// How event-triggered modules run relative to each other in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sequential" => Some(ExecutionMode::Sequential),
            "parallel" => Some(ExecutionMode::Parallel),
            _ => None,
        }
    }
}

/// A registered command / module endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub command: String,
    pub prefix: String,
    pub description: Option<String>,
    pub location_url: String,
    pub location: String,
    #[serde(rename = "type")]
    pub kind: CommandType,
    pub method: String,
    pub timeout_secs: u64,
    pub headers: Option<HashMap<String, String>>,
    pub auth_required: bool,
    /// Requests per minute; 0 disables rate limiting for this command.
    pub rate_limit: u32,
    pub is_active: bool,
    pub module_type: String,
    pub module_id: Option<String>,
    pub version: String,
    pub trigger_type: TriggerType,
    pub event_types: Vec<String>,
    /// Lower number runs first.
    pub priority: i64,
    pub execution_mode: ExecutionMode,
}

/// Fields supplied when registering a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDraft {
    pub command: String,
    pub prefix: String,
    #[serde(default)]
    pub description: Option<String>,
    pub location_url: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub rate_limit: u32,
    #[serde(default = "default_module_type")]
    pub module_type: String,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_trigger_type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
}

fn default_location() -> String {
    "internal".to_string()
}
fn default_method() -> String {
    "POST".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_module_type() -> String {
    "local".to_string()
}
fn default_version() -> String {
    "1.0".to_string()
}
fn default_trigger_type() -> TriggerType {
    TriggerType::Command
}
fn default_priority() -> i64 {
    100
}
fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Sequential
}

/// A chat location the router has seen at least once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub entity_id: String,
    pub platform: String,
    pub server_id: String,
    pub channel_id: String,
    pub owner: String,
    pub is_active: bool,
    pub config: Value,
    pub created_at: String,
}

/// Terminal state of one execution in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

/// The slice of an execution row needed to validate a module reply.
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    pub execution_id: String,
    pub command_id: i64,
    /// Canonical entity string (`platform+server+channel`).
    pub entity_id: String,
    pub status: String,
}

/// Typed response action a module may reply with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseAction {
    Chat,
    Media,
    Ticker,
    Form,
    General,
}

impl ResponseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseAction::Chat => "chat",
            ResponseAction::Media => "media",
            ResponseAction::Ticker => "ticker",
            ResponseAction::Form => "form",
            ResponseAction::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(ResponseAction::Chat),
            "media" => Some(ResponseAction::Media),
            "ticker" => Some(ResponseAction::Ticker),
            "form" => Some(ResponseAction::Form),
            "general" => Some(ResponseAction::General),
            _ => None,
        }
    }
}

/// A module reply as accepted by `POST /router/responses`.
///
/// Only the fields matching `action` are expected to be set; the rest stay
/// NULL in the row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleResponseDraft {
    pub execution_id: String,
    pub module_name: String,
    pub success: bool,
    #[serde(default)]
    pub response_data: Value,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub processing_time_ms: i64,
    #[serde(default)]
    pub chat_message: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub ticker_text: Option<String>,
    #[serde(default)]
    pub ticker_duration: Option<i64>,
    #[serde(default)]
    pub form_title: Option<String>,
    #[serde(default)]
    pub form_description: Option<String>,
    #[serde(default)]
    pub form_fields: Option<Value>,
    #[serde(default)]
    pub form_submit_url: Option<String>,
    #[serde(default)]
    pub form_submit_method: Option<String>,
    #[serde(default)]
    pub form_callback_url: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub style: Option<Value>,
}

/// A stored module reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleResponseRow {
    pub id: i64,
    pub action: ResponseAction,
    #[serde(flatten)]
    pub draft: ModuleResponseDraft,
    pub created_at: String,
}
