use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Pending,
    Open,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Open => "open",
            TicketStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TicketStatus::Pending),
            "open" => Ok(TicketStatus::Open),
            "closed" => Ok(TicketStatus::Closed),
            other => Err(format!("unknown ticket status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    /// Digits only for people, full group id for groups.
    pub number: String,
    /// Identifier the transport currently prefers for this person (lid or pn jid).
    pub preferred_id: Option<String>,
    pub lid: Option<String>,
    pub phone_number: Option<String>,
    pub profile_pic_url: Option<String>,
    pub is_group: bool,
    pub ignore_messages: bool,
    pub channel_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// First word of the display name, stripped of anything that is not a letter.
    pub fn first_name(&self) -> String {
        let first = self.name.split_whitespace().next().unwrap_or_default();
        let cleaned: String = first.chars().filter(|c| c.is_alphabetic()).collect();
        if cleaned.is_empty() {
            "Amigo(a)".to_string()
        } else {
            cleaned
        }
    }
}

/// Insert form of [`Contact`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewContact {
    pub tenant_id: i64,
    pub name: String,
    pub number: String,
    pub preferred_id: Option<String>,
    pub lid: Option<String>,
    pub phone_number: Option<String>,
    pub profile_pic_url: Option<String>,
    pub is_group: bool,
    pub channel_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: i64,
    pub tenant_id: i64,
    pub contact_id: i64,
    pub channel_id: i64,
    pub status: TicketStatus,
    pub user_id: Option<i64>,
    pub queue_id: Option<i64>,
    /// Menu cursor inside the queue option tree.
    pub queue_option_id: Option<i64>,
    pub chatbot: bool,
    pub use_integration: bool,
    pub integration_id: Option<i64>,
    pub prompt_id: Option<i64>,
    pub amount_used_bot_queues: i64,
    pub last_message: Option<String>,
    pub from_me: bool,
    pub is_group: bool,
    pub unread_messages: i64,
    pub awaiting_queue_selection: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn has_integration(&self) -> bool {
        self.use_integration && (self.integration_id.is_some() || self.prompt_id.is_some())
    }
}

/// Field changes requested against a ticket. `None` leaves the column as is;
/// `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketChanges {
    pub status: Option<TicketStatus>,
    pub user_id: Option<Option<i64>>,
    pub queue_id: Option<Option<i64>>,
    pub queue_option_id: Option<Option<i64>>,
    pub chatbot: Option<bool>,
    pub use_integration: Option<bool>,
    pub integration_id: Option<Option<i64>>,
    pub prompt_id: Option<Option<i64>>,
    pub amount_used_bot_queues: Option<i64>,
    pub last_message: Option<String>,
    pub from_me: Option<bool>,
    pub unread_messages: Option<i64>,
    pub awaiting_queue_selection: Option<bool>,
}

impl TicketChanges {
    pub fn is_empty(&self) -> bool {
        *self == TicketChanges::default()
    }

    /// Apply onto an in-memory copy, used to compute the row a CAS write produces.
    pub fn apply(&self, ticket: &mut Ticket) {
        if let Some(v) = self.status {
            ticket.status = v;
        }
        if let Some(v) = self.user_id {
            ticket.user_id = v;
        }
        if let Some(v) = self.queue_id {
            ticket.queue_id = v;
        }
        if let Some(v) = self.queue_option_id {
            ticket.queue_option_id = v;
        }
        if let Some(v) = self.chatbot {
            ticket.chatbot = v;
        }
        if let Some(v) = self.use_integration {
            ticket.use_integration = v;
        }
        if let Some(v) = self.integration_id {
            ticket.integration_id = v;
        }
        if let Some(v) = self.prompt_id {
            ticket.prompt_id = v;
        }
        if let Some(v) = self.amount_used_bot_queues {
            ticket.amount_used_bot_queues = v;
        }
        if let Some(v) = &self.last_message {
            ticket.last_message = Some(v.clone());
        }
        if let Some(v) = self.from_me {
            ticket.from_me = v;
        }
        if let Some(v) = self.unread_messages {
            ticket.unread_messages = v;
        }
        if let Some(v) = self.awaiting_queue_selection {
            ticket.awaiting_queue_selection = v;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TicketTracking {
    pub id: i64,
    pub ticket_id: i64,
    pub tenant_id: i64,
    pub channel_id: Option<i64>,
    pub user_id: Option<i64>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub chatbot_at: Option<DateTime<Utc>>,
    pub rating_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub rated: bool,
    pub created_at: DateTime<Utc>,
}

impl TicketTracking {
    /// A rating prompt was sent, an agent owned the ticket and nothing closed the period yet.
    pub fn awaiting_rating(&self) -> bool {
        self.finished_at.is_none() && self.user_id.is_some() && self.rating_at.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingChanges {
    pub user_id: Option<Option<i64>>,
    pub queued_at: Option<Option<DateTime<Utc>>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub chatbot_at: Option<Option<DateTime<Utc>>>,
    pub rating_at: Option<Option<DateTime<Utc>>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
    pub closed_at: Option<Option<DateTime<Utc>>>,
    pub rated: Option<bool>,
}

impl TrackingChanges {
    pub fn apply(&self, tracking: &mut TicketTracking) {
        if let Some(v) = self.user_id {
            tracking.user_id = v;
        }
        if let Some(v) = self.queued_at {
            tracking.queued_at = v;
        }
        if let Some(v) = self.started_at {
            tracking.started_at = v;
        }
        if let Some(v) = self.chatbot_at {
            tracking.chatbot_at = v;
        }
        if let Some(v) = self.rating_at {
            tracking.rating_at = v;
        }
        if let Some(v) = self.finished_at {
            tracking.finished_at = v;
        }
        if let Some(v) = self.closed_at {
            tracking.closed_at = v;
        }
        if let Some(v) = self.rated {
            tracking.rated = v;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// External id assigned by the transport.
    pub id: String,
    pub tenant_id: i64,
    pub ticket_id: i64,
    pub contact_id: Option<i64>,
    pub body: String,
    pub from_me: bool,
    pub read: bool,
    pub media_url: Option<String>,
    pub media_type: String,
    pub quoted_msg_id: Option<String>,
    pub ack: i64,
    pub remote_jid: Option<String>,
    pub participant: Option<String>,
    /// Raw protocol payload as received.
    pub data_json: Option<String>,
    pub is_edited: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert form of [`Message`]; the store stamps `created_at`.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub id: String,
    pub tenant_id: i64,
    pub ticket_id: i64,
    pub contact_id: Option<i64>,
    pub body: String,
    pub from_me: bool,
    pub read: bool,
    pub media_url: Option<String>,
    pub media_type: String,
    pub quoted_msg_id: Option<String>,
    pub ack: i64,
    pub remote_jid: Option<String>,
    pub participant: Option<String>,
    pub data_json: Option<String>,
    pub is_edited: bool,
}

/// One row of a weekly schedule. Empty bounds mean no restriction that day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    /// Lowercase English weekday name ("monday").
    pub weekday_en: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub greeting_message: Option<String>,
    pub out_of_hours_message: Option<String>,
    pub schedules: Vec<ScheduleEntry>,
    pub integration_id: Option<i64>,
    pub prompt_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueOption {
    pub id: i64,
    pub queue_id: i64,
    pub parent_id: Option<i64>,
    /// Code the customer types to pick this node ("1", "2", ...).
    pub option: String,
    pub title: String,
    pub message: Option<String>,
}

/// A tenant's WhatsApp connection and its automated texts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub greeting_message: Option<String>,
    pub completion_message: Option<String>,
    pub out_of_hours_message: Option<String>,
    pub rating_message: Option<String>,
    pub transfer_message: Option<String>,
    pub prompt_id: Option<i64>,
    pub integration_id: Option<i64>,
    pub max_use_bot_queues: i64,
    /// Cooldown in minutes between bot activations.
    pub time_use_bot_queues: i64,
    /// Inactivity limit in minutes, 0 disables the sweeper for this channel.
    pub expires_ticket: i64,
    pub expires_inactive_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub prompt: String,
    pub api_key: String,
    pub max_tokens: i64,
    pub max_messages: i64,
    pub temperature: f64,
    /// "text" (or "texto") replies with text, anything else is a synthesis voice name.
    pub voice: String,
    pub voice_key: Option<String>,
    pub voice_region: Option<String>,
    pub queue_id: Option<i64>,
}

impl Prompt {
    pub fn replies_with_text(&self) -> bool {
        matches!(self.voice.trim(), "" | "text" | "texto")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationKind {
    Webhook,
    Flow,
    IntentEngine,
}

impl IntegrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationKind::Webhook => "webhook",
            IntegrationKind::Flow => "flow",
            IntegrationKind::IntentEngine => "intentengine",
        }
    }
}

impl FromStr for IntegrationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" | "n8n" => Ok(IntegrationKind::Webhook),
            "flow" | "typebot" => Ok(IntegrationKind::Flow),
            "intentengine" | "dialogflow" => Ok(IntegrationKind::IntentEngine),
            other => Err(format!("unknown integration kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub kind: IntegrationKind,
    pub url: Option<String>,
    pub project_name: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserRating {
    pub id: i64,
    pub ticket_id: i64,
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    pub rate: i64,
    pub created_at: DateTime<Utc>,
}
