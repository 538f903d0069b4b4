use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Title given to a conversation before its first question is asked.
pub const DEFAULT_TITLE: &str = "Nouveau chat";

/// Marker appended to a truncated conversation title.
pub const TITLE_ELLIPSIS: char = '…';

// =============================================================================
// Enums
// =============================================================================

/// Which corpus the answer may cite.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFilter {
    /// Quran and Hadith (default).
    #[default]
    Both,
    /// Quran verses only.
    Quran,
    /// Hadith only.
    Hadith,
}

impl SourceFilter {
    /// Wire spelling used in the `source_filter` request field.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFilter::Both => "both",
            SourceFilter::Quran => "quran",
            SourceFilter::Hadith => "hadith",
        }
    }
}

impl fmt::Display for SourceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "both" => Ok(SourceFilter::Both),
            "quran" | "coran" => Ok(SourceFilter::Quran),
            "hadith" => Ok(SourceFilter::Hadith),
            other => Err(format!("unknown source filter: {}", other)),
        }
    }
}

/// Origin of a cited passage.
///
/// The service spells the Quran variant `"Coran"`; the English spelling is
/// accepted too.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    #[default]
    #[serde(rename = "Coran", alias = "Quran", alias = "quran", alias = "coran")]
    Quran,
    #[serde(alias = "hadith")]
    Hadith,
}

/// Author of a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

// =============================================================================
// Verses
// =============================================================================

/// Location of a Quran verse.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerseMetadata {
    pub sourate: i64,
    pub ayah: i64,
    pub sourate_name: String,
}

/// A cited source passage returned alongside an answer. Immutable once received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Verse {
    /// Human-readable reference, e.g. `"2:185"` or a hadith collection number.
    pub reference: String,
    pub text_ar: String,
    pub text_fr: String,
    #[serde(default)]
    pub source_type: SourceType,
    /// Retrieval relevance, when the service reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VerseMetadata>,
}

// =============================================================================
// Messages and conversations
// =============================================================================

/// A single message within a [`Conversation`].
///
/// User messages are created complete. Assistant messages start empty with
/// `is_streaming = true` and are mutated in place until a terminal event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Verse>>,
    #[serde(default)]
    pub is_streaming: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A complete user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            sources: None,
            is_streaming: false,
            created_at: Utc::now(),
        }
    }

    /// An empty assistant message awaiting streamed content.
    pub fn assistant_placeholder() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: String::new(),
            sources: None,
            is_streaming: true,
            created_at: Utc::now(),
        }
    }

    /// A finished assistant message, as restored from history.
    pub fn assistant_complete(content: impl Into<String>, sources: Option<Vec<Verse>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: content.into(),
            sources,
            is_streaming: false,
            created_at: Utc::now(),
        }
    }
}

/// An independent chat conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Derived from the first user message and fixed thereafter.
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// A fresh, empty conversation with a random id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// A fresh, empty conversation reusing a known id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Whether the conversation holds no messages yet.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a conversation title from a question.
///
/// Questions longer than `max_chars` characters are cut at that many
/// characters and suffixed with [`TITLE_ELLIPSIS`].
pub fn derive_title(question: &str, max_chars: usize) -> String {
    let trimmed = question.trim();
    if trimmed.chars().count() > max_chars {
        let mut title: String = trimmed.chars().take(max_chars).collect();
        title.push(TITLE_ELLIPSIS);
        title
    } else {
        trimmed.to_string()
    }
}

// =============================================================================
// Stream events
// =============================================================================

/// One decoded event of an answer stream.
///
/// At most one `Sources` precedes the `Token`s; exactly one terminal event
/// (`Done` or `Error`) ends a well-formed stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Sources(Vec<Verse>),
    Token(String),
    Done,
    Error {
        message: String,
        error_code: Option<String>,
        reset_time: Option<String>,
    },
}

// =============================================================================
// Quota
// =============================================================================

/// Snapshot of the locally cached daily usage, for display.
///
/// Advisory only: the server's limit responses always take precedence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    /// Daily request allowance; `<= 0` means unlimited.
    pub limit: i64,
    pub used_today: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<String>,
}

impl QuotaState {
    /// Whether no further request should be attempted. A snapshot only
    /// carries a reset time while the quota is exhausted.
    pub fn is_limit_reached(&self) -> bool {
        self.reset_time.is_some() || (self.limit > 0 && self.used_today >= self.limit)
    }
}

/// Subscription plan attached to a user profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    #[serde(default)]
    pub name: String,
    /// `-1` means unlimited.
    pub daily_request_limit: i64,
}

/// The quota-relevant part of the cached user profile.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub subscription_plan: Option<SubscriptionPlan>,
    #[serde(default)]
    pub requests_today: i64,
    #[serde(default)]
    pub last_request_date: Option<NaiveDate>,
}

// =============================================================================
// History
// =============================================================================

/// One past question/answer pair returned by the history endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub query: String,
    pub response: String,
    #[serde(default)]
    pub sources: Option<Vec<Verse>>,
    pub created_at: DateTime<Utc>,
}

/// Accept either a JSON string or a JSON integer as an identifier.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
