//! Mail event data models.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mail provider backends that events can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Google Gmail.
    #[serde(alias = "Gmail")]
    Gmail,
    /// Microsoft Outlook / Graph.
    #[serde(alias = "Outlook")]
    Outlook,
}

impl ProviderType {
    /// Every known provider type.
    pub const ALL: [Self; 2] = [Self::Gmail, Self::Outlook];

    /// Returns the lowercase provider name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier assigned to an event when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a fresh message ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Payload of a send-email event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMail {
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub body: String,
}

/// The operation an event asks a provider to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Send an email.
    Send(SendMail),
    /// Read the account's inbox.
    ReadInbox,
}

impl EventKind {
    /// Kind tags accepted on the wire.
    pub const TAGS: [&'static str; 2] = ["send", "read_inbox"];

    /// Returns the wire tag of this kind.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Send(_) => "send",
            Self::ReadInbox => "read_inbox",
        }
    }

    /// Returns the queue topic for a wire tag, if the tag is known.
    #[must_use]
    pub fn topic_for_tag(tag: &str) -> Option<&'static str> {
        match tag {
            "send" => Some("mail-send"),
            "read_inbox" => Some("mail-read"),
            _ => None,
        }
    }

    /// Returns the queue topic events of this kind are published on.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::Send(_) => "mail-send",
            Self::ReadInbox => "mail-read",
        }
    }
}

/// A queued mail event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailEvent {
    message_id: MessageId,
    /// Correlates the event with the request that produced it.
    #[serde(default)]
    pub correlation_id: Uuid,
    /// Provider the event targets.
    pub provider_type: ProviderType,
    /// User mail account the operation runs against.
    pub user_mail_account_id: Uuid,
    /// Caller-supplied business-level deduplication key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Operation to perform.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl MailEvent {
    /// Creates a new event with a freshly generated message ID.
    #[must_use]
    pub fn new(provider_type: ProviderType, user_mail_account_id: Uuid, kind: EventKind) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id: Uuid::new_v4(),
            provider_type,
            user_mail_account_id,
            idempotency_key: None,
            kind,
        }
    }

    /// Creates a send-email event.
    #[must_use]
    pub fn send(
        provider_type: ProviderType,
        user_mail_account_id: Uuid,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(
            provider_type,
            user_mail_account_id,
            EventKind::Send(SendMail {
                to: to.into(),
                subject: subject.into(),
                body: body.into(),
            }),
        )
    }

    /// Creates a read-inbox event.
    #[must_use]
    pub fn read_inbox(provider_type: ProviderType, user_mail_account_id: Uuid) -> Self {
        Self::new(provider_type, user_mail_account_id, EventKind::ReadInbox)
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Sets the correlation ID.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Returns the message ID. It is fixed at creation.
    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Returns the idempotency key, treating an empty key as absent.
    #[must_use]
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref().filter(|k| !k.is_empty())
    }

    /// Returns the queue topic for this event.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        self.kind.topic()
    }
}
