use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states of a Zendesk ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TicketStatus {
    New,
    Open,
    Pending,
    Hold,
    Solved,
    Closed,
}

/// Local cache of a Zendesk user, referenced as requester and comment author.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub zendesk_id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Local mirror of a Zendesk ticket.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Ticket {
    pub id: i64,
    pub zendesk_id: i64,
    /// Local id of the requesting [`User`]
    pub requester_id: i64,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub status: TicketStatus,
    /// JSON text as received from Zendesk
    pub custom_fields: Option<String>,
    /// JSON array text as received from Zendesk
    pub tags: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Comment {
    pub id: i64,
    pub zendesk_id: i64,
    /// Local id of the owning [`Ticket`]
    pub ticket_id: i64,
    /// Local id of the authoring [`User`]
    pub author_id: i64,
    pub body: Option<String>,
    pub public: bool,
    pub created_at: DateTime<Utc>,
}
