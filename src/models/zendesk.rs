use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ticket::TicketStatus;

/// Represents a ticket as returned by `GET /api/v2/tickets/{id}.json`.
/// Only the fields mirrored locally are deserialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZendeskTicket {
    /// Unique identifier of the ticket in Zendesk
    pub id: i64,
    /// API url of the ticket
    pub url: Option<String>,
    pub subject: Option<String>,
    /// The first comment's text, as Zendesk copies it onto the ticket
    pub description: Option<String>,
    /// Current state of the ticket (e.g. "open", "solved")
    pub status: TicketStatus,
    /// User who asked for support
    pub requester_id: i64,
    /// Custom field values, kept unprocessed
    #[serde(default)]
    pub custom_fields: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Represents a comment on a ticket.
/// Each comment is one communication in the ticket's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZendeskComment {
    pub id: i64,
    pub author_id: i64,
    pub body: Option<String>,
    /// `false` for internal notes that the requester cannot see
    pub public: bool,
    pub created_at: DateTime<Utc>,
}

/// A Zendesk user (end user or agent).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZendeskUser {
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    /// Identifier of the user in the system that created it, if any
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct TicketResponse {
    pub ticket: ZendeskTicket,
}

#[derive(Debug, Deserialize)]
pub struct CommentsResponse {
    pub comments: Vec<ZendeskComment>,
    /// Absolute url of the next page, `null` on the last page
    pub next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UsersResponse {
    pub users: Vec<ZendeskUser>,
}

/// Everything a sync run needs from Zendesk for a single ticket.
#[derive(Debug, Clone)]
pub struct RemoteTicket {
    pub ticket: ZendeskTicket,
    pub comments: Vec<ZendeskComment>,
    pub users: Vec<ZendeskUser>,
}

impl RemoteTicket {
    pub fn user(&self, id: i64) -> Option<&ZendeskUser> {
        self.users.iter().find(|user| user.id == id)
    }

    /// Requester first, then comment authors, each once.
    pub fn user_ids(ticket: &ZendeskTicket, comments: &[ZendeskComment]) -> Vec<i64> {
        let mut ids = vec![ticket.requester_id];
        for comment in comments {
            if !ids.contains(&comment.author_id) {
                ids.push(comment.author_id);
            }
        }
        ids
    }
}
