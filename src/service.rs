use anyhow::Context;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::db;
use crate::models::ticket::{Comment, Ticket, User};
use crate::models::zendesk::RemoteTicket;
use crate::models::zendesk_api::ZendeskApi;

/// Mirrors Zendesk tickets, their comments and the users involved into the
/// local store.
#[derive(Clone)]
pub struct SyncService {
    api: Arc<dyn ZendeskApi>,
}

impl SyncService {
    pub fn new(api: Arc<dyn ZendeskApi>) -> Self {
        Self { api }
    }

    /// Fetches the ticket, every comment and every user they reference.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_ticket(&self, ticket_id: i64) -> anyhow::Result<RemoteTicket> {
        let ticket = self
            .api
            .fetch_ticket(ticket_id)
            .await
            .with_context(|| format!("failed to fetch ticket {ticket_id}"))?;
        let comments = self
            .api
            .fetch_comments(ticket_id)
            .await
            .with_context(|| format!("failed to fetch comments of ticket {ticket_id}"))?;
        let user_ids = RemoteTicket::user_ids(&ticket, &comments);
        let users = self
            .api
            .fetch_users(&user_ids)
            .await
            .context("failed to fetch ticket users")?;

        debug!(
            "Fetched ticket {} with {} comments and {} users",
            ticket.id,
            comments.len(),
            users.len()
        );
        Ok(RemoteTicket {
            ticket,
            comments,
            users,
        })
    }

    /// Stores a fetched ticket. Returns the local ticket and whether it was
    /// newly created.
    #[tracing::instrument(skip_all, fields(ticket_id = remote.ticket.id))]
    pub async fn sync_ticket(
        &self,
        conn: &mut SqliteConnection,
        remote: &RemoteTicket,
    ) -> anyhow::Result<(Ticket, bool)> {
        let requester = sync_user(conn, remote, remote.ticket.requester_id).await?;
        let (ticket, created) = db::upsert_ticket(conn, &remote.ticket, &requester).await?;

        // a new ticket may have no comments yet
        let comments = self.sync_comments(conn, remote, &ticket, requester).await?;

        info!(
            created,
            comments = comments.len(),
            "Synced ticket {}",
            remote.ticket.id
        );
        Ok((ticket, created))
    }

    async fn sync_comments(
        &self,
        conn: &mut SqliteConnection,
        remote: &RemoteTicket,
        ticket: &Ticket,
        requester: User,
    ) -> anyhow::Result<Vec<Comment>> {
        let mut authors: HashMap<i64, User> = HashMap::new();
        authors.insert(requester.zendesk_id, requester);

        let mut comments = Vec::with_capacity(remote.comments.len());
        for remote_comment in &remote.comments {
            if !authors.contains_key(&remote_comment.author_id) {
                let author = sync_user(conn, remote, remote_comment.author_id).await?;
                authors.insert(remote_comment.author_id, author);
            }
            let author = &authors[&remote_comment.author_id];
            comments.push(db::upsert_comment(conn, ticket, author, remote_comment).await?);
        }
        comments.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(comments)
    }
}

async fn sync_user(
    conn: &mut SqliteConnection,
    remote: &RemoteTicket,
    zendesk_id: i64,
) -> anyhow::Result<User> {
    let user = remote
        .user(zendesk_id)
        .with_context(|| format!("Zendesk did not return user {zendesk_id}"))?;
    db::upsert_user(conn, user).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::db::DB;
    use crate::models::ticket::TicketStatus;
    use crate::models::zendesk::{ZendeskComment, ZendeskTicket, ZendeskUser};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct StaticZendesk {
        users: Vec<ZendeskUser>,
    }

    #[async_trait]
    impl ZendeskApi for StaticZendesk {
        async fn fetch_ticket(&self, ticket_id: i64) -> anyhow::Result<ZendeskTicket> {
            Ok(ZendeskTicket {
                id: ticket_id,
                url: None,
                subject: Some("Broken login".into()),
                description: Some("Cannot log in".into()),
                status: TicketStatus::Open,
                requester_id: 100,
                custom_fields: json!([]),
                tags: vec![],
                created_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
                updated_at: None,
            })
        }

        async fn fetch_comments(&self, _ticket_id: i64) -> anyhow::Result<Vec<ZendeskComment>> {
            let comment = |id, author_id, hour| ZendeskComment {
                id,
                author_id,
                body: Some(format!("comment {id}")),
                public: author_id == 100,
                created_at: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
            };
            Ok(vec![comment(1, 100, 9), comment(2, 200, 10), comment(3, 200, 11)])
        }

        async fn fetch_users(&self, user_ids: &[i64]) -> anyhow::Result<Vec<ZendeskUser>> {
            Ok(self
                .users
                .iter()
                .filter(|user| user_ids.contains(&user.id))
                .cloned()
                .collect())
        }
    }

    fn user(id: i64) -> ZendeskUser {
        ZendeskUser {
            id,
            name: Some(format!("user {id}")),
            email: None,
            external_id: Some(format!("ext-{id}")),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn syncs_ticket_comments_and_authors() {
        let service = SyncService::new(Arc::new(StaticZendesk {
            users: vec![user(100), user(200)],
        }));
        let db = DB::in_memory().await.unwrap();

        let remote = service.fetch_ticket(9).await.unwrap();
        assert_eq!(remote.users.len(), 2);

        let mut tx = db.begin().await.unwrap();
        let (ticket, created) = service.sync_ticket(&mut tx, &remote).await.unwrap();
        let comments = db::comments_for_ticket(&mut tx, ticket.id).await.unwrap();
        tx.commit().await.unwrap();

        assert!(created);
        assert_eq!(ticket.zendesk_id, 9);
        assert_eq!(comments.len(), 3);
        assert_ne!(comments[0].author_id, comments[1].author_id);
        assert_eq!(comments[1].author_id, comments[2].author_id);
        assert!(comments[0].public);
        assert!(!comments[1].public);
    }

    #[tokio::test]
    async fn missing_author_fails_the_sync() {
        let service = SyncService::new(Arc::new(StaticZendesk {
            users: vec![user(100)],
        }));
        let db = DB::in_memory().await.unwrap();

        let remote = service.fetch_ticket(9).await.unwrap();
        let mut tx = db.begin().await.unwrap();
        let err = service.sync_ticket(&mut tx, &remote).await.unwrap_err();

        assert!(err.to_string().contains("user 200"), "{err}");
    }
}
