use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::zendesk::{
    CommentsResponse, TicketResponse, UsersResponse, ZendeskComment, ZendeskTicket, ZendeskUser,
};
use crate::config::ZendeskConfig;

/// Most ids `users/show_many.json` accepts in one request.
const SHOW_MANY_LIMIT: usize = 100;

/// Read access to the Zendesk objects a sync needs.
#[async_trait]
pub trait ZendeskApi: Send + Sync {
    async fn fetch_ticket(&self, ticket_id: i64) -> anyhow::Result<ZendeskTicket>;

    /// All comments of a ticket, across every page.
    async fn fetch_comments(&self, ticket_id: i64) -> anyhow::Result<Vec<ZendeskComment>>;

    async fn fetch_users(&self, user_ids: &[i64]) -> anyhow::Result<Vec<ZendeskUser>>;
}

pub struct ZendeskClient {
    http: Client,
    base_url: String,
    email: String,
    token: String,
}

impl ZendeskClient {
    pub fn new(config: &ZendeskConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config.base_url(),
            email: config.email.clone(),
            token: config.token.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.base_url, path)
    }

    /// Zendesk API tokens authenticate as `{email}/token`.
    fn username(&self) -> String {
        format!("{}/token", self.email)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> anyhow::Result<T> {
        info!("Zendesk Request URL: {}", url);

        let resp = self
            .http
            .get(url)
            .basic_auth(self.username(), Some(&self.token))
            .send()
            .await
            .context("failed to send request to Zendesk API")?;

        let body = error_for_status(resp)
            .await?
            .text()
            .await
            .context("Failed to get response body")?;

        let mut deserializer = serde_json::Deserializer::from_str(&body);
        let parsed = serde_path_to_error::deserialize(&mut deserializer)
            .map_err(|e| anyhow::anyhow!("Failed to parse Zendesk response: {}", e))?;
        Ok(parsed)
    }
}

async fn error_for_status(resp: Response) -> anyhow::Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<unable to read response>".to_string());
    anyhow::bail!("Zendesk API responded with {status} for {url}: {body}")
}

#[async_trait]
impl ZendeskApi for ZendeskClient {
    #[tracing::instrument(skip(self))]
    async fn fetch_ticket(&self, ticket_id: i64) -> anyhow::Result<ZendeskTicket> {
        let url = self.url(&format!("tickets/{ticket_id}.json"));
        let resp: TicketResponse = self.get(&url).await?;
        Ok(resp.ticket)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_comments(&self, ticket_id: i64) -> anyhow::Result<Vec<ZendeskComment>> {
        let mut comments = Vec::new();
        let mut next = Some(self.url(&format!("tickets/{ticket_id}/comments.json")));
        while let Some(url) = next {
            let page: CommentsResponse = self.get(&url).await?;
            debug!("Received {} comments", page.comments.len());
            comments.extend(page.comments);
            next = page.next_page;
        }
        Ok(comments)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_users(&self, user_ids: &[i64]) -> anyhow::Result<Vec<ZendeskUser>> {
        let mut users = Vec::with_capacity(user_ids.len());
        for chunk in user_ids.chunks(SHOW_MANY_LIMIT) {
            let ids: Vec<String> = chunk.iter().map(|id| id.to_string()).collect();
            let url = self.url(&format!("users/show_many.json?ids={}", ids.join(",")));
            let resp: UsersResponse = self.get(&url).await?;
            users.extend(resp.users);
        }
        Ok(users)
    }
}
