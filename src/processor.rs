use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{error, info};

use crate::error::{WebhookError, WebhookResult};
use crate::models::db::{self, DB};
use crate::models::event::{Event, MAX_RAW_DATA_LEN};
use crate::models::ticket::Comment;
use crate::service::SyncService;
use crate::signals::{FieldChange, Signals, TicketSignal, UpdateContext, Updates};

/// Ticket fields that are not worth reporting as changes.
const IGNORED_FIELDS: [&str; 3] = ["id", "created_at", "updated_at"];

/// Stores webhook deliveries and turns them into ticket notifications.
#[derive(Clone)]
pub struct Processor {
    db: DB,
    service: SyncService,
    signals: Signals,
}

impl Processor {
    pub fn new(db: DB, service: SyncService, signals: Signals) -> Self {
        Self {
            db,
            service,
            signals,
        }
    }

    /// Stores and processes one webhook body.
    pub async fn handle(&self, raw_data: &str) -> WebhookResult<TicketSignal> {
        let event = self.store_event(raw_data).await?;
        Ok(self.process_event_and_record_errors(&event).await?)
    }

    /// Syncs a ticket as if Zendesk had sent a webhook for it.
    pub async fn sync_ticket_id(&self, ticket_id: i64) -> WebhookResult<TicketSignal> {
        self.handle(&serde_json::json!({ "id": ticket_id }).to_string())
            .await
    }

    /// Persists the raw body, then checks that it names a ticket.
    pub async fn store_event(&self, raw_data: &str) -> WebhookResult<Event> {
        if raw_data.len() > MAX_RAW_DATA_LEN {
            return Err(WebhookError::TooLarge {
                size: raw_data.len(),
                limit: MAX_RAW_DATA_LEN,
            });
        }
        let event = self.db.create_event(raw_data).await?;

        let ticket_id = match event.json() {
            Ok(data) => parse_ticket_id(&data),
            Err(e) => Err(e.to_string()),
        };
        match ticket_id {
            Ok(ticket_id) => Ok(self
                .db
                .set_event_remote_ticket_id(event.id, ticket_id)
                .await?),
            Err(reason) => {
                self.db.set_event_error(event.id, &reason).await?;
                Err(WebhookError::Invalid(reason))
            }
        }
    }

    /// Runs [`Processor::process_event`] and writes any failure onto the event.
    pub async fn process_event_and_record_errors(
        &self,
        event: &Event,
    ) -> anyhow::Result<TicketSignal> {
        match self.process_event(event).await {
            Ok(signal) => Ok(signal),
            Err(err) => {
                error!("Failed to process event {}: {:#}", event.id, err);
                let message = format!("{err:#}");
                if let Err(record_err) = self.db.set_event_error(event.id, &message).await {
                    error!("Failed to record error on event {}: {:#}", event.id, record_err);
                }
                Err(err)
            }
        }
    }

    /// Fetches the ticket, syncs it and dispatches the matching signal.
    ///
    /// Everything written here is rolled back if a step, receivers included,
    /// fails.
    #[tracing::instrument(skip_all, fields(event_id = event.id, ticket_id))]
    pub async fn process_event(&self, event: &Event) -> anyhow::Result<TicketSignal> {
        let ticket_id = event
            .remote_ticket_id
            .ok_or_else(|| anyhow::anyhow!("event {} has no ticket id", event.id))?;
        tracing::Span::current().record("ticket_id", ticket_id);

        // network I/O before the transaction opens
        let remote = self.service.fetch_ticket(ticket_id).await?;

        let mut tx = self.db.begin().await?;

        let pre_ticket = db::find_ticket(&mut tx, ticket_id).await?;
        let pre_comments = match &pre_ticket {
            Some(ticket) => db::comments_for_ticket(&mut tx, ticket.id).await?,
            None => Vec::new(),
        };

        let (post_ticket, created) = self.service.sync_ticket(&mut tx, &remote).await?;
        let post_comments = db::comments_for_ticket(&mut tx, post_ticket.id).await?;
        db::set_event_ticket(&mut tx, event.id, &post_ticket).await?;

        let context = UpdateContext {
            pre_ticket,
            post_ticket: post_ticket.clone(),
            pre_comments,
            post_comments,
        };

        let signal = if created {
            TicketSignal::TicketCreated {
                ticket: post_ticket,
                context,
            }
        } else {
            TicketSignal::TicketUpdated {
                ticket: post_ticket,
                updates: get_updates(&context),
                context,
            }
        };

        self.signals.send(&signal).await?;
        tx.commit().await?;

        info!("Processed event {} as {}", event.id, signal.name());
        Ok(signal)
    }
}

/// Accepts `{"id": 123}` as well as `{"id": "123"}`, the form Zendesk's
/// `{{ticket.id}}` placeholder produces.
fn parse_ticket_id(data: &Value) -> Result<i64, String> {
    let id = data
        .get("id")
        .ok_or_else(|| "`id` not found in data".to_string())?;
    let parsed = match id {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(id) if id > 0 => Ok(id),
        _ => Err(format!("`id` is not a ticket id: {id}")),
    }
}

pub fn get_updates(context: &UpdateContext) -> Updates {
    Updates {
        new_comments: get_new_comments(context),
        updated_fields: get_updated_fields(context),
    }
}

/// Comments present after the sync whose Zendesk id was not stored before.
pub fn get_new_comments(context: &UpdateContext) -> Vec<Comment> {
    let known: HashSet<i64> = context.pre_comments.iter().map(|c| c.zendesk_id).collect();
    context
        .post_comments
        .iter()
        .filter(|c| !known.contains(&c.zendesk_id))
        .cloned()
        .collect()
}

pub fn get_updated_fields(context: &UpdateContext) -> BTreeMap<String, FieldChange> {
    let mut updates = BTreeMap::new();
    let Some(pre_ticket) = &context.pre_ticket else {
        return updates;
    };

    let (Ok(Value::Object(pre)), Ok(Value::Object(post))) = (
        serde_json::to_value(pre_ticket),
        serde_json::to_value(&context.post_ticket),
    ) else {
        return updates;
    };

    for (field, old) in pre {
        if IGNORED_FIELDS.contains(&field.as_str()) {
            continue;
        }
        let new = post.get(&field).cloned().unwrap_or(Value::Null);
        if old != new {
            updates.insert(field, FieldChange { old, new });
        }
    }
    updates
}
