//! In-process notifications emitted after a ticket has been synced.
//!
//! Application code implements [`Receiver`] and connects it to [`Signals`];
//! every processed webhook then produces exactly one [`TicketSignal`].

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::ticket::{Comment, Ticket};

/// Ticket and comment state before and after a sync.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateContext {
    /// `None` when the ticket was not known locally
    pub pre_ticket: Option<Ticket>,
    pub post_ticket: Ticket,
    pub pre_comments: Vec<Comment>,
    pub post_comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// What changed on an already known ticket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Updates {
    pub new_comments: Vec<Comment>,
    pub updated_fields: BTreeMap<String, FieldChange>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum TicketSignal {
    TicketCreated {
        ticket: Ticket,
        context: UpdateContext,
    },
    TicketUpdated {
        ticket: Ticket,
        updates: Updates,
        context: UpdateContext,
    },
}

impl TicketSignal {
    pub fn name(&self) -> &'static str {
        match self {
            TicketSignal::TicketCreated { .. } => "ticket_created",
            TicketSignal::TicketUpdated { .. } => "ticket_updated",
        }
    }

    pub fn ticket(&self) -> &Ticket {
        match self {
            TicketSignal::TicketCreated { ticket, .. } => ticket,
            TicketSignal::TicketUpdated { ticket, .. } => ticket,
        }
    }
}

/// Trait for code reacting to ticket notifications.
///
/// An error aborts processing of the webhook and rolls the sync back.
#[async_trait]
pub trait Receiver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn receive(&self, signal: &TicketSignal) -> anyhow::Result<()>;
}

/// Registry of receivers, called in the order they were connected.
#[derive(Clone, Default)]
pub struct Signals {
    receivers: Vec<Arc<dyn Receiver>>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(mut self, receiver: Arc<dyn Receiver>) -> Self {
        self.receivers.push(receiver);
        self
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    #[tracing::instrument(
        skip_all,
        fields(signal = signal.name(), ticket_id = signal.ticket().zendesk_id)
    )]
    pub async fn send(&self, signal: &TicketSignal) -> anyhow::Result<()> {
        for receiver in &self.receivers {
            debug!("Dispatching to {}", receiver.name());
            receiver
                .receive(signal)
                .await
                .map_err(|e| e.context(format!("receiver {} failed", receiver.name())))?;
        }
        Ok(())
    }
}

/// Logs every notification.
pub struct LogReceiver;

#[async_trait]
impl Receiver for LogReceiver {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn receive(&self, signal: &TicketSignal) -> anyhow::Result<()> {
        match signal {
            TicketSignal::TicketCreated { ticket, context } => {
                info!(
                    ticket_id = ticket.zendesk_id,
                    comments = context.post_comments.len(),
                    "Ticket created: {}",
                    ticket.subject.as_deref().unwrap_or_default()
                );
            }
            TicketSignal::TicketUpdated {
                ticket, updates, ..
            } => {
                let fields: Vec<&str> = updates.updated_fields.keys().map(String::as_str).collect();
                info!(
                    ticket_id = ticket.zendesk_id,
                    new_comments = updates.new_comments.len(),
                    "Ticket updated, changed fields: [{}]",
                    fields.join(", ")
                );
            }
        }
        Ok(())
    }
}
