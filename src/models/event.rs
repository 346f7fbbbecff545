use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Raw bodies above this size are refused before they are stored.
pub const MAX_RAW_DATA_LEN: usize = 1024;

/// One webhook delivery, kept for auditing and to record processing errors.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Event {
    pub id: i64,
    pub raw_data: String,
    /// Ticket id parsed from `raw_data`, once validated
    pub remote_ticket_id: Option<i64>,
    /// Set when processing failed
    pub error: Option<String>,
    /// Local ticket the delivery synced, once processed
    pub ticket_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.raw_data)
    }
}
