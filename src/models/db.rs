use anyhow::Context;
use chrono::Utc;
use sqlx::{
    Pool, Sqlite, SqliteConnection, Transaction,
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use super::event::Event;
use super::ticket::{Comment, Ticket, User};
use super::zendesk::{ZendeskComment, ZendeskTicket, ZendeskUser};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS zendesk_users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        zendesk_id INTEGER NOT NULL UNIQUE,
        name TEXT,
        email TEXT,
        external_id TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tickets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        zendesk_id INTEGER NOT NULL UNIQUE,
        requester_id INTEGER NOT NULL REFERENCES zendesk_users(id),
        subject TEXT,
        description TEXT,
        url TEXT,
        status TEXT NOT NULL,
        custom_fields TEXT,
        tags TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS comments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        zendesk_id INTEGER NOT NULL,
        ticket_id INTEGER NOT NULL REFERENCES tickets(id),
        author_id INTEGER NOT NULL REFERENCES zendesk_users(id),
        body TEXT,
        public BOOLEAN NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (ticket_id, zendesk_id)
    )",
    "CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        raw_data TEXT NOT NULL,
        remote_ticket_id INTEGER,
        error TEXT,
        ticket_id INTEGER REFERENCES tickets(id),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
];

/// How long a connection waits for another process holding the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite store. Writes from this process are serialised through
/// `write_lock` so a sync transaction never has to upgrade a read snapshot
/// while another writer is active.
#[derive(Clone)]
pub struct DB {
    conn: Pool<Sqlite>,
    write_lock: Arc<Mutex<()>>,
}

/// Write transaction that holds the store's writer lock until it is
/// committed or dropped (rolled back).
pub struct WriteTx {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl WriteTx {
    pub async fn commit(self) -> anyhow::Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl Deref for WriteTx {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.tx
    }
}

impl DerefMut for WriteTx {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

impl DB {
    pub async fn new(db_path: &str) -> anyhow::Result<Self> {
        Self::create_db(db_path).await?;
        let options = SqliteConnectOptions::from_str(db_path)
            .with_context(|| format!("invalid database url {db_path}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let conn = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database {db_path}"))?;
        Self::with_pool(conn).await
    }

    /// Private database on a single connection, gone once dropped.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let conn = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(conn).await
    }

    async fn with_pool(conn: Pool<Sqlite>) -> anyhow::Result<Self> {
        let db = Self {
            conn,
            write_lock: Arc::new(Mutex::new(())),
        };
        db.create_tables().await?;
        Ok(db)
    }

    async fn create_db(path: &str) -> anyhow::Result<()> {
        if !Sqlite::database_exists(path).await.unwrap_or(false) {
            info!("Creating database {}", path);
            Sqlite::create_database(path)
                .await
                .with_context(|| format!("failed to create database {path}"))?;
        } else {
            debug!("Database {} already exists", path);
        }
        Ok(())
    }

    async fn create_tables(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.conn).await?;
        }
        info!("Found {} synced tickets", self.count_tickets().await?);
        Ok(())
    }

    /// Waits for the writer lock, then opens a transaction.
    pub async fn begin(&self) -> anyhow::Result<WriteTx> {
        let guard = self.write_lock.clone().lock_owned().await;
        let tx = self.conn.begin().await?;
        Ok(WriteTx { tx, _guard: guard })
    }

    pub async fn count_tickets(&self) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tickets")
            .fetch_one(&self.conn)
            .await?;
        Ok(count)
    }

    pub async fn count_comments(&self) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments")
            .fetch_one(&self.conn)
            .await?;
        Ok(count)
    }

    pub async fn count_events(&self) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.conn)
            .await?;
        Ok(count)
    }

    pub async fn ticket(&self, zendesk_id: i64) -> anyhow::Result<Option<Ticket>> {
        let mut conn = self.conn.acquire().await?;
        find_ticket(&mut conn, zendesk_id).await
    }

    pub async fn create_event(&self, raw_data: &str) -> anyhow::Result<Event> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let event = sqlx::query_as::<_, Event>(
            "INSERT INTO events (raw_data, created_at, updated_at) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(raw_data)
        .bind(now)
        .bind(now)
        .fetch_one(&self.conn)
        .await?;
        debug!("Stored event {}", event.id);
        Ok(event)
    }

    pub async fn set_event_remote_ticket_id(
        &self,
        event_id: i64,
        remote_ticket_id: i64,
    ) -> anyhow::Result<Event> {
        let _guard = self.write_lock.lock().await;
        let event = sqlx::query_as::<_, Event>(
            "UPDATE events SET remote_ticket_id = ?, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(remote_ticket_id)
        .bind(Utc::now())
        .bind(event_id)
        .fetch_one(&self.conn)
        .await?;
        Ok(event)
    }

    pub async fn set_event_error(&self, event_id: i64, error: &str) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE events SET error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now())
            .bind(event_id)
            .execute(&self.conn)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("event {event_id} not found");
        }
        Ok(())
    }

    pub async fn event(&self, event_id: i64) -> anyhow::Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = ?")
            .bind(event_id)
            .fetch_optional(&self.conn)
            .await?;
        Ok(event)
    }
}

pub async fn find_ticket(
    conn: &mut SqliteConnection,
    zendesk_id: i64,
) -> anyhow::Result<Option<Ticket>> {
    let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE zendesk_id = ?")
        .bind(zendesk_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(ticket)
}

/// Comments of a ticket, oldest first.
pub async fn comments_for_ticket(
    conn: &mut SqliteConnection,
    ticket_id: i64,
) -> anyhow::Result<Vec<Comment>> {
    let comments = sqlx::query_as::<_, Comment>(
        "SELECT * FROM comments WHERE ticket_id = ? ORDER BY created_at, id",
    )
    .bind(ticket_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(comments)
}

pub async fn upsert_user(
    conn: &mut SqliteConnection,
    user: &ZendeskUser,
) -> anyhow::Result<User> {
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO zendesk_users (zendesk_id, name, email, external_id, created_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (zendesk_id) DO UPDATE SET
            name = excluded.name,
            email = excluded.email,
            external_id = excluded.external_id,
            created_at = excluded.created_at
         RETURNING *",
    )
    .bind(user.id)
    .bind(&user.name)
    .bind(&user.email)
    .bind(&user.external_id)
    .bind(user.created_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(user)
}

/// Inserts or updates the ticket; the flag is `true` when it was inserted.
pub async fn upsert_ticket(
    conn: &mut SqliteConnection,
    ticket: &ZendeskTicket,
    requester: &User,
) -> anyhow::Result<(Ticket, bool)> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM tickets WHERE zendesk_id = ?")
        .bind(ticket.id)
        .fetch_optional(&mut *conn)
        .await?;

    let custom_fields = serde_json::to_string(&ticket.custom_fields)?;
    let tags = serde_json::to_string(&ticket.tags)?;

    let query = match existing {
        Some(_) => {
            "UPDATE tickets SET
                requester_id = ?, subject = ?, description = ?, url = ?, status = ?,
                custom_fields = ?, tags = ?, created_at = ?, updated_at = ?
             WHERE zendesk_id = ?
             RETURNING *"
        }
        None => {
            "INSERT INTO tickets
                (requester_id, subject, description, url, status,
                 custom_fields, tags, created_at, updated_at, zendesk_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *"
        }
    };

    let local = sqlx::query_as::<_, Ticket>(query)
        .bind(requester.id)
        .bind(&ticket.subject)
        .bind(&ticket.description)
        .bind(&ticket.url)
        .bind(ticket.status)
        .bind(custom_fields)
        .bind(tags)
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .bind(ticket.id)
        .fetch_one(&mut *conn)
        .await?;

    Ok((local, existing.is_none()))
}

pub async fn upsert_comment(
    conn: &mut SqliteConnection,
    ticket: &Ticket,
    author: &User,
    comment: &ZendeskComment,
) -> anyhow::Result<Comment> {
    let comment = sqlx::query_as::<_, Comment>(
        "INSERT INTO comments (zendesk_id, ticket_id, author_id, body, public, created_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (ticket_id, zendesk_id) DO UPDATE SET
            author_id = excluded.author_id,
            body = excluded.body,
            public = excluded.public,
            created_at = excluded.created_at
         RETURNING *",
    )
    .bind(comment.id)
    .bind(ticket.id)
    .bind(author.id)
    .bind(&comment.body)
    .bind(comment.public)
    .bind(comment.created_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(comment)
}

pub async fn set_event_ticket(
    conn: &mut SqliteConnection,
    event_id: i64,
    ticket: &Ticket,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE events SET ticket_id = ?, error = NULL, updated_at = ? WHERE id = ?")
        .bind(ticket.id)
        .bind(Utc::now())
        .bind(event_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
