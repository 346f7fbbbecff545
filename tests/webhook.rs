use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use tower::ServiceExt; // not axum::ServiceExt

use zengo::models::db::DB;
use zengo::models::ticket::TicketStatus;
use zengo::models::zendesk::{ZendeskComment, ZendeskTicket, ZendeskUser};
use zengo::models::zendesk_api::ZendeskApi;
use zengo::processor::Processor;
use zengo::server::{AppState, router};
use zengo::service::SyncService;
use zengo::signals::{Receiver, Signals, TicketSignal};

const SECRET: &str = "hunter2";
const PATH: &str = "/zengo/webhook/";

// ---------------------------
// Fake Zendesk
// ---------------------------

#[derive(Default)]
struct FakeZendesk {
    tickets: Mutex<HashMap<i64, ZendeskTicket>>,
    comments: Mutex<HashMap<i64, Vec<ZendeskComment>>>,
}

impl FakeZendesk {
    fn put_ticket(&self, id: i64, status: TicketStatus, subject: &str) {
        let ticket = ZendeskTicket {
            id,
            url: Some(format!("https://acme.zendesk.com/api/v2/tickets/{id}.json")),
            subject: Some(subject.to_string()),
            description: Some("first message".to_string()),
            status,
            requester_id: 1,
            custom_fields: json!([]),
            tags: vec![],
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            updated_at: None,
        };
        self.tickets.lock().unwrap().insert(id, ticket);
    }

    fn add_comment(&self, ticket_id: i64, comment_id: i64, author_id: i64) {
        let comment = ZendeskComment {
            id: comment_id,
            author_id,
            body: Some(format!("comment {comment_id}")),
            public: true,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, comment_id as u32).unwrap(),
        };
        self.comments
            .lock()
            .unwrap()
            .entry(ticket_id)
            .or_default()
            .push(comment);
    }
}

#[async_trait]
impl ZendeskApi for FakeZendesk {
    async fn fetch_ticket(&self, ticket_id: i64) -> anyhow::Result<ZendeskTicket> {
        self.tickets
            .lock()
            .unwrap()
            .get(&ticket_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Zendesk API responded with 404 Not Found"))
    }

    async fn fetch_comments(&self, ticket_id: i64) -> anyhow::Result<Vec<ZendeskComment>> {
        Ok(self
            .comments
            .lock()
            .unwrap()
            .get(&ticket_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_users(&self, user_ids: &[i64]) -> anyhow::Result<Vec<ZendeskUser>> {
        Ok(user_ids
            .iter()
            .map(|&id| ZendeskUser {
                id,
                name: Some(format!("user {id}")),
                email: Some(format!("user{id}@example.com")),
                external_id: None,
                created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            })
            .collect())
    }
}

// ---------------------------
// Recording receiver
// ---------------------------

#[derive(Default)]
struct Recorder {
    signals: Mutex<Vec<TicketSignal>>,
    fail: AtomicBool,
}

impl Recorder {
    fn names(&self) -> Vec<&'static str> {
        self.signals.lock().unwrap().iter().map(|s| s.name()).collect()
    }

    fn last(&self) -> TicketSignal {
        self.signals.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Receiver for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn receive(&self, signal: &TicketSignal) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("receiver exploded");
        }
        self.signals.lock().unwrap().push(signal.clone());
        Ok(())
    }
}

// ---------------------------
// Shared setup
// ---------------------------

struct TestCtx {
    app: Router,
    db: DB,
    zendesk: Arc<FakeZendesk>,
    recorder: Arc<Recorder>,
}

async fn setup() -> TestCtx {
    let db = DB::in_memory().await.unwrap();
    let zendesk = Arc::new(FakeZendesk::default());
    let recorder = Arc::new(Recorder::default());

    let service = SyncService::new(zendesk.clone());
    let signals = Signals::new().connect(recorder.clone());
    let processor = Processor::new(db.clone(), service, signals);
    let app = router(
        AppState {
            processor,
            secret: SECRET.to_string(),
        },
        PATH,
    );

    TestCtx {
        app,
        db,
        zendesk,
        recorder,
    }
}

async fn post(app: &Router, uri: &str, body: String) -> StatusCode {
    app.clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .method("POST")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
}

async fn deliver(app: &Router, ticket_id: i64) -> StatusCode {
    post(
        app,
        &format!("{PATH}?secret={SECRET}"),
        json!({ "id": ticket_id.to_string() }).to_string(),
    )
    .await
}

// ---------------------------
// Tests
// ---------------------------

#[tokio::test]
async fn rejects_wrong_or_missing_secret() {
    let ctx = setup().await;
    ctx.zendesk.put_ticket(1, TicketStatus::New, "Hello");

    let body = json!({ "id": 1 }).to_string();
    assert_eq!(post(&ctx.app, PATH, body.clone()).await, StatusCode::FORBIDDEN);
    assert_eq!(
        post(&ctx.app, &format!("{PATH}?secret=wrong"), body).await,
        StatusCode::FORBIDDEN
    );

    assert_eq!(ctx.db.count_events().await.unwrap(), 0);
    assert_eq!(ctx.db.count_tickets().await.unwrap(), 0);
    assert!(ctx.recorder.names().is_empty());
}

#[tokio::test]
async fn new_ticket_fires_created_once() {
    let ctx = setup().await;
    ctx.zendesk.put_ticket(10, TicketStatus::New, "Printer on fire");
    ctx.zendesk.add_comment(10, 1, 1);

    assert_eq!(deliver(&ctx.app, 10).await, StatusCode::OK);

    let ticket = ctx.db.ticket(10).await.unwrap().unwrap();
    assert_eq!(ticket.subject.as_deref(), Some("Printer on fire"));
    assert_eq!(ctx.recorder.names(), vec!["ticket_created"]);
    match ctx.recorder.last() {
        TicketSignal::TicketCreated { ticket, context } => {
            assert_eq!(ticket.zendesk_id, 10);
            assert!(context.pre_ticket.is_none());
            assert_eq!(context.post_comments.len(), 1);
        }
        other => panic!("unexpected signal {}", other.name()),
    }
}

#[tokio::test]
async fn new_comments_fire_updated_with_only_those_comments() {
    let ctx = setup().await;
    ctx.zendesk.put_ticket(20, TicketStatus::Open, "Login broken");
    ctx.zendesk.add_comment(20, 1, 1);
    assert_eq!(deliver(&ctx.app, 20).await, StatusCode::OK);

    ctx.zendesk.add_comment(20, 2, 7);
    ctx.zendesk.add_comment(20, 3, 1);
    ctx.zendesk.put_ticket(20, TicketStatus::Pending, "Login broken");
    assert_eq!(deliver(&ctx.app, 20).await, StatusCode::OK);

    assert_eq!(ctx.recorder.names(), vec!["ticket_created", "ticket_updated"]);
    match ctx.recorder.last() {
        TicketSignal::TicketUpdated {
            updates, context, ..
        } => {
            let ids: Vec<i64> = updates.new_comments.iter().map(|c| c.zendesk_id).collect();
            assert_eq!(ids, vec![2, 3]);
            assert_eq!(context.pre_comments.len(), 1);
            assert_eq!(context.post_comments.len(), 3);
            assert_eq!(updates.updated_fields.len(), 1);
            assert_eq!(updates.updated_fields["status"].old, json!("open"));
            assert_eq!(updates.updated_fields["status"].new, json!("pending"));
        }
        other => panic!("unexpected signal {}", other.name()),
    }
}

#[tokio::test]
async fn redelivery_is_idempotent() {
    let ctx = setup().await;
    ctx.zendesk.put_ticket(30, TicketStatus::Open, "Refund");
    ctx.zendesk.add_comment(30, 1, 1);
    ctx.zendesk.add_comment(30, 2, 5);

    assert_eq!(deliver(&ctx.app, 30).await, StatusCode::OK);
    assert_eq!(deliver(&ctx.app, 30).await, StatusCode::OK);

    assert_eq!(ctx.db.count_tickets().await.unwrap(), 1);
    assert_eq!(ctx.db.count_comments().await.unwrap(), 2);
    assert_eq!(ctx.recorder.names(), vec!["ticket_created", "ticket_updated"]);
    match ctx.recorder.last() {
        TicketSignal::TicketUpdated { updates, .. } => {
            assert!(updates.new_comments.is_empty());
            assert!(updates.updated_fields.is_empty());
        }
        other => panic!("unexpected signal {}", other.name()),
    }
}

#[tokio::test]
async fn invalid_payloads_are_rejected_and_stored() {
    let ctx = setup().await;
    let uri = format!("{PATH}?secret={SECRET}");

    assert_eq!(post(&ctx.app, &uri, "not json".into()).await, StatusCode::BAD_REQUEST);
    assert_eq!(
        post(&ctx.app, &uri, json!({ "ticket": 1 }).to_string()).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        post(&ctx.app, &uri, "x".repeat(2000)).await,
        StatusCode::PAYLOAD_TOO_LARGE
    );

    // oversized bodies are never stored
    assert_eq!(ctx.db.count_events().await.unwrap(), 2);
    let event = ctx.db.event(2).await.unwrap().unwrap();
    assert_eq!(event.error.as_deref(), Some("`id` not found in data"));
}

#[tokio::test]
async fn unknown_ticket_surfaces_api_failure() {
    let ctx = setup().await;

    assert_eq!(deliver(&ctx.app, 404).await, StatusCode::INTERNAL_SERVER_ERROR);

    let event = ctx.db.event(1).await.unwrap().unwrap();
    assert_eq!(event.remote_ticket_id, Some(404));
    assert!(event.error.unwrap().contains("404"));
    assert!(event.ticket_id.is_none());
}

#[tokio::test]
async fn failing_receiver_rolls_back_the_sync() {
    let ctx = setup().await;
    ctx.zendesk.put_ticket(40, TicketStatus::New, "Crash");
    ctx.recorder.fail.store(true, Ordering::SeqCst);

    assert_eq!(deliver(&ctx.app, 40).await, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(ctx.db.ticket(40).await.unwrap().is_none());
    let event = ctx.db.event(1).await.unwrap().unwrap();
    assert!(event.error.unwrap().contains("receiver exploded"));

    ctx.recorder.fail.store(false, Ordering::SeqCst);
    assert_eq!(deliver(&ctx.app, 40).await, StatusCode::OK);
    assert_eq!(ctx.recorder.names(), vec!["ticket_created"]);

    let event = ctx.db.event(2).await.unwrap().unwrap();
    let ticket = ctx.db.ticket(40).await.unwrap().unwrap();
    assert_eq!(event.ticket_id, Some(ticket.id));
    assert!(event.error.is_none());
}

// ---------------------------
// File-backed store
// ---------------------------

/// Holds every sync transaction open for a while.
struct SlowReceiver;

#[async_trait]
impl Receiver for SlowReceiver {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn receive(&self, _signal: &TicketSignal) -> anyhow::Result<()> {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_deliveries_both_sync() {
    let dir = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite://{}", dir.path().join("zengo.db").display());
    let db = DB::new(&db_url).await.unwrap();

    let zendesk = Arc::new(FakeZendesk::default());
    zendesk.put_ticket(1, TicketStatus::New, "First");
    zendesk.put_ticket(2, TicketStatus::Open, "Second");
    zendesk.add_comment(2, 1, 3);

    let signals = Signals::new().connect(Arc::new(SlowReceiver));
    let processor = Processor::new(db.clone(), SyncService::new(zendesk), signals);

    let (first, second) = tokio::join!(
        processor.handle(r#"{"id": 1}"#),
        processor.handle(r#"{"id": 2}"#)
    );

    assert_eq!(first.unwrap().name(), "ticket_created");
    assert_eq!(second.unwrap().name(), "ticket_created");
    assert_eq!(db.count_tickets().await.unwrap(), 2);
    assert_eq!(db.count_comments().await.unwrap(), 1);
    for event_id in [1, 2] {
        let event = db.event(event_id).await.unwrap().unwrap();
        assert!(event.error.is_none());
        assert!(event.ticket_id.is_some());
    }
}
