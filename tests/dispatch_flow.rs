use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use campaign_dispatch::campaign::{self, DispatchOutcome};
use campaign_dispatch::db::{self, delivery, queue};
use campaign_dispatch::mailer::{Mailer, TransportError};
use campaign_dispatch::model::{CampaignStatus, DeliveryStatus, DispatchTask};
use campaign_dispatch::render::RenderedMessage;
use campaign_dispatch::scheduler;
use campaign_dispatch::worker::{self, WorkerOptions};

/// Test transport: records every accepted message and rejects a configurable
/// set of addresses.
#[derive(Default)]
struct FakeMailer {
    delivered: Mutex<HashMap<String, usize>>,
    reject: Mutex<Vec<String>>,
}

impl FakeMailer {
    fn rejecting(addresses: &[&str]) -> Self {
        Self {
            reject: Mutex::new(addresses.iter().map(|a| a.to_string()).collect()),
            ..Default::default()
        }
    }

    fn accept_all(&self) {
        self.reject.lock().unwrap().clear();
    }

    fn deliveries_to(&self, address: &str) -> usize {
        self.delivered.lock().unwrap().get(address).copied().unwrap_or(0)
    }

    fn total(&self) -> usize {
        self.delivered.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, message: &RenderedMessage) -> Result<(), TransportError> {
        // yield so concurrent workers interleave
        tokio::task::yield_now().await;
        if self.reject.lock().unwrap().contains(&message.to) {
            return Err(TransportError::Rejected(format!(
                "550 5.1.1 <{}>: mailbox unavailable",
                message.to
            )));
        }
        *self
            .delivered
            .lock()
            .unwrap()
            .entry(message.to.clone())
            .or_default() += 1;
        Ok(())
    }
}

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn opts() -> WorkerOptions {
    WorkerOptions {
        unsubscribe_base_url: Some("https://mail.example.com/unsubscribe".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn three_recipients_one_rejected() {
    let pool = setup_pool().await;
    let uid = db::get_or_create_user(&pool, "Owner", "owner@example.com")
        .await
        .unwrap();
    for (email, name) in [
        ("a@example.com", "A"),
        ("b@example.com", "B"),
        ("c@example.com", "C"),
    ] {
        db::create_subscriber(&pool, uid, email, name).await.unwrap();
    }
    let cid = db::create_campaign(&pool, uid, "launch", "News for {{name}}", "Hi {{name}}")
        .await
        .unwrap();

    let outcome = campaign::send_now(&pool, cid).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Enqueued { recipients: 3 });

    let mailer = Arc::new(FakeMailer::rejecting(&["b@example.com"]));
    worker::drain(&pool, mailer.clone(), &opts(), 1).await.unwrap();

    let c = db::get_campaign(&pool, cid).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Failed);
    assert_eq!((c.total_recipients, c.sent_count, c.failed_count), (3, 2, 1));
    assert_eq!(c.progress_percent(), 100);

    let failed = delivery::list_failed(&pool, cid).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().unwrap().contains("mailbox unavailable"));
    assert_eq!(mailer.total(), 2);
}

#[tokio::test]
async fn retry_resends_only_failed_recipients() {
    let pool = setup_pool().await;
    let uid = db::get_or_create_user(&pool, "Owner", "owner@example.com")
        .await
        .unwrap();
    db::create_subscriber(&pool, uid, "a@example.com", "A").await.unwrap();
    db::create_subscriber(&pool, uid, "b@example.com", "B").await.unwrap();
    let cid = db::create_campaign(&pool, uid, "c", "s", "b").await.unwrap();
    campaign::send_now(&pool, cid).await.unwrap();

    let mailer = Arc::new(FakeMailer::rejecting(&["b@example.com"]));
    worker::drain(&pool, mailer.clone(), &opts(), 1).await.unwrap();
    assert_eq!(
        db::get_campaign(&pool, cid).await.unwrap().unwrap().status,
        CampaignStatus::Failed
    );

    mailer.accept_all();
    let outcome = campaign::retry_failed(&pool, cid).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Enqueued { recipients: 1 });
    worker::drain(&pool, mailer.clone(), &opts(), 1).await.unwrap();

    let c = db::get_campaign(&pool, cid).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Sent);
    assert_eq!((c.sent_count, c.failed_count), (2, 0));
    assert_eq!(mailer.deliveries_to("a@example.com"), 1);
    assert_eq!(mailer.deliveries_to("b@example.com"), 1);
    assert!(delivery::list_failed(&pool, cid).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_tasks_deliver_once() {
    let pool = setup_pool().await;
    let uid = db::get_or_create_user(&pool, "Owner", "owner@example.com")
        .await
        .unwrap();
    let a = db::create_subscriber(&pool, uid, "a@example.com", "A").await.unwrap();
    let cid = db::create_campaign(&pool, uid, "c", "s", "b").await.unwrap();
    campaign::send_now(&pool, cid).await.unwrap();

    let task = DispatchTask {
        campaign_id: cid,
        subscriber_id: a.id,
    };
    queue::enqueue(&pool, &task, Utc::now()).await.unwrap();
    queue::enqueue(&pool, &task, Utc::now()).await.unwrap();

    let mailer = Arc::new(FakeMailer::default());
    worker::drain(&pool, mailer.clone(), &opts(), 1).await.unwrap();

    assert_eq!(mailer.deliveries_to("a@example.com"), 1);
    let c = db::get_campaign(&pool, cid).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Sent);
    assert_eq!(c.sent_count, 1);
    assert_eq!(queue::count_pending(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn unsubscribed_before_send_is_excluded() {
    let pool = setup_pool().await;
    let uid = db::get_or_create_user(&pool, "Owner", "owner@example.com")
        .await
        .unwrap();
    db::create_subscriber(&pool, uid, "a@example.com", "A").await.unwrap();
    let quit = db::create_subscriber(&pool, uid, "quit@example.com", "Q").await.unwrap();
    db::unsubscribe_by_token(&pool, &quit.unsubscribe_token, Utc::now())
        .await
        .unwrap();
    let cid = db::create_campaign(&pool, uid, "c", "s", "b").await.unwrap();

    let outcome = campaign::send_now(&pool, cid).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Enqueued { recipients: 1 });

    let mailer = Arc::new(FakeMailer::default());
    worker::drain(&pool, mailer.clone(), &opts(), 1).await.unwrap();
    assert_eq!(mailer.deliveries_to("quit@example.com"), 0);
    assert!(delivery::find(&pool, cid, quit.id).await.unwrap().is_none());
}

#[tokio::test]
async fn unsubscribe_mid_send_still_completes() {
    let pool = setup_pool().await;
    let uid = db::get_or_create_user(&pool, "Owner", "owner@example.com")
        .await
        .unwrap();
    db::create_subscriber(&pool, uid, "a@example.com", "A").await.unwrap();
    let late = db::create_subscriber(&pool, uid, "late@example.com", "L").await.unwrap();
    let cid = db::create_campaign(&pool, uid, "c", "s", "b").await.unwrap();
    campaign::send_now(&pool, cid).await.unwrap();

    db::unsubscribe_subscriber(&pool, uid, late.id, Utc::now())
        .await
        .unwrap();
    let mailer = Arc::new(FakeMailer::default());
    worker::drain(&pool, mailer.clone(), &opts(), 1).await.unwrap();

    let c = db::get_campaign(&pool, cid).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Sent);
    assert_eq!((c.total_recipients, c.sent_count), (1, 1));
    let rec = delivery::find(&pool, cid, late.id).await.unwrap().unwrap();
    assert_eq!(rec.status, DeliveryStatus::Skipped);
}

#[tokio::test]
async fn scheduled_campaign_runs_end_to_end() {
    let pool = setup_pool().await;
    let uid = db::get_or_create_user(&pool, "Owner", "owner@example.com")
        .await
        .unwrap();
    db::create_subscriber(&pool, uid, "a@example.com", "A").await.unwrap();
    let cid = db::create_campaign(&pool, uid, "c", "s", "Bye: {{unsubscribe_url}}")
        .await
        .unwrap();
    campaign::schedule(&pool, cid, Utc::now() - ChronoDuration::seconds(5))
        .await
        .unwrap();

    let report = scheduler::dispatch_scheduled_campaigns(&pool, 10).await.unwrap();
    assert_eq!(report.claimed, 1);

    let mailer = Arc::new(FakeMailer::default());
    worker::drain(&pool, mailer.clone(), &opts(), 1).await.unwrap();

    let c = db::get_campaign(&pool, cid).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Sent);
    assert!(c.sent_at.is_some());
    assert_eq!(mailer.total(), 1);
}

#[tokio::test]
async fn concurrent_workers_converge() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/campaigns.db", dir.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();

    let uid = db::get_or_create_user(&pool, "Owner", "owner@example.com")
        .await
        .unwrap();
    let mut subscribers = Vec::new();
    for i in 0..24 {
        let sub = db::create_subscriber(&pool, uid, &format!("user{i}@example.com"), &format!("User {i}"))
            .await
            .unwrap();
        subscribers.push(sub);
    }
    let cid = db::create_campaign(&pool, uid, "c", "s", "b").await.unwrap();
    campaign::send_now(&pool, cid).await.unwrap();

    // at-least-once delivery: every task shows up twice
    for sub in &subscribers {
        let task = DispatchTask {
            campaign_id: cid,
            subscriber_id: sub.id,
        };
        queue::enqueue(&pool, &task, Utc::now()).await.unwrap();
    }

    let mailer = Arc::new(FakeMailer::rejecting(&["user3@example.com", "user17@example.com"]));
    let options = WorkerOptions {
        send_timeout: Duration::from_secs(5),
        ..opts()
    };
    worker::drain(&pool, mailer.clone(), &options, 6).await.unwrap();

    let c = db::get_campaign(&pool, cid).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Failed);
    assert_eq!((c.total_recipients, c.sent_count, c.failed_count), (24, 22, 2));
    assert_eq!(mailer.total(), 22);
    for sub in &subscribers {
        assert!(mailer.deliveries_to(&sub.email) <= 1);
    }
    let records = delivery::list_for_campaign(&pool, cid).await.unwrap();
    assert_eq!(records.len(), 24);
    assert_eq!(queue::count_pending(&pool).await.unwrap(), 0);
}
