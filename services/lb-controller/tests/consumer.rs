//! Routing-update consumption end to end: queued events in, backend state
//! out.

use std::time::Duration;

use lbsync_controller::drivers::memory::{MemoryPool, MemoryRoute};
use lbsync_controller::drivers::{JobMode, MemoryBackend};
use lbsync_controller::{
    ConsumerSettings, Controller, ControllerSettings, EventOutcome, Member, MonitorTemplate,
    MonitorType, QueueEventSource, RoutingConsumer,
};
use lbsync_events::{RawEnvelope, RoutingUpdate};
use lbsync_reconcile::PollBudget;
use serde_json::json;
use tokio::sync::watch;

const ENDPOINT: &str = "vs-public";

fn event(event_id: i64, update: RoutingUpdate) -> RawEnvelope {
    RawEnvelope::new(event_id, serde_json::to_value(update).unwrap())
}

fn consumer_settings() -> ConsumerSettings {
    ConsumerSettings {
        poll_interval: Duration::from_millis(10),
        max_event_retries: 2,
        ..ConsumerSettings::default()
    }
}

fn consumer(
    backend: &MemoryBackend,
    events: Vec<RawEnvelope>,
    settings: ConsumerSettings,
) -> RoutingConsumer<MemoryBackend, QueueEventSource> {
    let controller = Controller::new(
        backend.clone(),
        ControllerSettings {
            virtual_endpoint: Some(ENDPOINT.to_string()),
            job_budget: PollBudget {
                interval: Duration::from_millis(5),
                max_wait: Duration::from_millis(100),
            },
        },
    );
    RoutingConsumer::new(controller, QueueEventSource::new(events), settings)
}

#[tokio::test]
async fn test_application_lifecycle() {
    let backend = MemoryBackend::new();
    let mut consumer = consumer(
        &backend,
        vec![
            event(1, RoutingUpdate::create_application("blog", "ns1")),
            event(2, RoutingUpdate::add_gear("blog", "ns1", "10.0.0.5", 8080)),
        ],
        consumer_settings(),
    );

    let report = consumer.poll_once().await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.acknowledged, 2);
    assert!(report.failed.is_none());

    let snapshot = backend.snapshot();
    assert_eq!(snapshot.pools.keys().collect::<Vec<_>>(), vec!["lb-blog-ns1"]);
    assert_eq!(
        snapshot.members("lb-blog-ns1"),
        vec![Member::new("10.0.0.5", 8080)]
    );
    let route = &snapshot.routes["route-blog-ns1"];
    assert_eq!(route.pool, "lb-blog-ns1");
    assert_eq!(route.path, "/blog");
    assert_eq!(route.endpoint.as_deref(), Some(ENDPOINT));

    consumer
        .source_mut()
        .push(event(3, RoutingUpdate::remove_gear("blog", "ns1", "10.0.0.5", 8080)));
    consumer
        .source_mut()
        .push(event(4, RoutingUpdate::delete_application("blog", "ns1")));

    let report = consumer.poll_once().await.unwrap();
    assert_eq!(report.acknowledged, 2);

    let snapshot = backend.snapshot();
    assert!(snapshot.pools.is_empty());
    assert!(snapshot.routes.is_empty());

    let ctl = consumer.controller_mut();
    assert!(ctl.pool_names().await.unwrap().is_empty());
    assert!(ctl.route_names().await.unwrap().is_empty());
    assert!(ctl.active_route_names().await.unwrap().is_empty());

    assert_eq!(consumer.source().acks(), &[1, 2, 3, 4]);
    assert_eq!(consumer.checkpoint().last_event_id, 4);
}

#[tokio::test]
async fn test_failed_event_is_not_acknowledged() {
    let backend = MemoryBackend::new();
    let mut consumer = consumer(
        &backend,
        vec![
            event(1, RoutingUpdate::add_gear("ghost", "ns1", "10.0.0.5", 8080)),
            event(2, RoutingUpdate::create_application("blog", "ns1")),
        ],
        consumer_settings(),
    );

    let report = consumer.poll_once().await.unwrap();
    let failed = report.failed.unwrap();
    assert_eq!(failed.event_id, 1);
    assert_eq!(failed.error.reason_code(), "invalid_reference");
    assert_eq!(report.acknowledged, 0);

    // The batch stops at the failure; event 2 is not applied yet.
    assert!(backend.snapshot().pools.is_empty());
    assert!(consumer.source().acks().is_empty());

    consumer.poll_once().await.unwrap();
    assert_eq!(consumer.failure_count(1), 2);
    assert_eq!(consumer.source().pending(), 2);
}

#[tokio::test]
async fn test_redelivered_create_is_a_no_op() {
    let backend = MemoryBackend::new();
    let mut consumer = consumer(
        &backend,
        vec![event(1, RoutingUpdate::create_application("blog", "ns1"))],
        consumer_settings(),
    );
    consumer.poll_once().await.unwrap();

    consumer
        .source_mut()
        .push(event(2, RoutingUpdate::create_application("blog", "ns1")));
    let report = consumer.poll_once().await.unwrap();

    assert!(report.failed.is_none());
    assert_eq!(report.acknowledged, 1);
    assert_eq!(
        backend.snapshot().mutation_calls(),
        vec!["create_pool", "create_route", "attach_route"]
    );
}

#[tokio::test]
async fn test_partial_create_resumes_and_unblocks_feed() {
    let backend = MemoryBackend::new();
    backend.seed(|state| {
        state.failing.insert("create_route".to_string());
    });
    let mut consumer = consumer(
        &backend,
        vec![
            event(1, RoutingUpdate::create_application("blog", "ns1")),
            event(2, RoutingUpdate::create_application("shop", "ns1")),
        ],
        consumer_settings(),
    );

    let report = consumer.poll_once().await.unwrap();
    let failed = report.failed.unwrap();
    assert_eq!(failed.event_id, 1);
    assert_eq!(failed.error.reason_code(), "backend_unavailable");

    // The pool landed, the route did not.
    let snapshot = backend.snapshot();
    assert!(snapshot.pools.contains_key("lb-blog-ns1"));
    assert!(snapshot.routes.is_empty());
    assert!(consumer.source().acks().is_empty());

    backend.seed(|state| state.failing.clear());
    let report = consumer.poll_once().await.unwrap();

    assert!(report.failed.is_none());
    assert_eq!(report.acknowledged, 2);
    assert_eq!(consumer.source().acks(), &[1, 2]);

    let snapshot = backend.snapshot();
    assert_eq!(
        snapshot.pools.keys().collect::<Vec<_>>(),
        vec!["lb-blog-ns1", "lb-shop-ns1"]
    );
    assert_eq!(
        snapshot.active_routes(),
        vec!["route-blog-ns1", "route-shop-ns1"]
    );
    let pool_creates = snapshot
        .mutation_calls()
        .iter()
        .filter(|c| c.as_str() == "create_pool")
        .count();
    assert_eq!(pool_creates, 2);
}

#[tokio::test]
async fn test_leftover_route_does_not_block_create() {
    let backend = MemoryBackend::new();
    backend.seed(|state| {
        state
            .pools
            .insert("lb-old-x".to_string(), MemoryPool::default());
        state.routes.insert(
            "route-blog-ns1".to_string(),
            MemoryRoute {
                pool: "lb-old-x".to_string(),
                path: "/blog".to_string(),
                endpoint: None,
            },
        );
    });
    let mut consumer = consumer(
        &backend,
        vec![
            event(1, RoutingUpdate::create_application("blog", "ns1")),
            event(2, RoutingUpdate::create_application("shop", "ns1")),
        ],
        consumer_settings(),
    );

    let report = consumer.poll_once().await.unwrap();

    assert!(report.failed.is_none());
    assert_eq!(consumer.source().acks(), &[1, 2]);
    let snapshot = backend.snapshot();
    assert!(snapshot.pools.contains_key("lb-blog-ns1"));
    assert!(snapshot.pools.contains_key("lb-shop-ns1"));
    assert_eq!(
        snapshot.routes["route-blog-ns1"].endpoint.as_deref(),
        Some(ENDPOINT)
    );
}

#[tokio::test]
async fn test_malformed_and_duplicate_events_are_acknowledged() {
    let backend = MemoryBackend::new();
    let mut consumer = consumer(
        &backend,
        vec![
            event(1, RoutingUpdate::create_application("blog", "ns1")),
            RawEnvelope::new(2, json!({ "action": "explode", "app_name": "blog" })),
        ],
        consumer_settings(),
    );

    let report = consumer.poll_once().await.unwrap();
    assert_eq!(report.acknowledged, 2);

    // Redelivery of an event at or below the checkpoint is not re-applied.
    let duplicate = event(1, RoutingUpdate::create_application("blog", "ns1"));
    assert_eq!(
        consumer.handle(&duplicate).await.unwrap(),
        EventOutcome::Duplicate
    );

    let malformed = RawEnvelope::new(3, json!({ "action": "add_gear", "app_name": "blog" }));
    assert_eq!(
        consumer.handle(&malformed).await.unwrap(),
        EventOutcome::Malformed
    );

    assert_eq!(backend.snapshot().mutation_calls(), vec!["create_pool", "create_route", "attach_route"]);
}

#[tokio::test]
async fn test_per_application_monitor() {
    let backend = MemoryBackend::new();
    let settings = ConsumerSettings {
        create_routes: false,
        monitor: Some(MonitorTemplate {
            name: "mon-%a-%n".to_string(),
            path: "/%a/health".to_string(),
            up_code: 200,
            kind: MonitorType::Http,
            interval: 5,
            timeout: 16,
        }),
        ..consumer_settings()
    };
    let mut consumer = consumer(
        &backend,
        vec![event(1, RoutingUpdate::create_application("blog", "ns1"))],
        settings,
    );

    consumer.poll_once().await.unwrap();

    let snapshot = backend.snapshot();
    assert_eq!(snapshot.monitors["mon-blog-ns1"].path, "/blog/health");
    assert_eq!(
        snapshot.pools["lb-blog-ns1"].monitor.as_deref(),
        Some("mon-blog-ns1")
    );
    assert!(snapshot.routes.is_empty());

    consumer
        .source_mut()
        .push(event(2, RoutingUpdate::delete_application("blog", "ns1")));
    consumer.poll_once().await.unwrap();

    let snapshot = backend.snapshot();
    assert!(snapshot.pools.is_empty());
    assert!(snapshot.monitors.is_empty());
}

#[tokio::test]
async fn test_shared_monitor_survives_application_delete() {
    let backend = MemoryBackend::new();
    let settings = ConsumerSettings {
        monitor: Some(MonitorTemplate {
            name: "shared-http".to_string(),
            path: "/".to_string(),
            up_code: 200,
            kind: MonitorType::Http,
            interval: 5,
            timeout: 16,
        }),
        ..consumer_settings()
    };
    let mut consumer = consumer(
        &backend,
        vec![
            event(1, RoutingUpdate::create_application("a", "ns1")),
            event(2, RoutingUpdate::create_application("b", "ns1")),
            event(3, RoutingUpdate::delete_application("a", "ns1")),
        ],
        settings,
    );

    let report = consumer.poll_once().await.unwrap();
    assert_eq!(report.acknowledged, 3);

    let snapshot = backend.snapshot();
    assert!(snapshot.monitors.contains_key("shared-http"));
    assert_eq!(snapshot.pools.keys().collect::<Vec<_>>(), vec!["lb-b-ns1"]);
    assert_eq!(
        snapshot.mutation_calls().iter().filter(|c| c.as_str() == "create_monitor").count(),
        1
    );
}

#[tokio::test]
async fn test_job_based_backend() {
    let backend = MemoryBackend::with_job_mode(JobMode::Succeed);
    let mut consumer = consumer(
        &backend,
        vec![
            event(1, RoutingUpdate::create_application("blog", "ns1")),
            event(2, RoutingUpdate::add_gear("blog", "ns1", "10.0.0.5", 8080)),
        ],
        consumer_settings(),
    );

    let report = consumer.poll_once().await.unwrap();
    assert_eq!(report.acknowledged, 2);
    assert_eq!(backend.snapshot().jobs.len(), 4);
}

#[tokio::test]
async fn test_run_once_drains_feed() {
    let backend = MemoryBackend::new();
    let settings = ConsumerSettings {
        once: true,
        ..consumer_settings()
    };
    let mut consumer = consumer(
        &backend,
        vec![
            event(1, RoutingUpdate::create_application("blog", "ns1")),
            event(2, RoutingUpdate::add_gear("blog", "ns1", "10.0.0.5", 8080)),
        ],
        settings,
    );

    let (_tx, rx) = watch::channel(false);
    consumer.run(rx).await.unwrap();

    assert_eq!(consumer.source().acks(), &[1, 2]);
    assert_eq!(consumer.source().pending(), 0);
}

#[tokio::test]
async fn test_run_once_reports_stuck_event() {
    let backend = MemoryBackend::new();
    let settings = ConsumerSettings {
        once: true,
        ..consumer_settings()
    };
    let mut consumer = consumer(
        &backend,
        vec![event(7, RoutingUpdate::delete_application("ghost", "ns1"))],
        settings,
    );

    let (_tx, rx) = watch::channel(false);
    let err = consumer.run(rx).await.unwrap_err();
    assert!(err.to_string().contains("routing update 7 failed"));
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let backend = MemoryBackend::new();
    let mut consumer = consumer(&backend, Vec::new(), consumer_settings());

    let (tx, rx) = watch::channel(false);
    let (result, _) = tokio::join!(consumer.run(rx), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
    });

    result.unwrap();
    assert!(consumer.source().fetches() >= 1);
}
