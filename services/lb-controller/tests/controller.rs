//! Controller behaviour against the in-memory backend.
//!
//! The memory backend is shared with the controller through a cloned handle,
//! so every test can compare the controller's cache with what the backend
//! actually holds.

use std::time::Duration;

use lbsync_controller::drivers::memory::{MemoryPool, MemoryRoute};
use lbsync_controller::drivers::{JobMode, MemoryBackend};
use lbsync_controller::{
    CacheState, Controller, ControllerSettings, LbError, Member, MonitorSpec, MonitorType,
    ObjectKind,
};
use lbsync_reconcile::PollBudget;
use proptest::prelude::*;
use rstest::rstest;

const ENDPOINT: &str = "vs-public";

fn fast_budget() -> PollBudget {
    PollBudget {
        interval: Duration::from_millis(5),
        max_wait: Duration::from_millis(50),
    }
}

fn settings(endpoint: Option<&str>) -> ControllerSettings {
    ControllerSettings {
        virtual_endpoint: endpoint.map(str::to_string),
        job_budget: fast_budget(),
    }
}

fn controller(backend: &MemoryBackend) -> Controller<MemoryBackend> {
    Controller::new(backend.clone(), settings(Some(ENDPOINT)))
}

fn monitor(name: &str) -> MonitorSpec {
    MonitorSpec {
        name: name.to_string(),
        path: "/health".to_string(),
        up_code: 200,
        kind: MonitorType::Http,
        interval: 5,
        timeout: 16,
    }
}

#[tokio::test]
async fn test_caches_start_unloaded_and_load_once() {
    let backend = MemoryBackend::new();
    backend.seed(|state| {
        state
            .pools
            .insert("lb-seeded-ns".to_string(), MemoryPool::default());
    });
    let mut ctl = controller(&backend);

    assert_eq!(ctl.registry().pools.state(), CacheState::Unloaded);

    assert!(ctl.has_pool("lb-seeded-ns").await.unwrap());
    assert!(!ctl.has_pool("lb-other-ns").await.unwrap());
    assert_eq!(ctl.pool_names().await.unwrap(), vec!["lb-seeded-ns"]);

    assert_eq!(ctl.registry().pools.state(), CacheState::Loaded);
    let listings = backend
        .snapshot()
        .calls
        .iter()
        .filter(|c| c.as_str() == "list_pools")
        .count();
    assert_eq!(listings, 1);
}

#[tokio::test]
async fn test_create_existing_pool_fails_without_duplicate() {
    let backend = MemoryBackend::new();
    let mut ctl = controller(&backend);

    ctl.create_pool("lb-blog-ns1", None).await.unwrap();
    let err = ctl.create_pool("lb-blog-ns1", None).await.unwrap_err();

    assert_eq!(err, LbError::already_exists(ObjectKind::Pool, "lb-blog-ns1"));
    let snapshot = backend.snapshot();
    assert_eq!(snapshot.pools.len(), 1);
    assert_eq!(snapshot.mutation_calls(), vec!["create_pool"]);
}

#[tokio::test]
async fn test_create_pool_reported_by_backend_fails() {
    let backend = MemoryBackend::new();
    backend.seed(|state| {
        state
            .pools
            .insert("lb-blog-ns1".to_string(), MemoryPool::default());
    });
    let mut ctl = controller(&backend);

    let err = ctl.create_pool("lb-blog-ns1", None).await.unwrap_err();
    assert!(matches!(err, LbError::AlreadyExists { .. }));
    assert!(backend.snapshot().mutation_calls().is_empty());
}

#[tokio::test]
async fn test_delete_missing_pool_makes_no_backend_call() {
    let backend = MemoryBackend::new();
    let mut ctl = controller(&backend);

    let err = ctl.delete_pool("lb-ghost-ns").await.unwrap_err();

    assert_eq!(err, LbError::not_found(ObjectKind::Pool, "lb-ghost-ns"));
    assert!(backend.snapshot().mutation_calls().is_empty());
}

#[tokio::test]
async fn test_member_operations_require_existing_pool() {
    let backend = MemoryBackend::new();
    let mut ctl = controller(&backend);

    let err = ctl.pool("lb-ghost-ns").await.err().unwrap();
    assert_eq!(err.reason_code(), "invalid_reference");
}

#[tokio::test]
async fn test_duplicate_and_missing_members_are_errors() {
    let backend = MemoryBackend::new();
    let mut ctl = controller(&backend);
    ctl.create_pool("lb-a-ns", None).await.unwrap();

    let mut pool = ctl.pool("lb-a-ns").await.unwrap();
    pool.add_member("10.0.0.5", 8080).await.unwrap();

    let err = pool.add_member("10.0.0.5", 8080).await.unwrap_err();
    assert!(matches!(
        err,
        LbError::AlreadyExists {
            kind: ObjectKind::Member,
            ..
        }
    ));

    let err = pool.delete_member("10.0.0.9", 8080).await.unwrap_err();
    assert!(matches!(
        err,
        LbError::NotFound {
            kind: ObjectKind::Member,
            ..
        }
    ));

    assert_eq!(
        pool.members().await.unwrap(),
        vec![Member::new("10.0.0.5", 8080)]
    );
    assert_eq!(
        backend.snapshot().mutation_calls(),
        vec!["create_pool", "add_pool_member"]
    );
}

#[tokio::test]
async fn test_members_of_listed_pool_load_lazily() {
    let backend = MemoryBackend::new();
    backend.seed(|state| {
        let mut pool = MemoryPool::default();
        pool.members.insert(Member::new("10.0.0.1", 80));
        pool.members.insert(Member::new("10.0.0.2", 80));
        state.pools.insert("lb-a-ns".to_string(), pool);
    });
    let mut ctl = controller(&backend);

    let members = ctl.members("lb-a-ns").await.unwrap();
    assert_eq!(members.len(), 2);

    let err = ctl
        .pool("lb-a-ns")
        .await
        .unwrap()
        .add_member("10.0.0.1", 80)
        .await
        .unwrap_err();
    assert!(matches!(err, LbError::AlreadyExists { .. }));
}

#[tokio::test]
async fn test_route_requires_existing_pool() {
    let backend = MemoryBackend::new();
    let mut ctl = controller(&backend);

    let err = ctl
        .create_route("lb-x-y", "route-x-y", "/x")
        .await
        .unwrap_err();

    assert_eq!(
        err,
        LbError::invalid_reference(ObjectKind::Pool, "lb-x-y", "route route-x-y")
    );
    assert!(backend.snapshot().mutation_calls().is_empty());
}

#[tokio::test]
async fn test_route_attach_and_detach_order() {
    let backend = MemoryBackend::new();
    let mut ctl = controller(&backend);

    ctl.create_pool("lb-blog-ns1", None).await.unwrap();
    ctl.create_route("lb-blog-ns1", "route-blog-ns1", "/blog")
        .await
        .unwrap();

    assert_eq!(ctl.active_route_names().await.unwrap(), vec!["route-blog-ns1"]);
    assert_eq!(
        backend.snapshot().routes.get("route-blog-ns1"),
        Some(&MemoryRoute {
            pool: "lb-blog-ns1".to_string(),
            path: "/blog".to_string(),
            endpoint: Some(ENDPOINT.to_string()),
        })
    );

    let err = ctl.delete_pool("lb-blog-ns1").await.unwrap_err();
    assert!(matches!(err, LbError::InUse { .. }));

    ctl.delete_route("lb-blog-ns1", "route-blog-ns1")
        .await
        .unwrap();
    ctl.delete_pool("lb-blog-ns1").await.unwrap();

    assert_eq!(
        backend.snapshot().mutation_calls(),
        vec![
            "create_pool",
            "create_route",
            "attach_route",
            "detach_route",
            "delete_route",
            "delete_pool",
        ]
    );
    assert!(ctl.route_names().await.unwrap().is_empty());
    assert!(ctl.active_route_names().await.unwrap().is_empty());
    assert!(ctl.pool_names().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_routes_stay_inactive_without_endpoint() {
    let backend = MemoryBackend::new();
    let mut ctl = Controller::new(backend.clone(), settings(None));

    ctl.create_pool("lb-a-ns", None).await.unwrap();
    ctl.create_route("lb-a-ns", "route-a-ns", "/a").await.unwrap();

    assert!(ctl.active_route_names().await.unwrap().is_empty());
    assert!(!backend.snapshot().mutation_calls().contains(&"attach_route".to_string()));
}

#[tokio::test]
async fn test_delete_active_route_without_endpoint_is_rejected() {
    let backend = MemoryBackend::new();
    backend.seed(|state| {
        state.pools.insert("lb-a-ns".to_string(), MemoryPool::default());
        state.routes.insert(
            "route-a-ns".to_string(),
            MemoryRoute {
                pool: "lb-a-ns".to_string(),
                path: "/a".to_string(),
                endpoint: Some(ENDPOINT.to_string()),
            },
        );
    });
    let mut ctl = Controller::new(backend.clone(), settings(None));

    let err = ctl.delete_route("lb-a-ns", "route-a-ns").await.unwrap_err();
    assert!(matches!(
        err,
        LbError::InvalidReference {
            kind: ObjectKind::VirtualEndpoint,
            ..
        }
    ));
    assert!(backend.snapshot().mutation_calls().is_empty());
}

#[tokio::test]
async fn test_pool_with_monitor() {
    let backend = MemoryBackend::new();
    let mut ctl = controller(&backend);

    let err = ctl.create_pool("lb-a-ns", Some("mon-a")).await.unwrap_err();
    assert!(matches!(
        err,
        LbError::InvalidReference {
            kind: ObjectKind::Monitor,
            ..
        }
    ));

    ctl.create_monitor(&monitor("mon-a")).await.unwrap();
    let pool = ctl.create_pool("lb-a-ns", Some("mon-a")).await.unwrap();
    assert_eq!(pool.monitor.as_deref(), Some("mon-a"));

    let err = ctl.create_monitor(&monitor("mon-a")).await.unwrap_err();
    assert!(matches!(err, LbError::AlreadyExists { .. }));

    ctl.delete_monitor("mon-a", Some("lb-a-ns")).await.unwrap();
    assert!(!ctl.has_monitor("mon-a").await.unwrap());
    assert_eq!(backend.snapshot().pools["lb-a-ns"].monitor, None);
}

#[tokio::test]
async fn test_job_based_mutations_wait_for_success() {
    let backend = MemoryBackend::with_job_mode(JobMode::Succeed);
    let mut ctl = controller(&backend);

    ctl.create_pool("lb-a-ns", None).await.unwrap();
    ctl.pool("lb-a-ns")
        .await
        .unwrap()
        .add_member("10.0.0.5", 8080)
        .await
        .unwrap();

    let snapshot = backend.snapshot();
    assert_eq!(snapshot.jobs.len(), 2);
    assert!(snapshot.calls.contains(&"get_job_status".to_string()));
    assert_eq!(snapshot.members("lb-a-ns"), vec![Member::new("10.0.0.5", 8080)]);
}

#[rstest]
#[case::failed_job(JobMode::Fail, "job_failed")]
#[case::pending_job(JobMode::StayPending, "job_timeout")]
#[tokio::test]
async fn test_unconfirmed_jobs_leave_cache_untouched(
    #[case] mode: JobMode,
    #[case] reason: &str,
) {
    let backend = MemoryBackend::with_job_mode(mode);
    let mut ctl = controller(&backend);

    let err = ctl.create_pool("lb-a-ns", None).await.unwrap_err();

    assert_eq!(err.reason_code(), reason);
    assert!(!err.is_logical());
    assert_eq!(ctl.registry().pools.state(), CacheState::Unloaded);
    assert!(!ctl.has_pool("lb-a-ns").await.unwrap());
}

#[tokio::test]
async fn test_timed_out_job_that_lands_later_is_relisted() {
    let backend = MemoryBackend::with_job_mode(JobMode::StayPending);
    let mut ctl = controller(&backend);
    assert!(ctl.pool_names().await.unwrap().is_empty());

    let err = ctl.create_pool("lb-a-ns", None).await.unwrap_err();
    assert_eq!(err.reason_code(), "job_timeout");

    // The backend finishes the job after the controller gave up.
    backend.seed(|state| {
        state
            .pools
            .insert("lb-a-ns".to_string(), MemoryPool::default());
    });

    assert!(ctl.has_pool("lb-a-ns").await.unwrap());
    let err = ctl.create_pool("lb-a-ns", None).await.unwrap_err();
    assert_eq!(err, LbError::already_exists(ObjectKind::Pool, "lb-a-ns"));
    assert_eq!(backend.snapshot().mutation_calls(), vec!["create_pool"]);
}

#[tokio::test]
async fn test_failed_member_job_relists_members() {
    let backend = MemoryBackend::new();
    let mut ctl = Controller::new(
        backend.switch_job_mode(JobMode::Fail),
        settings(Some(ENDPOINT)),
    );
    backend.seed(|state| {
        state
            .pools
            .insert("lb-a-ns".to_string(), MemoryPool::default());
    });
    assert!(ctl.members("lb-a-ns").await.unwrap().is_empty());

    let err = ctl
        .pool("lb-a-ns")
        .await
        .unwrap()
        .add_member("10.0.0.5", 8080)
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "job_failed");

    let pools = ctl.registry().pools.get().unwrap();
    assert!(!pools["lb-a-ns"].members.is_loaded());
    assert_eq!(ctl.registry().pools.state(), CacheState::Loaded);
}

#[tokio::test]
async fn test_attach_route_is_idempotent() {
    let backend = MemoryBackend::new();
    let mut ctl = controller(&backend);

    ctl.create_pool("lb-a-ns", None).await.unwrap();
    ctl.create_route("lb-a-ns", "route-a-ns", "/a").await.unwrap();
    ctl.attach_route("route-a-ns").await.unwrap();

    let err = ctl.attach_route("route-ghost").await.unwrap_err();
    assert_eq!(err, LbError::not_found(ObjectKind::Route, "route-ghost"));
    assert_eq!(
        backend.snapshot().mutation_calls(),
        vec!["create_pool", "create_route", "attach_route"]
    );
}

#[tokio::test]
async fn test_backend_outage_surfaces_unavailable() {
    let backend = MemoryBackend::new();
    let mut ctl = controller(&backend);
    ctl.create_pool("lb-a-ns", None).await.unwrap();

    backend.set_unavailable(true);
    let err = ctl
        .pool("lb-a-ns")
        .await
        .unwrap()
        .add_member("10.0.0.5", 8080)
        .await
        .unwrap_err();
    assert!(matches!(err, LbError::BackendUnavailable(_)));

    backend.set_unavailable(false);
    assert!(ctl.members("lb-a-ns").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalidate_relists_backend() {
    let backend = MemoryBackend::new();
    let mut ctl = controller(&backend);
    assert!(ctl.pool_names().await.unwrap().is_empty());

    backend.seed(|state| {
        state
            .pools
            .insert("lb-external-ns".to_string(), MemoryPool::default());
    });
    assert!(!ctl.has_pool("lb-external-ns").await.unwrap());

    ctl.invalidate();
    assert!(ctl.has_pool("lb-external-ns").await.unwrap());
}

#[derive(Debug, Clone)]
enum MemberOp {
    Add(u8, u16),
    Delete(u8, u16),
}

fn member_op() -> impl Strategy<Value = MemberOp> {
    prop_oneof![
        (0u8..4, 8080u16..8083).prop_map(|(h, p)| MemberOp::Add(h, p)),
        (0u8..4, 8080u16..8083).prop_map(|(h, p)| MemberOp::Delete(h, p)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_member_cache_matches_backend(ops in prop::collection::vec(member_op(), 1..24)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let backend = MemoryBackend::new();
            let mut ctl = controller(&backend);
            ctl.create_pool("lb-prop-ns", None).await.unwrap();

            for op in ops {
                let mut pool = ctl.pool("lb-prop-ns").await.unwrap();
                let result = match &op {
                    MemberOp::Add(h, p) => pool.add_member(&format!("10.0.0.{h}"), *p).await,
                    MemberOp::Delete(h, p) => pool.delete_member(&format!("10.0.0.{h}"), *p).await,
                };
                if let Err(err) = result {
                    prop_assert!(err.is_logical(), "unexpected error {err} for {op:?}");
                }

                let cached = ctl.members("lb-prop-ns").await.unwrap();
                prop_assert_eq!(cached, backend.snapshot().members("lb-prop-ns"));
            }
            Ok(())
        })?;
    }
}
