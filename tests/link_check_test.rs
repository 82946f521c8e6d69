mod helpers;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Redirect;
use axum::routing::get;
use axum::Router;
use bookmark_pipeline::{
    models::job::{JobStatus, MaintenanceKind, QueueName},
    services::{
        link_check::{HttpLinkProber, LinkHealth, LinkProber},
        queue::JobBroker,
    },
};
use helpers::{bookmark, maintenance_request, Harness};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Default)]
struct Site {
    flaky_recovered: Arc<AtomicBool>,
}

async fn flaky(State(site): State<Site>) -> StatusCode {
    if site.flaky_recovered.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn serve(site: Site) -> SocketAddr {
    let app = Router::new()
        .route("/ok", get(|| async { "alive" }))
        .route("/gone", get(|| async { StatusCode::NOT_FOUND }))
        .route("/error", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/moved", get(|| async { Redirect::permanent("/ok") }))
        .route(
            "/no-head",
            get(|| async { "alive" }).head(|| async { StatusCode::METHOD_NOT_ALLOWED }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        )
        .route("/flaky", get(flaky))
        .with_state(site);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn test_http_prober_classification() {
    let addr = serve(Site::default()).await;
    let prober = HttpLinkProber::new(Duration::from_secs(1)).unwrap();
    let url = |path: &str| format!("http://{addr}{path}");

    assert_eq!(prober.probe(&url("/ok")).await, LinkHealth::Alive(200));
    assert_eq!(prober.probe(&url("/gone")).await, LinkHealth::Dead(404));
    assert_eq!(prober.probe(&url("/error")).await, LinkHealth::Dead(500));
    assert_eq!(prober.probe(&url("/moved")).await, LinkHealth::Alive(308));
    assert_eq!(prober.probe(&url("/no-head")).await, LinkHealth::Alive(200));
    assert!(matches!(
        prober.probe(&url("/slow")).await,
        LinkHealth::Unreachable(_)
    ));

    let dead = closed_port().await;
    assert!(matches!(
        prober.probe(&format!("http://{dead}/")).await,
        LinkHealth::Unreachable(_)
    ));
}

#[tokio::test]
async fn test_broken_link_scan_flags_and_recovers() {
    let site = Site::default();
    let addr = serve(site.clone()).await;
    let h = Harness::new();
    let prober = Arc::new(HttpLinkProber::new(Duration::from_secs(2)).unwrap());
    let handler = h.handler_with_prober(QueueName::Maintenance, prober);

    h.store.insert(bookmark("B1", "u1", &format!("http://{addr}/ok"), 0));
    h.store.insert(bookmark("B2", "u1", &format!("http://{addr}/flaky"), 1));
    h.store.insert(bookmark("B3", "u1", &format!("http://{addr}/moved"), 2));
    h.store.insert(bookmark("B4", "u1", &format!("http://{}/", closed_port().await), 3));

    h.broker
        .enqueue(maintenance_request(MaintenanceKind::BrokenLinkScan, Some("u1")))
        .await
        .unwrap();
    let job = h.run_next_with(handler.clone()).await.unwrap();

    assert!(!h.store.get("B1").unwrap().is_broken);
    assert!(h.store.get("B2").unwrap().is_broken);
    assert!(!h.store.get("B3").unwrap().is_broken);
    assert!(h.store.get("B4").unwrap().is_broken);
    let job = h.broker.get_job(QueueName::Maintenance, &job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    // The page comes back: the next scan clears the flag.
    site.flaky_recovered.store(true, Ordering::SeqCst);
    h.broker
        .enqueue(maintenance_request(MaintenanceKind::BrokenLinkScan, Some("u1")))
        .await
        .unwrap();
    h.run_next_with(handler).await.unwrap();

    assert!(!h.store.get("B2").unwrap().is_broken);
    assert!(h.store.get("B4").unwrap().is_broken);
}

#[tokio::test(start_paused = true)]
async fn test_probes_are_spaced_out() {
    let mut h = Harness::new();
    h.probe_delay = Duration::from_millis(100);
    for i in 0..4 {
        h.store.insert(bookmark(
            &format!("B{i}"),
            "u1",
            &format!("https://site{i}.example/"),
            i,
        ));
    }
    h.prober
        .answer("https://site2.example/", LinkHealth::Unreachable("timed out".into()));

    h.broker
        .enqueue(maintenance_request(MaintenanceKind::BrokenLinkScan, None))
        .await
        .unwrap();

    let start = tokio::time::Instant::now();
    h.run_next(QueueName::Maintenance).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(300));

    assert_eq!(h.prober.probed().len(), 4);
    assert!(h.store.get("B2").unwrap().is_broken);
    assert!(!h.store.get("B0").unwrap().is_broken);
}
