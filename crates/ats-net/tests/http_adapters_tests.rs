//! ---
//! ats_section: "05-networking-external-interfaces"
//! ats_subsection: "tests"
//! ats_type: "source"
//! ats_scope: "test"
//! ats_description: "Schedule provider and notifier against local HTTP fixtures."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use ats_core::ports::{NotificationSink, ScheduleProvider};
use ats_net::{EspScheduleProvider, HttpNotifier};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn authorised(headers: &HeaderMap) -> bool {
    headers.get("token").and_then(|v| v.to_str().ok()) == Some("secret")
}

async fn area(headers: HeaderMap, uri: Uri) -> (StatusCode, Json<Value>) {
    if !authorised(&headers) || uri.query() != Some("id=area-17") {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "denied"})));
    }
    (
        StatusCode::OK,
        Json(json!({
            "events": [{"start": "2024-05-02T18:00:00+02:00", "end": "2024-05-02T20:30:00+02:00", "note": "Stage 2"}],
            "info": {"name": "Area 17", "region": "Test"},
            "schedule": {"days": [{"date": "2024-05-02", "name": "Thursday", "stages": [[], ["18:00-20:30"]]}], "source": "fixture"}
        })),
    )
}

async fn status(headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if !authorised(&headers) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "denied"})));
    }
    (
        StatusCode::OK,
        Json(json!({"status": {"eskom": {"name": "National", "stage": "3", "next_stages": []}}})),
    )
}

fn esp_router() -> Router {
    Router::new()
        .route("/business/2.0/area", get(area))
        .route("/business/2.0/status", get(status))
}

#[tokio::test]
async fn provider_fetches_schedule_and_stage() {
    let addr = serve(esp_router()).await;
    let provider =
        EspScheduleProvider::new(&format!("http://{addr}/business/2.0/"), "secret", "area-17").unwrap();

    let schedule = provider.fetch_area_schedule().await.unwrap();
    assert_eq!(schedule.events.len(), 1);
    assert_eq!(schedule.events[0].stage, 2);
    assert_eq!(schedule.days[0].stages[1], vec!["18:00-20:30".to_owned()]);
    assert_eq!(provider.fetch_current_stage().await.unwrap(), 3);
}

#[tokio::test]
async fn provider_surfaces_rejected_tokens() {
    let addr = serve(esp_router()).await;
    let provider =
        EspScheduleProvider::new(&format!("http://{addr}/business/2.0"), "wrong", "area-17").unwrap();

    let err = provider.fetch_current_stage().await.unwrap_err();
    assert!(format!("{err:#}").contains("rejected"));
}

#[tokio::test]
async fn notifier_posts_the_message() {
    let received: Arc<Mutex<Vec<Value>>> = Arc::default();
    let router = Router::new()
        .route(
            "/hook",
            post(
                |State(received): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                    received.lock().unwrap().push(body);
                    StatusCode::NO_CONTENT
                },
            ),
        )
        .with_state(received.clone());
    let addr = serve(router).await;

    let notifier = HttpNotifier::new(&format!("http://{addr}/hook")).unwrap();
    notifier.notify("Generator started").await.unwrap();

    let bodies = received.lock().unwrap().clone();
    assert_eq!(
        bodies,
        vec![json!({"message": "Generator started", "source": "atsd"})]
    );
}

#[tokio::test]
async fn notifier_reports_server_errors() {
    let router = Router::new().route("/hook", post(|| async { StatusCode::BAD_GATEWAY }));
    let addr = serve(router).await;

    let notifier = HttpNotifier::new(&format!("http://{addr}/hook")).unwrap();
    assert!(notifier.notify("Generator stopped").await.is_err());
}
