//! ---
//! ats_section: "05-networking-external-interfaces"
//! ats_subsection: "tests"
//! ats_type: "source"
//! ats_scope: "test"
//! ats_description: "Status API routes against a scripted controller worker."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use ats_api::{spawn_api_server, ApiServerHandle, ApiState, OverrideResponse};
use ats_common::config::Mode;
use ats_core::controller::{Command, LoadShedStatus, COUNTDOWN_UNKNOWN};
use ats_core::{
    AtsError, ControllerHandle, ControllerStatus, InputSnapshot, RelayState, SysState,
    WatchdogStatus,
};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::mpsc;

fn idle_status() -> ControllerStatus {
    ControllerStatus {
        sys_state: SysState::Primary,
        system_busy: false,
        system_error: false,
        prepped_for_load_shedding: false,
        generator_runtime_seconds: 0,
        relays: RelayState::FAIL_SAFE,
        inputs: InputSnapshot::default(),
        watchdog: WatchdogStatus::default(),
        load_shedding: LoadShedStatus {
            stage: 2,
            in_load_shedding: false,
            time_until_ms: 0,
            hours_until: 0,
            minutes_until: 0,
            prestart_countdown: COUNTDOWN_UNKNOWN,
            prestart_lead_minutes: 5,
            next_start: None,
            next_end: None,
        },
        next_window_any_stage: None,
        trace: Vec::new(),
    }
}

/// Worker double: starting the generator is refused as busy, everything else succeeds.
fn scripted_worker() -> (ControllerHandle, mpsc::UnboundedReceiver<Option<u8>>) {
    let (tx, mut commands) = mpsc::channel(8);
    let (stages_tx, stages) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Status(reply) => {
                    let _ = reply.send(idle_status());
                }
                Command::ForceGenerator { running, reply } => {
                    let _ = reply.send(if running { Err(AtsError::Busy) } else { Ok(()) });
                }
                Command::SetLoadShedStage { stage, reply } => {
                    let _ = stages_tx.send(stage);
                    let _ = reply.send(Ok(()));
                }
            }
        }
    });
    (ControllerHandle::new(tx), stages)
}

async fn start_api(controller: ControllerHandle) -> (ApiServerHandle, String) {
    let state = ApiState::new(controller, Mode::DryRun);
    let server = spawn_api_server(state, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let base = format!("http://{}", server.local_addr());
    (server, base)
}

#[tokio::test]
async fn status_reports_mode_and_controller_state() {
    let (controller, _stages) = scripted_worker();
    let (server, base) = start_api(controller).await;

    let body: Value = Client::new()
        .get(format!("{base}/api/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["mode"], "dry-run");
    assert_eq!(body["sys_state"], "primary");
    assert_eq!(body["relays"]["generator"], false);
    assert_eq!(body["load_shedding"]["stage"], 2);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn generator_override_maps_worker_replies() {
    let (controller, _stages) = scripted_worker();
    let (server, base) = start_api(controller).await;
    let client = Client::new();

    let accepted = client
        .post(format!("{base}/api/generator/0"))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let reply: OverrideResponse = accepted.json().await.unwrap();
    assert!(reply.accepted);

    let busy = client
        .post(format!("{base}/api/generator/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(busy.status(), StatusCode::CONFLICT);

    for bad in ["2", "on"] {
        let invalid = client
            .post(format!("{base}/api/generator/{bad}"))
            .send()
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    drop(client);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn load_shed_stage_can_be_pinned_and_cleared() {
    let (controller, mut stages) = scripted_worker();
    let (server, base) = start_api(controller).await;
    let client = Client::new();

    let pinned = client
        .post(format!("{base}/api/loadshedding/6"))
        .send()
        .await
        .unwrap();
    assert_eq!(pinned.status(), StatusCode::ACCEPTED);
    let cleared = client
        .delete(format!("{base}/api/loadshedding"))
        .send()
        .await
        .unwrap();
    assert_eq!(cleared.status(), StatusCode::ACCEPTED);
    let out_of_range = client
        .post(format!("{base}/api/loadshedding/9"))
        .send()
        .await
        .unwrap();
    assert_eq!(out_of_range.status(), StatusCode::BAD_REQUEST);

    assert_eq!(stages.recv().await, Some(Some(6)));
    assert_eq!(stages.recv().await, Some(None));
    assert!(stages.try_recv().is_err());

    drop(client);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn stopped_worker_yields_service_unavailable() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let (server, base) = start_api(ControllerHandle::new(tx)).await;

    let status = Client::new()
        .get(format!("{base}/api/status"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    server.shutdown().await.unwrap();
}
