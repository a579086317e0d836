//! HTTP surface of the labflash server


use labflash::models::{BackupPhase, BuildOutcome, BuildRequest, BuildResult, BuildState, RelayOutcome, StreamRecord};
use labflash::remote::RemoteClient;
use labflash::server::ServerConfig;
use labflash::server::app::ServerState;
use labflash::server::routes::create_routes;
use labflash::services::StreamDecoder;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use test_fixtures::*;
use tokio::sync::RwLock;
use warp::http::StatusCode;

const BOUNDARY: &str = "labflash-test-boundary";

fn state_for(lab: &LabFixture) -> Arc<RwLock<ServerState>> {
    Arc::new(RwLock::new(ServerState::new(lab.services.clone(), ServerConfig::default())))
}

fn pio_lab() -> LabFixture {
    LabFixture::new(ScriptedRunner::new(|cmd| {
        if is_pio(cmd) { fake_pio_build(cmd) } else { Reply::ok("Hash of data verified.") }
    }))
}

fn json_body(body: &[u8]) -> Value {
    serde_json::from_slice(body).expect("response body is JSON")
}

/// Hand-rolled multipart body: text fields plus an optional file part
fn multipart(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }
    if let Some((file_name, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                BOUNDARY, file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

#[tokio::test]
async fn test_health() {
    let lab = pio_lab();
    let routes = create_routes(state_for(&lab), 1024 * 1024);

    let response = warp::test::request().method("GET").path("/health").reply(&routes).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response.body());
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], labflash::VERSION);
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let lab = pio_lab();
    let routes = create_routes(state_for(&lab), 1024 * 1024);

    let response = warp::test::request().method("GET").path("/api/v1/flash/nope").reply(&routes).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(json_body(response.body())["error"].is_string());
}

#[tokio::test]
async fn test_ports_in_container_without_usb() {
    let lab = LabFixture::with_ports(ScriptedRunner::permissive(), FakePorts::none(), true);
    let routes = create_routes(state_for(&lab), 1024 * 1024);

    let response = warp::test::request()
        .method("GET")
        .path("/api/v1/flash/ports?detect=1")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response.body());
    assert_eq!(body["ports"].as_array().unwrap().len(), 0);
    assert_eq!(body["in_container_no_usb"], true);
}

#[tokio::test]
async fn test_catalog_endpoints() {
    let lab = pio_lab();
    let routes = create_routes(state_for(&lab), 1024 * 1024);

    let devices = warp::test::request().method("GET").path("/api/v1/flash/devices").reply(&routes).await;
    let body = json_body(devices.body());
    assert!(body["devices"].as_array().unwrap().iter().any(|d| d["id"] == "t_beam_1w"));

    let config = warp::test::request().method("GET").path("/api/v1/flash/build-config").reply(&routes).await;
    assert_eq!(json_body(config.body())["builds"].as_array().unwrap().len(), 2);

    let patches = warp::test::request()
        .method("GET")
        .path("/api/v1/flash/patches?device_id=t_beam_1w&firmware_id=meshcore")
        .reply(&routes)
        .await;
    let names: Vec<String> = json_body(patches.body())["patches"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["001-radio.patch", "002-gps.patch"]);

    let none = warp::test::request()
        .method("GET")
        .path("/api/v1/flash/patches?device_id=t_beam_1w")
        .reply(&routes)
        .await;
    assert_eq!(none.status(), StatusCode::OK);
    assert!(json_body(none.body())["patches"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_build_endpoint_statuses() {
    let lab = pio_lab();
    let routes = create_routes(state_for(&lab), 1024 * 1024);

    let ok = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/build")
        .json(&BuildRequest::new("t_beam_1w", "meshtastic", "tbeam-1w"))
        .reply(&routes)
        .await;
    assert_eq!(ok.status(), StatusCode::OK);
    let result: BuildResult = serde_json::from_slice(ok.body()).unwrap();
    assert!(result.success);
    assert!(result.path.unwrap().starts_with("artifacts/t_beam_1w/meshtastic/"));

    let missing_env = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/build")
        .json(&BuildRequest::new("t_beam_1w", "meshtastic", ""))
        .reply(&routes)
        .await;
    assert_eq!(missing_env.status(), StatusCode::BAD_REQUEST);
    let body = json_body(missing_env.body());
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("env_name"));

    let malformed = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/build")
        .header("content-type", "application/json")
        .body("{not json")
        .reply(&routes)
        .await;
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stream_rejects_invalid_request_as_json() {
    let lab = pio_lab();
    let routes = create_routes(state_for(&lab), 1024 * 1024);

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/build/stream")
        .json(&BuildRequest::new("t_beam_1w", "bruce", "env"))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response.body())["error"].as_str().unwrap().contains("Unknown device or firmware"));
}

#[tokio::test]
async fn test_stream_ends_with_done_record() {
    let lab = pio_lab();
    let routes = create_routes(state_for(&lab), 1024 * 1024);

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/build/stream")
        .json(&BuildRequest::new("t_beam_1w", "meshtastic", "tbeam-1w"))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let mut decoder = StreamDecoder::new();
    decoder.push(response.body());
    let decoded = decoder.finish();
    assert!(decoded.done);
    assert_eq!(decoded.malformed, 0);
    assert!(decoded.text.contains("[SUCCESS]"));
    let result = decoded.terminal.and_then(|t| t.result).expect("terminal result");
    assert!(result.success);
    assert_eq!(result.state, Some(BuildState::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn test_stream_reports_timeout_as_state() {
    let lab = LabFixture::new(ScriptedRunner::new(|cmd| {
        if is_pio(cmd) { Reply::Hang } else { Reply::ok("") }
    }));
    let routes = create_routes(state_for(&lab), 1024 * 1024);
    let mut request = BuildRequest::new("t_beam_1w", "meshtastic", "tbeam-1w");
    request.timeout = Some(60);

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/build/stream")
        .json(&request)
        .reply(&routes)
        .await;
    let mut decoder = StreamDecoder::new();
    decoder.push(response.body());
    let result = decoder
        .finish()
        .terminal
        .and_then(|t| t.result)
        .expect("terminal result");
    assert!(!result.success);
    assert!(result.timed_out());
    assert_eq!(result.state, Some(BuildState::TimedOut));

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/build")
        .json(&request)
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json_body(response.body())["state"], "timed_out");
}

#[tokio::test]
async fn test_backup_cancel_without_backup_is_conflict() {
    let lab = pio_lab();
    let routes = create_routes(state_for(&lab), 1024 * 1024);

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/backup/cancel")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response.body())["success"], false);
}

#[tokio::test]
async fn test_backup_stops_when_client_goes_away() {
    let lab = LabFixture::new(ScriptedRunner::new(|cmd| match fake_read_flash(cmd) {
        Reply::Output(out) => Reply::After(Duration::from_millis(200), out),
        other => other,
    }));
    let state = state_for(&lab);
    let routes = create_routes(state.clone(), 1024 * 1024);

    let request = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/backup")
        .json(&serde_json::json!({"port": "/dev/ttyACM0", "device_id": "t_beam_1w", "backup_type": "full"}));
    let abandoned = tokio::time::timeout(Duration::from_millis(100), request.reply(&routes)).await;
    assert!(abandoned.is_err(), "full backup should still be running");

    let locks = lab.services.flasher.locks();
    for _ in 0..50 {
        if !locks.is_held("/dev/ttyACM0") && state.read().await.backup_cancels.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!locks.is_held("/dev/ttyACM0"), "port released after disconnect");
    assert_eq!(lab.services.flasher.progress_for("/dev/ttyACM0").status, BackupPhase::Cancelled);
    // 4 chunks of 2 MiB; only the one in flight was read
    assert_eq!(lab.runner.calls_with("read-flash").len(), 1);
    assert!(lab.backup_files().is_empty());
    assert!(state.read().await.backup_cancels.is_empty());
}

#[tokio::test]
async fn test_backup_cancel_targets_one_port() {
    let lab = pio_lab();
    let state = state_for(&lab);
    let first = Arc::new(AtomicBool::new(false));
    let second = Arc::new(AtomicBool::new(false));
    {
        let mut state = state.write().await;
        assert!(state.register_backup("/dev/ttyACM0", first.clone()));
        assert!(state.register_backup("/dev/ttyACM1", second.clone()));
        assert!(!state.register_backup("/dev/ttyACM1", Arc::new(AtomicBool::new(false))));
    }
    let routes = create_routes(state.clone(), 1024 * 1024);

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/backup/cancel?port=/dev/ttyACM1")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!first.load(Ordering::Relaxed));
    assert!(second.load(Ordering::Relaxed));

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/backup/cancel?port=/dev/ttyUSB9")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/backup/cancel")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(first.load(Ordering::Relaxed));
}

#[tokio::test]
async fn test_backup_returns_image_bytes() {
    let lab = LabFixture::new(ScriptedRunner::new(fake_read_flash));
    let routes = create_routes(state_for(&lab), 1024 * 1024);

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/backup")
        .json(&serde_json::json!({
            "port": "/dev/ttyACM0",
            "device_id": "t_beam_1w",
            "backup_type": "nvs",
            "name": "nvs-before-update"
        }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().len(), 0x6000);
    let disposition = response.headers()["content-disposition"].to_str().unwrap();
    assert!(disposition.contains("nvs-before-update.bin"));

    let progress = warp::test::request()
        .method("GET")
        .path("/api/v1/flash/backup/progress")
        .reply(&routes)
        .await;
    assert_eq!(json_body(progress.body())["status"], "done");
}

#[tokio::test]
async fn test_backup_on_busy_port_is_conflict() {
    let lab = LabFixture::new(ScriptedRunner::new(fake_read_flash));
    let routes = create_routes(state_for(&lab), 1024 * 1024);
    let _lease = lab.services.flasher.locks().acquire("/dev/ttyACM0").unwrap();

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/backup")
        .json(&serde_json::json!({"port": "/dev/ttyACM0", "device_id": "t_beam_1w", "backup_type": "nvs"}))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(json_body(response.body())["error"].as_str().unwrap().contains("busy"));
}

#[tokio::test]
async fn test_flash_multipart() {
    let lab = pio_lab();
    lab.write("artifacts/backups/backup_t_beam_1w_full_1.bin", &[0xFF; 1024]);
    let routes = create_routes(state_for(&lab), 1024 * 1024);
    let content_type = format!("multipart/form-data; boundary={}", BOUNDARY);

    let image = esp_image(ESP32S3_CHIP_ID, 2048);
    let uploaded = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/flash")
        .header("content-type", content_type.as_str())
        .body(multipart(
            &[("port", "/dev/ttyACM0"), ("device_id", "t_beam_1w"), ("addr", "0x10000")],
            Some(("firmware.bin", &image)),
        ))
        .reply(&routes)
        .await;
    assert_eq!(uploaded.status(), StatusCode::OK);
    assert_eq!(json_body(uploaded.body())["success"], true);
    assert!(lab.runner.calls_with("0x10000").len() == 1);

    let both = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/flash")
        .header("content-type", content_type.as_str())
        .body(multipart(
            &[
                ("port", "/dev/ttyACM0"),
                ("device_id", "t_beam_1w"),
                ("path", "artifacts/backups/backup_t_beam_1w_full_1.bin"),
            ],
            Some(("firmware.bin", &image)),
        ))
        .reply(&routes)
        .await;
    assert_eq!(both.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(both.body())["success"], false);

    let restore = warp::test::request()
        .method("POST")
        .path("/api/v1/flash/restore")
        .header("content-type", content_type.as_str())
        .body(multipart(
            &[
                ("port", "/dev/ttyACM0"),
                ("device_id", "t_beam_1w"),
                ("path", "artifacts/backups/backup_t_beam_1w_full_1.bin"),
            ],
            None,
        ))
        .reply(&routes)
        .await;
    assert_eq!(restore.status(), StatusCode::OK);
    assert_eq!(lab.runner.calls_with("write-flash").len(), 2);
}

#[tokio::test]
async fn test_artifacts_listing() {
    let lab = pio_lab();
    lab.write("artifacts/t_beam_1w/meshtastic/build_a/firmware.bin", &[1; 32]);
    lab.write("artifacts/t_beam_1w/meshcore/build_b/firmware.bin", &[2; 32]);
    let routes = create_routes(state_for(&lab), 1024 * 1024);

    let response = warp::test::request()
        .method("GET")
        .path("/api/v1/flash/artifacts?firmware=meshcore")
        .reply(&routes)
        .await;
    let files = json_body(response.body())["files"].as_array().unwrap().clone();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["firmware"], "meshcore");
    assert_eq!(files[0]["type"], "artifact");
}

/// Streamed build over a real socket, consumed by the remote client
#[tokio::test]
async fn test_remote_streamed_build_end_to_end() {
    let lab = pio_lab();
    let routes = create_routes(state_for(&lab), 1024 * 1024);
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    let server = tokio::spawn(server);

    let client = RemoteClient::new(&format!("http://{}", addr)).unwrap();
    let mut live = String::new();
    let outcome = client
        .build_streamed(&BuildRequest::new("t_beam_1w", "meshtastic", "tbeam-1w"), |delta| {
            live.push_str(delta)
        })
        .await
        .unwrap();

    match outcome {
        RelayOutcome::Complete { text, terminal, malformed } => {
            assert_eq!(text, live);
            assert_eq!(malformed, 0);
            assert!(terminal.unwrap().result.unwrap().success);
        }
        other => panic!("Expected a complete stream, got {:?}", other),
    }

    let rejected = client
        .build_streamed(&BuildRequest::new("t_beam_1w", "meshtastic", ""), |_| {})
        .await
        .unwrap();
    match rejected {
        RelayOutcome::Rejected { status, error } => {
            assert_eq!(status, 400);
            assert!(error.contains("env_name"));
        }
        other => panic!("Expected a rejection, got {:?}", other),
    }
    server.abort();
}

#[test]
fn test_done_record_shape() {
    let line = StreamRecord::done_with_result(BuildOutcome::TimedOut { seconds: 60 }.to_result()).to_line();
    assert!(line.starts_with("data: {"));
    assert!(line.ends_with("\n\n"));
    let json: Value = serde_json::from_str(line.trim_start_matches("data: ").trim()).unwrap();
    assert_eq!(json["done"], true);
    assert_eq!(json["result"]["success"], false);
    assert_eq!(json["result"]["state"], "timed_out");
}
