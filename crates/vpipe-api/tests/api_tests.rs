//! Router tests against in-memory backends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use futures_util::StreamExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;
use vpipe_api::{create_router, ApiConfig, AppState};
use vpipe_models::{JobId, StatusUpdateMessage, TranscodeStatus, VideoRecord, VideoStatus};
use vpipe_pipeline::PipelineConfig;
use vpipe_queue::MemoryBroker;
use vpipe_records::{MemoryVideoRepository, VideoRepository};
use vpipe_storage::{PresignedUpload, StorageResult, UploadUrlSigner};

const SECRET: &str = "test-secret";
const TRANSCODE_QUEUE: &str = "video.transcode";

struct LocalSigner;

#[async_trait]
impl UploadUrlSigner for LocalSigner {
    async fn presign_upload(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> StorageResult<PresignedUpload> {
        Ok(PresignedUpload {
            url: format!("http://localhost:9000/video/{key}?X-Amz-Signature=test"),
            key: key.to_string(),
            expires_at: Utc::now() + chrono::Duration::from_std(expires_in).unwrap(),
        })
    }

    fn bucket(&self) -> &str {
        "video"
    }
}

struct TestApp {
    router: Router,
    state: AppState,
    broker: Arc<MemoryBroker>,
    repo: Arc<MemoryVideoRepository>,
}

fn app() -> TestApp {
    let broker = Arc::new(MemoryBroker::new());
    let repo = Arc::new(MemoryVideoRepository::new());
    let config = ApiConfig {
        jwt_secret: SECRET.to_string(),
        ..ApiConfig::default()
    };
    let state = AppState::new(
        config,
        &PipelineConfig::default(),
        TRANSCODE_QUEUE,
        broker.clone(),
        Arc::new(LocalSigner),
        repo.clone(),
    );
    TestApp {
        router: create_router(state.clone(), None),
        state,
        broker,
        repo,
    }
}

fn token(uid: &str) -> String {
    encode(
        &Header::default(),
        &json!({"id": uid, "exp": Utc::now().timestamp() + 600}),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn post_json(uri: &str, body: Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json");
    if let Some(bearer) = bearer {
        builder = builder.header("Authorization", format!("Bearer {bearer}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn seed(repo: &MemoryVideoRepository, id: &str, status: VideoStatus) {
    repo.create(&VideoRecord::processing(JobId::from(id), "user-1", "t", ""))
        .await
        .unwrap();
    if status != VideoStatus::Processing {
        repo.update_status(&JobId::from(id), status).await.unwrap();
    }
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(body_json(response).await["status"], "healthy");
}

#[tokio::test]
async fn test_ready_reports_broker_outage() {
    let app = app();
    let response = app
        .router
        .clone()
        .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    app.broker.set_unavailable(true);
    let response = app
        .router
        .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["checks"]["broker"]["status"], "error");
    assert_eq!(body["checks"]["records"]["status"], "ok");
}

#[tokio::test]
async fn test_upload_url_requires_auth() {
    let app = app();
    let response = app
        .router
        .oneshot(post_json("/api/upload-url", json!({"title": "x"}), None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_upload_url_creates_record() {
    let app = app();
    let response = app
        .router
        .oneshot(post_json(
            "/api/upload-url",
            json!({"title": "Holiday", "description": "beach"}),
            Some(&token("user-1")),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let job_id = body["jobId"].as_str().unwrap().to_string();
    assert!(body["uploadUrl"]
        .as_str()
        .unwrap()
        .contains(&format!("/video/{job_id}/original")));
    assert!(body["expiresAt"].is_string());

    let record = app.repo.get(&JobId::from(job_id)).await.unwrap().unwrap();
    assert_eq!(record.owner_id, "user-1");
    assert_eq!(record.status, VideoStatus::Processing);
}

#[tokio::test]
async fn test_upload_url_validates_title() {
    let app = app();
    let response = app
        .router
        .oneshot(post_json(
            "/api/upload-url",
            json!({"title": ""}),
            Some(&token("user-1")),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    assert!(app.repo.is_empty().await);
}

#[tokio::test]
async fn test_transcode_is_queued() {
    let app = app();
    seed(&app.repo, "abc123", VideoStatus::Processing).await;

    let response = app
        .router
        .oneshot(post_json(
            "/api/transcode",
            json!({"videoID": "abc123"}),
            Some(&token("user-1")),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        body_json(response).await,
        json!({"jobId": "abc123", "status": "queued"})
    );
    let published = app.broker.published(TRANSCODE_QUEUE);
    assert_eq!(published.len(), 1);
    let message: Value = serde_json::from_str(&published[0]).unwrap();
    assert_eq!(message["path"], "abc123/original");
}

#[tokio::test]
async fn test_transcode_of_public_job_conflicts() {
    let app = app();
    seed(&app.repo, "done", VideoStatus::Public).await;

    let response = app
        .router
        .oneshot(post_json(
            "/api/transcode",
            json!({"jobId": "done"}),
            Some(&token("user-1")),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "ALREADY_TRANSCODED");
    assert!(app.broker.published(TRANSCODE_QUEUE).is_empty());
}

#[tokio::test]
async fn test_transcode_hides_broker_failure() {
    let app = app();
    seed(&app.repo, "abc123", VideoStatus::Processing).await;
    app.broker.set_unavailable(true);

    let response = app
        .router
        .oneshot(post_json(
            "/api/transcode",
            json!({"jobId": "abc123"}),
            Some(&token("user-1")),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(response).await["detail"],
        "Processing failed, try again"
    );
}

#[tokio::test]
async fn test_sse_for_finished_job_sends_completion_and_ends() {
    let app = app();
    seed(&app.repo, "done", VideoStatus::Public).await;

    let uri = format!("/sse/done?token={}", token("user-1"));
    let response = app
        .router
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("event stream did not end")
    .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    assert!(text.contains("event: status"));
    assert!(text.contains(r#""jobId":"done""#));
    assert!(text.contains(r#""status":"COMPLETED""#));
}

#[tokio::test]
async fn test_sse_requires_auth() {
    let app = app();
    let response = app
        .router
        .oneshot(Request::get("/sse/done").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_sse_ends_on_shutdown() {
    let app = app();
    seed(&app.repo, "stuck", VideoStatus::Processing).await;

    let uri = format!("/sse/stuck?token={}", token("user-1"));
    let response = app
        .router
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    app.state.begin_shutdown();
    tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("event stream outlived shutdown")
    .unwrap();
}

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serve the router on an ephemeral port.
async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn connect_progress(addr: SocketAddr, job: &str) -> WsClient {
    let url = format!("ws://{addr}/ws/progress/{job}?token={}", token("user-1"));
    let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    socket
}

/// Next frame other than ping/pong; `None` once the connection is gone.
async fn next_frame(socket: &mut WsClient) -> Option<WsMessage> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(frame)) => return Some(frame),
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await
    .expect("server sent nothing")
}

fn text_json(frame: Option<WsMessage>) -> Value {
    match frame {
        Some(WsMessage::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

fn assert_closed(frame: Option<WsMessage>) {
    assert!(
        matches!(frame, Some(WsMessage::Close(_)) | None),
        "expected close, got {frame:?}"
    );
}

async fn wait_for_subscribers(app: &TestApp, job: &str, count: usize) {
    let job_id = JobId::from(job);
    tokio::time::timeout(Duration::from_secs(5), async {
        while app.state.relay.registry().subscriber_count(&job_id) != count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("subscriber count never settled");
}

#[tokio::test]
async fn test_ws_finished_job_sends_completion_then_closes() {
    let app = app();
    seed(&app.repo, "done", VideoStatus::Public).await;
    let addr = serve(app.router.clone()).await;

    let mut socket = connect_progress(addr, "done").await;

    let frame = text_json(next_frame(&mut socket).await);
    assert_eq!(frame["jobId"], "done");
    assert_eq!(frame["status"], "COMPLETED");
    assert_closed(next_frame(&mut socket).await);
    wait_for_subscribers(&app, "done", 0).await;
}

#[tokio::test]
async fn test_ws_forwards_each_status_then_closes_after_terminal() {
    let app = app();
    seed(&app.repo, "live", VideoStatus::Processing).await;
    let addr = serve(app.router.clone()).await;

    let mut socket = connect_progress(addr, "live").await;
    wait_for_subscribers(&app, "live", 1).await;

    let progress = StatusUpdateMessage::progress(
        JobId::from("live"),
        TranscodeStatus::Transcoding,
        std::collections::BTreeMap::from([("720p".to_string(), 50.0)]),
    );
    app.state.relay.process(&progress).await.unwrap();
    app.state
        .relay
        .process(&StatusUpdateMessage::completed(JobId::from("live")))
        .await
        .unwrap();

    let first = text_json(next_frame(&mut socket).await);
    assert_eq!(first["status"], "TRANSCODING");
    assert_eq!(first["progressByResolution"]["720p"], 50.0);
    let second = text_json(next_frame(&mut socket).await);
    assert_eq!(second["status"], "COMPLETED");
    assert_closed(next_frame(&mut socket).await);

    let record = app.repo.get(&JobId::from("live")).await.unwrap().unwrap();
    assert_eq!(record.status, VideoStatus::Public);
}

#[tokio::test]
async fn test_ws_client_close_unsubscribes() {
    let app = app();
    seed(&app.repo, "leaving", VideoStatus::Processing).await;
    let addr = serve(app.router.clone()).await;

    let mut socket = connect_progress(addr, "leaving").await;
    wait_for_subscribers(&app, "leaving", 1).await;

    socket.close(None).await.unwrap();
    wait_for_subscribers(&app, "leaving", 0).await;
}

#[tokio::test]
async fn test_ws_closes_on_shutdown() {
    let app = app();
    seed(&app.repo, "stuck", VideoStatus::Processing).await;
    let addr = serve(app.router.clone()).await;

    let mut socket = connect_progress(addr, "stuck").await;
    wait_for_subscribers(&app, "stuck", 1).await;

    app.state.begin_shutdown();
    match next_frame(&mut socket).await {
        Some(WsMessage::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected a going-away close, got {other:?}"),
    }
    wait_for_subscribers(&app, "stuck", 0).await;
}
