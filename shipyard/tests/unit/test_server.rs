//! HTTP surface tests, driven in-process

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use shipyard::models::log_event::{LogEvent, LogSource};
use shipyard::models::project::NewProject;
use shipyard::server::serve::{api_router, proxy_router};
use shipyard::server::state::{ProxyState, ServerState};
use shipyard::storage::blob::{BlobStore, MemoryBlobStore};
use shipyard::storage::store::MemoryStore;
use shipyard::transport::durable::{LogStore, MemoryLogStore};
use shipyard::transport::live::{MemoryBus, PubSubBus};
use shipyard::transport::topics::Topics;
use tokio_tungstenite::tungstenite::protocol::Message;
use tower::ServiceExt;
use uuid::Uuid;

use crate::test_orchestrator::{orchestrator, ScriptedSubstrate};

struct TestApi {
    router: Router,
    logs: Arc<MemoryLogStore>,
}

fn api() -> TestApi {
    let store = Arc::new(MemoryStore::new());
    let substrate = Arc::new(ScriptedSubstrate::new());
    let orchestrator = Arc::new(orchestrator(store, substrate));
    let logs = Arc::new(MemoryLogStore::new());
    let state = ServerState::new(orchestrator, logs.clone(), None);
    TestApi {
        router: api_router(Arc::new(state)),
        logs,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let api = api();
    let (status, body) = send(&api.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "shipyard");
}

#[tokio::test]
async fn test_project_and_deployment_flow() {
    let api = api();

    let (status, project) = send(
        &api.router,
        post(
            "/projects",
            json!({"name": "demo", "repositoryUrl": "https://example.com/repo.git"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(project["name"], "demo");
    let project_id = project["id"].as_str().unwrap().to_string();
    let subdomain = project["subdomain"].as_str().unwrap().to_string();

    let (status, fetched) = send(&api.router, get(&format!("/projects/{}", project_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["subdomain"], subdomain.as_str());

    let (status, ticket) = send(&api.router, post("/deployments", json!({"projectId": project_id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ticket["deployment"]["status"], "QUEUED");
    assert_eq!(ticket["url"], format!("http://{}.localhost:9000", subdomain));

    let (status, error) = send(&api.router, post("/deployments", json!({"projectId": project_id}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(error["error"].as_str().unwrap().contains("active deployment"));

    let deployment_id = ticket["deployment"]["id"].as_str().unwrap();
    let (status, deployment) = send(&api.router, get(&format!("/deployments/{}", deployment_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deployment["status"], "IN_PROGRESS");
}

#[tokio::test]
async fn test_request_errors() {
    let api = api();

    let (status, _) = send(&api.router, post("/projects", json!({"name": "", "repositoryUrl": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&api.router, post("/projects", json!({"name": "demo"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &api.router,
        post("/deployments", json!({"projectId": Uuid::new_v4()})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&api.router, get(&format!("/deployments/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deployment_logs() {
    let api = api();

    let (_, project) = send(
        &api.router,
        post(
            "/projects",
            json!({"name": "demo", "repositoryUrl": "https://example.com/repo.git"}),
        ),
    )
    .await;
    let (_, ticket) = send(&api.router, post("/deployments", json!({"projectId": project["id"]}))).await;
    let deployment_id: Uuid = ticket["deployment"]["id"].as_str().unwrap().parse().unwrap();

    for (sequence, text) in ["starting build", "deployment complete"].iter().enumerate() {
        api.logs
            .insert(&LogEvent {
                event_id: Uuid::new_v4(),
                deployment_id,
                project_id: Uuid::nil(),
                sequence: sequence as u64,
                timestamp: Utc::now(),
                source: LogSource::System,
                text: text.to_string(),
            })
            .await
            .unwrap();
    }

    let (status, body) = send(&api.router, get(&format!("/deployments/{}/logs", deployment_id))).await;
    assert_eq!(status, StatusCode::OK);
    let texts: Vec<&str> = body["logs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["starting build", "deployment complete"]);

    let (status, _) = send(&api.router, get(&format!("/deployments/{}/logs", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_proxy_serves_published_artifacts() {
    let store = Arc::new(MemoryStore::new());
    let substrate = Arc::new(ScriptedSubstrate::new());
    let orchestrator = orchestrator(store.clone(), substrate);
    let project = orchestrator
        .create_project(NewProject {
            name: "demo".to_string(),
            repository_url: "https://example.com/repo.git".to_string(),
            subdomain: Some("my-site".to_string()),
        })
        .await
        .unwrap();

    let blob = Arc::new(MemoryBlobStore::new());
    blob.put(
        "outputs",
        &format!("__outputs/{}/index.html", project.id),
        b"<h1>demo</h1>".to_vec(),
        "text/html",
    )
    .await
    .unwrap();

    let router = proxy_router(Arc::new(ProxyState {
        store,
        blob,
        bucket: "outputs".to_string(),
        directory_prefix: "__outputs".to_string(),
    }));

    let request = |host: &str, path: &str| {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    };

    let response = router
        .clone()
        .oneshot(request("my-site.localhost:9000", "/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"<h1>demo</h1>");

    let missing = router
        .clone()
        .oneshot(request("my-site.localhost:9000", "/missing.js"))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let unknown = router
        .clone()
        .oneshot(request("nobody.localhost:9000", "/"))
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

/// Serve the API with live logs on an ephemeral port
async fn live_api(bus: Arc<MemoryBus>, send_timeout: Duration) -> SocketAddr {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(orchestrator(store, Arc::new(ScriptedSubstrate::new())));
    let mut state = ServerState::new(orchestrator, Arc::new(MemoryLogStore::new()), Some(bus as Arc<dyn PubSubBus>));
    state.send_timeout = send_timeout;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api_router(Arc::new(state))).await.unwrap();
    });
    addr
}

async fn next_json<S>(socket: &mut S) -> Value
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no message from the relay")
            .expect("relay closed the socket")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_silent_viewer_is_disconnected() {
    let addr = live_api(Arc::new(MemoryBus::default()), Duration::from_millis(200)).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/logs/ws", addr))
        .await
        .unwrap();

    // Never subscribe
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "subscribe timed out");
}

#[tokio::test]
async fn test_viewer_subscribes_and_receives_logs() {
    let bus = Arc::new(MemoryBus::default());
    let addr = live_api(bus.clone(), Duration::from_secs(2)).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/logs/ws", addr))
        .await
        .unwrap();

    let subscribe = |channel: &str| {
        Message::Text(json!({"type": "subscribe", "channel": channel}).to_string().into())
    };

    // Channels outside the log namespace are refused without closing the socket
    socket.send(subscribe("shipyard/secrets/#")).await.unwrap();
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "unknown channel: shipyard/secrets/#");

    let project_id = Uuid::new_v4();
    let channel = Topics::project_logs(&project_id);
    socket.send(subscribe(&channel)).await.unwrap();
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "joined");
    assert_eq!(reply["channel"], channel.as_str());

    let topic = Topics::deployment_logs(&project_id, &Uuid::new_v4());
    bus.publish(&topic, r#"{"text":"hello"}"#).await.unwrap();
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "log");
    assert_eq!(reply["channel"], topic.as_str());
    assert_eq!(reply["event"]["text"], "hello");
}
