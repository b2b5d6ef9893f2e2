//! End-to-end tests: REST API and gateway on one listener, mock backend.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use roomforge::prelude::*;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// =========================================================================
// Fixtures
// =========================================================================

const TEMPLATES: &str = r#"[
    {
        "name": "desktop",
        "image": "example/desktop:1",
        "env": [ { "name": "PASSWORD", "default": "changeme" } ],
        "ports": [ { "container_port": 8080 } ]
    }
]"#;

struct TestServer {
    addr: SocketAddr,
    backend: Arc<MockBackend>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), RoomforgeError>>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn stop(mut self) -> Result<(), RoomforgeError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.unwrap()
    }
}

async fn start(ports: u16) -> TestServer {
    let backend = Arc::new(MockBackend::new());
    let config = ManagerConfig {
        port_range: 45000..=45000 + ports - 1,
        readiness_timeout: Duration::from_millis(500),
        readiness_poll_interval: Duration::from_millis(5),
        reconcile_interval: Duration::from_millis(50),
        ..ManagerConfig::default()
    };
    let server = RoomforgeServer::builder()
        .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .manager_config(config)
        .backend(backend.clone())
        .catalog(TemplateCatalog::from_json(TEMPLATES).unwrap())
        .build()
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async move {
        let _ = rx.await;
    }));
    TestServer {
        addr,
        backend,
        shutdown: Some(tx),
        handle,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

async fn create(server: &TestServer, name: &str) -> reqwest::Response {
    client()
        .post(server.url("/api/rooms"))
        .json(&json!({ "name": name, "template": "desktop" }))
        .send()
        .await
        .unwrap()
}

// =========================================================================
// Rooms
// =========================================================================

#[tokio::test]
async fn test_create_get_list_remove() {
    let server = start(4).await;

    let resp = create(&server, "alice").await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let room: Value = resp.json().await.unwrap();
    assert_eq!(room["name"], "alice");
    assert_eq!(room["status"], "Running");
    assert_eq!(room["endpoint"]["port"], 45000);
    let id = room["id"].as_str().unwrap().to_string();

    let got: Value = client()
        .get(server.url(&format!("/api/rooms/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(got["id"], id.as_str());

    let list: Vec<Value> = client()
        .get(server.url("/api/rooms"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.len(), 1);

    let resp = client()
        .delete(server.url(&format!("/api/rooms/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(server.backend.instance_count(), 0);

    let resp = client()
        .get(server.url(&format!("/api/rooms/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_name_is_409() {
    let server = start(4).await;
    assert_eq!(create(&server, "alice").await.status(), StatusCode::CREATED);

    let resp = create(&server, "alice").await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "conflict");
    assert!(body["message"].as_str().unwrap().contains("alice"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_port_exhaustion_is_503() {
    let server = start(1).await;
    assert_eq!(create(&server, "alice").await.status(), StatusCode::CREATED);

    let resp = create(&server, "bob").await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "resource_exhausted");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_start_restart() {
    let server = start(4).await;
    let room: Value = create(&server, "alice").await.json().await.unwrap();
    let id = room["id"].as_str().unwrap().to_string();

    let stopped: Value = client()
        .post(server.url(&format!("/api/rooms/{id}/stop")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stopped["status"], "Stopped");
    assert!(stopped["endpoint"].is_null());

    let started: Value = client()
        .post(server.url(&format!("/api/rooms/{id}/start")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(started["status"], "Running");

    let restarted: Value = client()
        .post(server.url(&format!("/api/rooms/{id}/restart")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(restarted["status"], "Running");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_bad_requests_are_400() {
    let server = start(4).await;

    let resp = client()
        .get(server.url("/api/rooms/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid");

    let resp = client()
        .post(server.url("/api/rooms"))
        .header("content-type", "application/json")
        .body("{\"name\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client()
        .post(server.url("/api/rooms"))
        .json(&json!({ "name": "alice", "template": "desktop", "overrides": { "env": { "NOPE": "1" } } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_template_is_404() {
    let server = start(4).await;
    let resp = client()
        .post(server.url("/api/rooms"))
        .json(&json!({ "name": "alice", "template": "missing" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(server.backend.instance_count(), 0);
    server.stop().await.unwrap();
}

// =========================================================================
// Templates, health, gateway
// =========================================================================

#[tokio::test]
async fn test_templates_and_health() {
    let server = start(4).await;

    let templates: Vec<Value> = client()
        .get(server.url("/api/templates"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0]["name"], "desktop");

    create(&server, "alice").await;
    let health: Value = client()
        .get(server.url("/api/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["backend"], "mock");
    assert_eq!(health["rooms"], 1);
    assert_eq!(health["routes_ready"], 1);
    assert_eq!(health["available_ports"], 3);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_gateway_shares_the_listener() {
    let server = start(4).await;

    let resp = client()
        .get(server.url("/rooms/ghost/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let room: Value = create(&server, "alice").await.json().await.unwrap();
    let id = room["id"].as_str().unwrap().to_string();
    client()
        .post(server.url(&format!("/api/rooms/{id}/stop")))
        .send()
        .await
        .unwrap();

    let resp = client()
        .get(server.url("/rooms/alice/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconciler_runs_in_background() {
    let server = start(4).await;
    let room: Value = create(&server, "alice").await.json().await.unwrap();
    let id: RoomId = room["id"].as_str().unwrap().parse().unwrap();

    let backend_ref = roomforge_protocol::BackendRef::new(room["backend_ref"].as_str().unwrap());
    assert!(server.backend.vanish(&backend_ref));

    let mut status = Value::Null;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let got: Value = client()
            .get(server.url(&format!("/api/rooms/{id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        status = got["status"].clone();
        if status == "Error" {
            break;
        }
    }
    assert_eq!(status, "Error");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_templates_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(TEMPLATES.as_bytes()).unwrap();

    let catalog = TemplateCatalog::load(file.path()).unwrap();
    assert!(catalog.get("desktop").is_some());
}

#[tokio::test]
async fn test_api_prefix_is_reserved() {
    let result = RoomforgeServer::builder()
        .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .backend(Arc::new(MockBackend::new()))
        .gateway_config(GatewayConfig {
            prefix: "api".into(),
            ..GatewayConfig::default()
        })
        .build()
        .await;
    assert!(matches!(result, Err(RoomforgeError::Gateway(_))));
}
