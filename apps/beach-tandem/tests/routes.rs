//! HTTP surface of a single node.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use beach_tandem::access::StaticAccess;
use beach_tandem::config::Config;
use beach_tandem::handlers::HOOK_SECRET_HEADER;
use beach_tandem::protocol::{ClientAction, ServerEvent};

use common::Cluster;

const SECRET: &str = "hook-secret";

async fn cluster() -> Cluster {
    let config = Config {
        hook_secret: Some(SECRET.into()),
        ..Config::default()
    };
    Cluster::with_access(1, config, Arc::new(StaticAccess::allow_all())).await
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(HOOK_SECRET_HEADER, SECRET);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

#[test_timeout::tokio_timeout_test]
async fn health_reports_node_state() {
    let cluster = cluster().await;
    let node = &cluster.nodes[0];
    let (status, body) = call(node.router(), request(Method::GET, "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node"], node.id());
    assert_eq!(body["collab_enabled"], true);
}

#[test_timeout::tokio_timeout_test]
async fn metrics_endpoint_renders() {
    let cluster = cluster().await;
    let response = cluster.nodes[0]
        .router()
        .oneshot(request(Method::GET, "/metrics", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[test_timeout::tokio_timeout_test]
async fn hooks_require_the_shared_secret() {
    let cluster = cluster().await;
    let unsigned = Request::builder()
        .method(Method::POST)
        .uri("/hooks/items/saved")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "collection": "articles", "item": 1, "timestamp": "t1" }).to_string(),
        ))
        .unwrap();
    let (status, body) = call(cluster.nodes[0].router(), unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHENTICATED");

    let (status, body) = call(
        cluster.nodes[0].router(),
        request(
            Method::POST,
            "/hooks/items/saved",
            Some(json!({ "collection": "articles", "item": 1, "timestamp": "t1" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rooms"], json!([]));
}

#[test_timeout::tokio_timeout_test]
async fn delete_hook_closes_open_rooms() {
    let cluster = cluster().await;
    let mut editor = cluster.connect(0, "ana");
    let room = editor.join("articles", "42").await;

    // numeric item keys address the same room as string ones
    let (status, body) = call(
        cluster.nodes[0].router(),
        request(
            Method::POST,
            "/hooks/items/deleted",
            Some(json!({ "collection": "articles", "item": 42 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rooms"], json!([room.clone()]));
    assert_eq!(editor.next().await, ServerEvent::Delete { room: room.clone() });

    let (status, body) = call(
        cluster.nodes[0].router(),
        request(Method::GET, &format!("/rooms/{room}"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[test_timeout::tokio_timeout_test]
async fn room_snapshot_shows_cluster_state() {
    let cluster = cluster().await;
    let mut editor = cluster.connect(0, "ana");
    let room = editor.join("articles", "1").await;
    editor
        .send(ClientAction::Update {
            room: room.clone(),
            field: "title".into(),
            changes: Some(json!("draft")),
        })
        .await
        .unwrap();

    let (status, body) = call(
        cluster.nodes[0].router(),
        request(Method::GET, &format!("/rooms/{room}"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["collection"], "articles");
    assert_eq!(body["item"], "1");
    assert_eq!(body["changes"], json!({ "title": "draft" }));
    assert_eq!(body["focuses"][editor.id()], "title");
    assert_eq!(body["order"], 1);
    assert_eq!(body["users"].as_array().map(Vec::len), Some(1));
}

#[test_timeout::tokio_timeout_test]
async fn settings_toggle_the_flag() {
    let cluster = cluster().await;
    let mut editor = cluster.connect(0, "ana");
    let room = editor.join("articles", "1").await;

    let (status, body) = call(
        cluster.nodes[0].router(),
        request(Method::PUT, "/settings/collab", Some(json!({ "enabled": false }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
    match editor.next().await {
        ServerEvent::Error { room: errored, .. } => assert_eq!(errored, Some(room)),
        other => panic!("expected error, got {other:?}"),
    }

    let (status, body) = call(
        cluster.nodes[0].router(),
        request(Method::GET, "/settings/collab", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
}
