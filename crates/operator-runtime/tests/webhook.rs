//! Admission requests through the HTTP router.

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use operator_runtime::webhook::{AdmissionRequest, AdmissionResponse, MAX_BODY_BYTES, Operation, REQUEST_TIMEOUT};
use operator_runtime::{Context, WebhookServer};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tower::ServiceExt;

fn server() -> WebhookServer {
    let server = WebhookServer::new(SocketAddr::from(([127, 0, 0, 1], 0)));
    server
        .register("/validate", |_ctx: Context, _req: AdmissionRequest| async {
            Ok::<_, anyhow::Error>(AdmissionResponse::denied("nope"))
        })
        .unwrap();
    server
}

fn post(path: &str, content_type: &str, body: impl Into<Body>) -> Request<Body> {
    Request::post(path)
        .header(header::CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap()
}

async fn send(server: &WebhookServer, request: Request<Body>) -> Response {
    server.router(Context::root()).oneshot(request).await.unwrap()
}

async fn review(response: Response) -> Value {
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_denied_review() {
    let server = server();
    let body = json!({"request": {"uid": "x"}}).to_string();
    let value = review(send(&server, post("/validate", "application/json", body)).await).await;

    assert_eq!(value["apiVersion"], "admission.k8s.io/v1");
    assert_eq!(value["kind"], "AdmissionReview");
    assert_eq!(
        value["response"],
        json!({
            "uid": "x",
            "allowed": false,
            "status": {"code": 403, "reason": "Forbidden", "message": "nope"}
        })
    );
}

#[tokio::test]
async fn test_wrong_content_type_is_embedded_400() {
    let server = server();
    let body = json!({"request": {"uid": "x"}}).to_string();
    let value = review(send(&server, post("/validate", "text/plain", body)).await).await;

    assert_eq!(value["response"]["allowed"], false);
    assert_eq!(
        value["response"]["status"],
        json!({"code": 400, "message": "received unexpected content-type"})
    );
}

#[tokio::test]
async fn test_content_type_must_match_exactly() {
    let server = server();
    let body = json!({"request": {"uid": "x"}}).to_string();
    let response = send(&server, post("/validate", "application/json; charset=utf-8", body)).await;
    assert_eq!(review(response).await["response"]["status"]["code"], 400);
}

#[tokio::test]
async fn test_unknown_path_is_404_without_body() {
    let server = server();
    let response = send(&server, post("/mutate", "application/json", "{}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_malformed_json_is_embedded_400() {
    let server = server();
    let value = review(send(&server, post("/validate", "application/json", "{not json")).await).await;
    assert_eq!(value["response"]["allowed"], false);
    assert_eq!(value["response"]["status"]["code"], 400);
}

#[tokio::test]
async fn test_oversized_body_is_embedded_400() {
    let server = server();
    let padding = "a".repeat(MAX_BODY_BYTES + 1);
    let body = json!({"request": {"uid": "x", "object": {"data": padding}}}).to_string();
    let value = review(send(&server, post("/validate", "application/json", body)).await).await;
    assert_eq!(value["response"]["status"]["code"], 400);
}

async fn failing(_ctx: Context, _req: AdmissionRequest) -> anyhow::Result<AdmissionResponse> {
    Err(anyhow::anyhow!("database password is hunter2"))
}

async fn panicking(_ctx: Context, _req: AdmissionRequest) -> anyhow::Result<AdmissionResponse> {
    panic!("hook bug")
}

#[tokio::test]
async fn test_hook_error_is_500_without_message() {
    let server = WebhookServer::new(SocketAddr::from(([127, 0, 0, 1], 0)));
    server.register("/fail", failing).unwrap();
    server.register("/panic", panicking).unwrap();

    for path in ["/fail", "/panic"] {
        let body = json!({"request": {"uid": "u1"}}).to_string();
        let value = review(send(&server, post(path, "application/json", body)).await).await;
        assert_eq!(
            value["response"],
            json!({"uid": "u1", "allowed": false, "status": {"code": 500}}),
            "{path}"
        );
    }
}

#[tokio::test]
async fn test_mutating_hook_patch_is_completed() {
    let server = WebhookServer::new(SocketAddr::from(([127, 0, 0, 1], 0)));
    server
        .register("/mutate", |ctx: Context, req: AdmissionRequest| async move {
            assert!(!ctx.is_cancelled());
            assert_eq!(req.operation, Some(Operation::Create));
            Ok::<_, anyhow::Error>(AdmissionResponse::allowed()
                .with_patches([json!({"op": "add", "path": "/metadata/labels/managed", "value": "true"})])
                .with_warning("label added"))
        })
        .unwrap();

    let body = json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {"uid": "m1", "operation": "CREATE", "object": {"metadata": {"labels": {}}}}
    })
    .to_string();
    let value = review(send(&server, post("/mutate", "application/json", body)).await).await;
    let response = &value["response"];
    assert_eq!(response["uid"], "m1");
    assert_eq!(response["allowed"], true);
    assert_eq!(response["status"]["code"], 200);
    assert_eq!(response["patchType"], "JSONPatch");
    assert_eq!(response["warnings"], json!(["label added"]));
    assert!(response.get("patches").is_none());

    use base64::Engine;
    let patch = base64::engine::general_purpose::STANDARD
        .decode(response["patch"].as_str().unwrap())
        .unwrap();
    let patch: Value = serde_json::from_slice(&patch).unwrap();
    assert_eq!(patch[0]["path"], "/metadata/labels/managed");
}

#[tokio::test]
async fn test_boolean_verdicts() {
    let server = WebhookServer::new(SocketAddr::from(([127, 0, 0, 1], 0)));
    server
        .register("/allow", |_ctx: Context, _req: AdmissionRequest| async {
            Ok::<AdmissionResponse, anyhow::Error>(true.into())
        })
        .unwrap();

    let body = json!({"request": {"uid": "b1"}}).to_string();
    let value = review(send(&server, post("/allow", "application/json", body)).await).await;
    assert_eq!(
        value["response"],
        json!({"uid": "b1", "allowed": true, "status": {"code": 200}})
    );
}

#[tokio::test]
async fn test_hook_registered_after_router_built() {
    let server = server();
    let router = server.router(Context::root());
    server
        .register("/late", |_ctx: Context, _req: AdmissionRequest| async {
            Ok::<_, anyhow::Error>(AdmissionResponse::allowed())
        })
        .unwrap();

    let body = json!({"request": {"uid": "l1"}}).to_string();
    let response = router.oneshot(post("/late", "application/json", body)).await.unwrap();
    assert_eq!(review(response).await["response"]["allowed"], true);
}

#[tokio::test(start_paused = true)]
async fn test_slow_hook_times_out() {
    let server = server();
    server
        .register("/slow", |_ctx: Context, _req: AdmissionRequest| async {
            tokio::time::sleep(REQUEST_TIMEOUT + Duration::from_secs(5)).await;
            Ok::<_, anyhow::Error>(AdmissionResponse::allowed())
        })
        .unwrap();

    let started = tokio::time::Instant::now();
    let body = json!({"request": {"uid": "s1"}}).to_string();
    let response = send(&server, post("/slow", "application/json", body)).await;

    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert!(started.elapsed() >= REQUEST_TIMEOUT);
    assert!(started.elapsed() < REQUEST_TIMEOUT + Duration::from_secs(5));
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(serde_json::from_slice::<Value>(&body).is_err());
}

#[tokio::test]
async fn test_served_over_tcp() {
    let server = server();
    let ctx = Context::root();
    let task = server.start(ctx.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/validate"))
        .json(&json!({"request": {"uid": "t1"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let value: Value = response.json().await.unwrap();
    assert_eq!(value["response"]["uid"], "t1");
    assert_eq!(value["response"]["status"]["code"], 403);

    ctx.cancel("done");
    task.await.unwrap().unwrap();
}
