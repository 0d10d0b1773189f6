use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use claims_dtf::api::{create_router, AppState};
use claims_dtf::claims::{EscalationPolicy, FRAUD_REVIEW_COMPLETED};
use claims_dtf::collaborators::InMemoryMessaging;
use serde_json::Value;
use tower::ServiceExt;
mod common;
use common::{honda_claim, start_claims, ScriptedBackend};

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let location = resp
        .headers()
        .get(header::LOCATION)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, location, body)
}

fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn app_with(policy: EscalationPolicy, fraud_score: f64) -> (Router, common::Harness) {
    let h = start_claims(ScriptedBackend::happy_path(fraud_score), InMemoryMessaging::default(), policy).await;
    let app = create_router(AppState {
        runtime: h.runtime.clone(),
    });
    (app, h)
}

async fn poll_until_terminal(app: &Router, uri: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (status, _, body) = send(app, get(uri)).await;
        assert_eq!(status, StatusCode::OK);
        let rs = body["runtimeStatus"].as_str().unwrap_or_default().to_string();
        if matches!(rs.as_str(), "Completed" | "Failed" | "Terminated") {
            return body;
        }
        assert!(tokio::time::Instant::now() < deadline, "instance never finished: {body}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn health_is_ok() {
    let (app, h) = app_with(EscalationPolicy::default(), 0.1).await;
    let (status, _, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".into()));
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn submitted_claim_is_accepted_and_completes() {
    let (app, h) = app_with(EscalationPolicy::default(), 0.1).await;
    let (status, location, body) = send(&app, post("/api/claims", honda_claim().to_string())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let instance_id = body["instanceId"].as_str().unwrap().to_string();
    let status_uri = body["statusQueryUri"].as_str().unwrap().to_string();
    assert_eq!(status_uri, format!("/api/claims/status/{instance_id}"));
    assert_eq!(location.as_deref(), Some(status_uri.as_str()));

    let done = poll_until_terminal(&app, &status_uri).await;
    assert_eq!(done["instanceId"], instance_id.as_str());
    assert_eq!(done["runtimeStatus"], "Completed");
    assert_eq!(done["customStatus"]["step"], "Completed");
    assert_eq!(done["output"]["decision"], "Approved");
    assert_eq!(done["output"]["canonical"]["vehicle"]["make"], "Honda");
    assert!(done.get("error").is_none());
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn malformed_or_anonymous_claims_are_rejected() {
    let (app, h) = app_with(EscalationPolicy::default(), 0.1).await;
    for body in ["not json", "", r#"{"policyId": "P-12345"}"#, r#"{"claimId": "  "}"#] {
        let (status, location, resp) = send(&app, post("/api/claims", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body:?}");
        assert!(location.is_none());
        assert_eq!(resp["error"], "Invalid request body.");
    }
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn unknown_instance_is_not_found() {
    let (app, h) = app_with(EscalationPolicy::default(), 0.1).await;
    let (status, _, body) = send(&app, get("/api/claims/status/missing-id")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No orchestration found with instance Id = missing-id");

    let (status, _, _) = send(
        &app,
        post(&format!("/api/claims/missing-id/events/{FRAUD_REVIEW_COMPLETED}"), "true"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn review_event_is_delivered_over_http() {
    let policy = EscalationPolicy {
        fraud_threshold: 0.6,
        review_window: Duration::from_secs(60),
    };
    let (app, h) = app_with(policy, 0.9).await;
    let (_, _, body) = send(&app, post("/api/claims", honda_claim().to_string())).await;
    let instance_id = body["instanceId"].as_str().unwrap().to_string();
    assert!(common::wait_for_subscription(h.store.clone(), &instance_id, FRAUD_REVIEW_COMPLETED, 5_000).await);

    let event_uri = format!("/api/claims/{instance_id}/events/{FRAUD_REVIEW_COMPLETED}");
    let (status, _, _) = send(&app, post(&event_uri, "{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, post(&event_uri, r#"{"approved": false, "reviewer": "kim"}"#)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let done = poll_until_terminal(&app, &format!("/api/claims/status/{instance_id}")).await;
    assert_eq!(done["output"]["decision"], "Rejected");
    assert_eq!(done["output"]["escalation"]["outcome"], "Reviewed");

    // The instance is finished, so further events conflict
    let (status, _, _) = send(&app, post(&event_uri, "true")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn terminate_over_http_stops_a_waiting_claim() {
    let policy = EscalationPolicy {
        fraud_threshold: 0.6,
        review_window: Duration::from_secs(60),
    };
    let (app, h) = app_with(policy, 0.9).await;
    let (_, _, body) = send(&app, post("/api/claims", honda_claim().to_string())).await;
    let instance_id = body["instanceId"].as_str().unwrap().to_string();
    assert!(common::wait_for_subscription(h.store.clone(), &instance_id, FRAUD_REVIEW_COMPLETED, 5_000).await);

    let uri = format!("/api/claims/{instance_id}/terminate");
    let (status, _, _) = send(&app, post(&uri, "fraud confirmed offline")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let done = poll_until_terminal(&app, &format!("/api/claims/status/{instance_id}")).await;
    assert_eq!(done["runtimeStatus"], "Terminated");

    let (status, _, _) = send(&app, post(&uri, "")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    h.runtime.shutdown().await;
}
