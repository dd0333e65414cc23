// Integration tests for the HTTP control API

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use colloquy::conversation::{Dialogue, DialogueSettings};
use colloquy::{create_router, AppState};
use common::{deps, FakeChat, MemoryConnector};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> (Router, Arc<Dialogue>) {
    let (connector, _sessions) = MemoryConnector::failing(u32::MAX);
    let settings = DialogueSettings {
        max_attempts: 1,
        retry_delay: Duration::from_millis(1),
        ..DialogueSettings::default()
    };
    let dialogue = Arc::new(Dialogue::new(
        deps(connector, FakeChat::replying("Happy to help")),
        settings,
    ));
    (create_router(AppState::new(Arc::clone(&dialogue))), dialogue)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Result<(StatusCode, Value)> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })?;

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

    Ok((status, value))
}

#[tokio::test]
async fn test_health_check() -> Result<()> {
    let (app, _) = app();
    let (status, _) = call(&app, "GET", "/health", None).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_commands_without_conversation_conflict() -> Result<()> {
    let (app, _) = app();

    let (status, body) = call(&app, "POST", "/conversation/text", Some(json!({ "text": "hi" }))).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "no conversation is active");

    let (status, _) = call(&app, "POST", "/conversation/speech-mode", None).await?;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&app, "POST", "/conversation/end", None).await?;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = call(&app, "GET", "/conversation/status", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], false);

    Ok(())
}

#[tokio::test]
async fn test_unknown_persona_rejected() -> Result<()> {
    let (app, dialogue) = app();

    let (status, body) = call(&app, "POST", "/conversation/start", Some(json!({ "persona": "cfo" }))).await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap_or("").contains("hr, ceo"));
    assert!(!dialogue.active());

    Ok(())
}

#[tokio::test]
async fn test_conversation_round_trip() -> Result<()> {
    let (app, dialogue) = app();
    let mut view = dialogue.subscribe();

    let (status, body) = call(
        &app,
        "POST",
        "/conversation/start",
        Some(json!({ "persona": "HR", "position": { "x": 1.0, "y": 0.5, "z": 2.0 } })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["persona"], "hr");
    assert!(body["greeting"].as_str().unwrap_or("").starts_with("Hello there"));

    let (_, body) = call(&app, "GET", "/conversation/status", None).await?;
    assert_eq!(body["active"], true);
    assert_eq!(body["persona"], "hr");

    // The realtime endpoint is unreachable, so replies come from the fallback
    common::wait_for(&mut view, |v| v.active && !v.speech_mode).await?;

    let (status, _) = call(&app, "POST", "/conversation/text", Some(json!({ "text": "Hi" }))).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    common::wait_for(&mut view, |v| v.turns.len() == 3).await?;

    let (status, body) = call(&app, "GET", "/conversation/status", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["caption"], "Happy to help");
    assert_eq!(body["speech_state"], "idle");
    assert!(body.get("turns").is_none());

    let (_, body) = call(&app, "GET", "/conversation/transcript", None).await?;
    let roles: Vec<&str> = body
        .as_array()
        .map(|turns| turns.iter().filter_map(|t| t["role"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(roles, vec!["system", "user", "assistant"]);

    let (status, _) = call(&app, "POST", "/conversation/text", Some(json!({ "text": "  " }))).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, "POST", "/conversation/interrupt", None).await?;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = call(&app, "POST", "/conversation/end", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["return_position"], json!({ "x": 1.0, "y": 0.5, "z": 2.0 }));
    assert!(!dialogue.active());

    Ok(())
}
