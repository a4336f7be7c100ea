//! API endpoint integration tests

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use base64::Engine;
use tower::ServiceExt;
use voice_relay::api::{ApiState, router};
use voice_relay::voice::pcm16_to_wav;

mod common;
use common::{EchoSynthesizer, Script, ScriptedGenerator, ScriptedTranscriber, services};

/// Build a test API router around scripted collaborators
fn build_test_router(transcript: &str, reply: &[&str]) -> (axum::Router, Arc<ScriptedTranscriber>) {
    let transcriber = ScriptedTranscriber::new(&[transcript]);
    let state = ApiState {
        services: services(
            transcriber.clone(),
            ScriptedGenerator::new(Script::new(reply)),
            EchoSynthesizer::new(),
        ),
        first_sentence_deadline: Duration::from_secs(1),
    };
    (router(Arc::new(state)), transcriber)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _) = build_test_router("", &[]);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_asr_decodes_base64_wav() {
    let (app, transcriber) = build_test_router("hello there", &[]);
    let wav = pcm16_to_wav(&[0_u8; 640], 16_000).unwrap();
    let payload = serde_json::json!({
        "wav": base64::engine::general_purpose::STANDARD.encode(wav),
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/asr")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["code"], 0);
    assert_eq!(json["res"], "hello there");

    // The WAV header is stripped before recognition
    assert_eq!(*transcriber.calls.lock().unwrap(), vec![640]);
}

#[tokio::test]
async fn test_asr_reports_bad_base64_in_body() {
    let (app, _) = build_test_router("unused", &[]);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/asr")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"wav":"%%%not base64%%%"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["code"], 1);
    assert!(json["msg"].as_str().unwrap().contains("base64"));
    assert!(json.get("res").is_none());
}

#[tokio::test]
async fn test_process_audio_json() {
    let (app, _) = build_test_router("What time is it?", &["It is ", "noon[NNNN]."]);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/process_audio")
                .body(Body::from(vec![0_u8; 3200]))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["code"], 0);
    assert_eq!(json["user_text"], "What time is it?");
    assert_eq!(json["ai_text"], "It is noon.");
    assert!(json["timing"]["total_duration"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn test_process_audio_streams_synthesized_reply() {
    let (app, _) = build_test_router("Hi", &["Hello, ", "friend."]);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/process_audio?response_format=audio")
                .body(Body::from(vec![0_u8; 320]))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
    assert!(response.headers().contains_key("x-session-id"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"audio:Hello,audio:friend.");
}

#[tokio::test]
async fn test_process_audio_rejects_empty_body() {
    let (app, _) = build_test_router("unused", &[]);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/process_audio")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_process_audio_unrecognized_speech() {
    let (app, _) = build_test_router("   ", &["unused."]);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/process_audio")
                .body(Body::from(vec![0_u8; 320]))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "recognition_failed");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (app, _) = build_test_router("", &[]);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/nonexistent")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
