mod common;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;

use chatllm::config::FALLBACK_MODELS;
use chatllm::models::Role;
use chatllm::providers::ProviderError;
use chatllm::services::images::ImageSize;
use chatllm::services::{ChatEvent, EventSink, Severity};
use chatllm::PipelineError;

use common::{local_session, openai_endpoint, serve, Recorder};

const SSE_BODY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
    "data: [DONE]\n\n",
);

async fn openai(
    State(recorder): State<Recorder>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = recorder.record(method, &uri, &headers, body);
    match request.path.as_str() {
        "/v1/models" => Json(json!({
            "object": "list",
            "data": [
                { "id": "gpt-4o" },
                { "id": "dall-e-3", "endpoint": ["/v1/images/generations"] },
            ]
        }))
        .into_response(),
        "/v1/chat/completions" => {
            let body = request.json();
            if body["stream"] == json!(true) {
                return ([(header::CONTENT_TYPE, "text/event-stream")], SSE_BODY).into_response();
            }
            let last = body["messages"]
                .as_array()
                .and_then(|messages| messages.last())
                .and_then(|m| m["content"].as_str())
                .unwrap_or_default()
                .to_string();
            let model = body["model"].clone();
            Json(json!({
                "model": model,
                "choices": [{ "message": { "role": "assistant", "content": format!("Echo: {}", last) } }],
                "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
            }))
            .into_response()
        }
        "/v1/images/generations" => {
            Json(json!({ "data": [{ "url": "https://images.example/cat.png" }] })).into_response()
        }
        "/v1/audio/speech" => {
            ([(header::CONTENT_TYPE, "audio/mpeg")], Bytes::from_static(b"ID3-audio")).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": { "message": "Incorrect API key provided" } })),
    )
        .into_response()
}

async fn rate_limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", "7")],
        Json(json!({ "error": { "message": "Slow down" } })),
    )
        .into_response()
}

async fn mock_openai(recorder: Recorder) -> String {
    serve(Router::new().fallback(openai).with_state(recorder)).await
}

#[tokio::test]
async fn test_send_message_round_trip() {
    let recorder = Recorder::default();
    let base = mock_openai(recorder.clone()).await;
    let session = local_session(EventSink::disabled()).await;
    session
        .endpoints
        .add(openai_endpoint(&format!("{}/v1", base), "sk-test"))
        .await
        .unwrap();

    let reply = session
        .pipeline
        .send_message("Hello there", Vec::new())
        .await
        .unwrap();
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.content, "Echo: Hello there");

    let calls = recorder.to_path("/v1/chat/completions");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].authorization.as_deref(), Some("Bearer sk-test"));
    let body = calls[0].json();
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["stream"], false);
    // The default temperature is left to the server
    assert!(body.get("temperature").is_none());
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.first().unwrap()["role"], "system");
    assert_eq!(messages.last().unwrap()["role"], "user");
    assert_eq!(messages.last().unwrap()["content"], "Hello there");

    let conv = session.conversations.selected().unwrap();
    assert_eq!(conv.title, "Hello there");
    assert_eq!(conv.messages.len(), 3);
}

#[tokio::test]
async fn test_streamed_reply_emits_tokens() {
    let recorder = Recorder::default();
    let base = mock_openai(recorder.clone()).await;
    let (events, mut rx) = EventSink::channel();
    let session = local_session(events).await;
    session
        .endpoints
        .add(openai_endpoint(&format!("{}/v1", base), "sk-test"))
        .await
        .unwrap();
    let mut settings = session.settings().await;
    settings.stream_responses = true;
    session.save_settings(&settings).await.unwrap();

    let reply = session.pipeline.send_message("Hi", Vec::new()).await.unwrap();
    assert_eq!(reply.content, "Hello");
    assert_eq!(recorder.to_path("/v1/chat/completions")[0].json()["stream"], true);

    let mut tokens = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ChatEvent::Token { delta, .. } = event {
            tokens.push(delta);
        }
    }
    assert_eq!(tokens, vec!["Hel".to_string(), "lo".to_string()]);
}

#[tokio::test]
async fn test_model_listing() {
    let recorder = Recorder::default();
    let base = mock_openai(recorder.clone()).await;
    let session = local_session(EventSink::disabled()).await;
    session
        .endpoints
        .add(openai_endpoint(&format!("{}/v1/", base), "sk-test"))
        .await
        .unwrap();

    assert_eq!(session.endpoints.fetch_models().await, vec!["gpt-4o", "dall-e-3"]);
    assert_eq!(
        session.endpoints.fetch_image_models().await.unwrap(),
        vec!["dall-e-3"]
    );
    assert!(recorder
        .to_path("/v1/models")
        .iter()
        .all(|r| r.authorization.as_deref() == Some("Bearer sk-test")));
}

#[tokio::test]
async fn test_model_listing_falls_back_when_unreachable() {
    let session = local_session(EventSink::disabled()).await;
    session
        .endpoints
        .add(openai_endpoint("http://127.0.0.1:1/v1", "sk-test"))
        .await
        .unwrap();

    let models = session.endpoints.fetch_models().await;
    assert_eq!(models, FALLBACK_MODELS.to_vec());
    assert!(session.endpoints.fetch_image_models().await.is_err());
}

#[tokio::test]
async fn test_image_generation_request() {
    let recorder = Recorder::default();
    let base = mock_openai(recorder.clone()).await;
    let session = local_session(EventSink::disabled()).await;
    session
        .endpoints
        .add(openai_endpoint(&format!("{}/v1", base), "sk-test"))
        .await
        .unwrap();

    let url = session
        .images
        .generate("A cat", Some("dogs"), "dall-e-3", ImageSize::Landscape)
        .await
        .unwrap();
    assert_eq!(url, "https://images.example/cat.png");

    let body = recorder.to_path("/v1/images/generations")[0].json();
    assert_eq!(body["prompt"], "A cat. Avoid: dogs");
    assert_eq!(body["size"], "1792x1024");
    assert_eq!(body["model"], "dall-e-3");
    assert_eq!(body["n"], 1);
}

#[tokio::test]
async fn test_speech_uses_configured_voice() {
    let recorder = Recorder::default();
    let base = mock_openai(recorder.clone()).await;
    let session = local_session(EventSink::disabled()).await;
    session
        .endpoints
        .add(openai_endpoint(&format!("{}/v1", base), "sk-test"))
        .await
        .unwrap();

    let audio = session.speech.synthesize("Read this", None).await.unwrap();
    assert_eq!(&audio[..], b"ID3-audio");
    let body = recorder.to_path("/v1/audio/speech")[0].json();
    assert_eq!(body["model"], "tts-1");
    assert_eq!(body["voice"], "alloy");
    assert_eq!(body["input"], "Read this");

    session.speech.synthesize("Again", Some("nova")).await.unwrap();
    assert_eq!(recorder.to_path("/v1/audio/speech")[1].json()["voice"], "nova");
}

#[tokio::test]
async fn test_auth_failure_is_recorded_as_error_reply() {
    let base = serve(Router::new().fallback(unauthorized)).await;
    let (events, mut rx) = EventSink::channel();
    let session = local_session(events).await;
    session
        .endpoints
        .add(openai_endpoint(&format!("{}/v1", base), "sk-wrong"))
        .await
        .unwrap();

    let result = session.pipeline.send_message("Hello", Vec::new()).await;
    assert!(matches!(
        result,
        Err(PipelineError::Provider(ProviderError::AuthError(_)))
    ));

    let conv = session.conversations.selected().unwrap();
    let last = conv.messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.content.starts_with("Error: Authentication failed"));

    let mut saw_error_notice = false;
    while let Ok(event) = rx.try_recv() {
        if let ChatEvent::Notice { severity: Severity::Error, .. } = event {
            saw_error_notice = true;
        }
    }
    assert!(saw_error_notice);
}

#[tokio::test]
async fn test_rate_limit_reports_retry_after() {
    let base = serve(Router::new().fallback(rate_limited)).await;
    let session = local_session(EventSink::disabled()).await;
    session
        .endpoints
        .add(openai_endpoint(&format!("{}/v1", base), "sk-test"))
        .await
        .unwrap();

    let result = session
        .images
        .generate("A cat", None, "dall-e-3", ImageSize::Square)
        .await;
    assert!(matches!(
        result,
        Err(PipelineError::Provider(ProviderError::RateLimited {
            retry_after_secs: Some(7)
        }))
    ));
}
