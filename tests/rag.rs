mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};

use chatllm::models::PendingFile;
use chatllm::services::rag::{NO_CONTEXT_NOTE, RETRIEVAL_FAILED_NOTE};
use chatllm::services::{ChatSession, EventSink};

use common::{local_session, rag_endpoint, serve, Recorder};

#[derive(Clone)]
struct Services {
    recorder: Recorder,
    next_document: Arc<AtomicU64>,
    retrieval_down: bool,
}

async fn services(
    State(state): State<Services>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = state.recorder.record(method, &uri, &headers, body);
    match request.path.as_str() {
        "/rag/documents" => {
            let id = state.next_document.fetch_add(1, Ordering::SeqCst);
            Json(json!({ "id": id, "status": "indexed" })).into_response()
        }
        "/rag/retrieve" if state.retrieval_down => {
            (StatusCode::INTERNAL_SERVER_ERROR, "index unavailable").into_response()
        }
        "/rag/retrieve" => Json(json!({
            "chunks": [{ "text": "Paris is the capital of France.", "source": "facts.txt", "distance": 0.25 }]
        }))
        .into_response(),
        "/v1/chat/completions" => Json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "Noted." } }]
        }))
        .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn rag_session(retrieval_down: bool) -> (Recorder, ChatSession) {
    let recorder = Recorder::default();
    let state = Services {
        recorder: recorder.clone(),
        next_document: Arc::new(AtomicU64::new(1)),
        retrieval_down,
    };
    let base = serve(Router::new().fallback(services).with_state(state)).await;
    let session = local_session(EventSink::disabled()).await;
    session
        .endpoints
        .add(rag_endpoint(&format!("{}/v1", base), &format!("{}/rag", base)))
        .await
        .unwrap();
    (recorder, session)
}

fn text_file(name: &str, text: &str) -> PendingFile {
    PendingFile::new(name, "text/plain", text.as_bytes().to_vec())
}

fn last_chat_messages(recorder: &Recorder) -> Vec<Value> {
    let calls = recorder.to_path("/v1/chat/completions");
    let body = calls.last().expect("a chat request").json();
    body["messages"].as_array().cloned().unwrap_or_default()
}

fn last_retrieve_body(recorder: &Recorder) -> Value {
    recorder
        .to_path("/rag/retrieve")
        .last()
        .expect("a retrieve request")
        .json()
}

#[tokio::test]
async fn test_retrieved_context_is_sent_before_history() {
    let (recorder, session) = rag_session(false).await;

    session
        .pipeline
        .send_message(
            "What is the capital?",
            vec![text_file("facts.txt", "Paris is the capital of France.")],
        )
        .await
        .unwrap();

    let uploads = recorder.to_path("/rag/documents");
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].text().contains("filename=\"facts.txt\""));

    let retrieve = last_retrieve_body(&recorder);
    assert_eq!(retrieve["query"], "What is the capital?");
    assert_eq!(retrieve["document_ids"], json!(["1"]));
    assert_eq!(retrieve["top_k"], 3);

    let messages = last_chat_messages(&recorder);
    assert_eq!(messages[0]["role"], "system");
    let context = messages[0]["content"].as_str().unwrap();
    assert!(context.contains("[Source: facts.txt, Distance: 0.2500]\nParis is the capital of France."));
    assert_eq!(messages.last().unwrap()["content"], "What is the capital?");

    let conv = session.conversations.selected().unwrap();
    assert_eq!(conv.rag_document_ids, vec!["1".to_string()]);
}

#[tokio::test]
async fn test_documents_are_scoped_to_their_conversation() {
    let (recorder, session) = rag_session(false).await;

    session
        .pipeline
        .send_message("First", vec![text_file("a.txt", "alpha")])
        .await
        .unwrap();
    let first = session.conversations.selected_id().unwrap();

    let second = session.conversations.create().await.unwrap();
    session
        .pipeline
        .send_message("Second", vec![text_file("b.txt", "beta")])
        .await
        .unwrap();
    assert_eq!(last_retrieve_body(&recorder)["document_ids"], json!(["2"]));

    // Later turns keep using the documents uploaded earlier in the same conversation
    session.pipeline.send_message("And again?", Vec::new()).await.unwrap();
    assert_eq!(last_retrieve_body(&recorder)["document_ids"], json!(["2"]));

    session.conversations.select(&first).await.unwrap();
    session.pipeline.send_message("Back to the first", Vec::new()).await.unwrap();
    assert_eq!(last_retrieve_body(&recorder)["document_ids"], json!(["1"]));

    assert_eq!(
        session.conversations.get(&second.id).unwrap().rag_document_ids,
        vec!["2".to_string()]
    );
}

#[tokio::test]
async fn test_no_documents_skips_retrieval() {
    let (recorder, session) = rag_session(false).await;

    session.pipeline.send_message("Hello", Vec::new()).await.unwrap();

    assert!(recorder.to_path("/rag/retrieve").is_empty());
    let messages = last_chat_messages(&recorder);
    assert_eq!(messages[0]["content"], NO_CONTEXT_NOTE);
}

#[tokio::test]
async fn test_retrieval_failure_still_answers() {
    let (recorder, session) = rag_session(true).await;

    let reply = session
        .pipeline
        .send_message("Summarize", vec![text_file("notes.txt", "some notes")])
        .await
        .unwrap();
    assert_eq!(reply.content, "Noted.");

    let messages = last_chat_messages(&recorder);
    assert_eq!(messages[0]["content"], RETRIEVAL_FAILED_NOTE);
}
