#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Uri};
use axum::Router;
use serde_json::Value;

use chatllm::config::AppConfig;
use chatllm::models::{NewEndpoint, ProviderKind, RagSettings};
use chatllm::providers::ProviderRouter;
use chatllm::services::{ChatSession, Database, EventSink, LocalStore};

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock server");
    });
    format!("http://{}", addr)
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Recorded {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("request body is JSON")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Requests seen by a mock server, in arrival order.
#[derive(Clone, Default)]
pub struct Recorder {
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    pub fn record(&self, method: Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> Recorded {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let recorded = Recorded {
            method,
            path: uri.path().to_string(),
            authorization: header("authorization"),
            content_type: header("content-type"),
            body,
        };
        self.requests.lock().unwrap().push(recorded.clone());
        recorded
    }

    pub fn all(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn to_path(&self, path: &str) -> Vec<Recorded> {
        self.all().into_iter().filter(|r| r.path == path).collect()
    }
}

/// A session on an in-memory database with local conversation storage.
pub async fn local_session(events: EventSink) -> ChatSession {
    let db = Database::new_in_memory().expect("in-memory database");
    let router = Arc::new(ProviderRouter::with_defaults(None));
    let repo = Arc::new(LocalStore::new(db.clone()));
    ChatSession::open_with(AppConfig::default(), db, router, repo, events)
        .await
        .expect("open session")
}

pub fn openai_endpoint(base_url: &str, api_key: &str) -> NewEndpoint {
    NewEndpoint {
        name: "Mock".to_string(),
        kind: ProviderKind::OpenAi,
        base_url: base_url.to_string(),
        api_key: api_key.to_string(),
        model: "gpt-4o".to_string(),
        rag: None,
    }
}

pub fn rag_endpoint(base_url: &str, rag_url: &str) -> NewEndpoint {
    NewEndpoint {
        rag: Some(RagSettings {
            top_k: 3,
            ..RagSettings::new(rag_url)
        }),
        ..openai_endpoint(base_url, "sk-test")
    }
}
