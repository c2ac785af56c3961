// mock_storage_server: A mock storage query endpoint for testing the backfill
// poller.
//
// Serves every GET on http://127.0.0.1:<port>/..., records the path, the
// `last` query parameter and the Authorization header, and answers from a
// queue of canned (status, body) responses.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};

/// One request observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub path: String,
    /// Value of the `last=<duration>` query parameter, if present.
    pub last: Option<String>,
    /// Raw `Authorization` header, if present.
    pub authorization: Option<String>,
}

struct StorageState {
    queued: VecDeque<(u16, String)>,
    default_response: (u16, String),
    delay: Option<Duration>,
    requests: Vec<RecordedRequest>,
}

/// A mock storage query endpoint.
///
/// Binds to port 0 (random). Responses are served from the queue in order;
/// once the queue is empty every request gets the default response
/// (`200` with an empty body unless changed).
pub struct MockStorageServer {
    addr: SocketAddr,
    state: Arc<Mutex<StorageState>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockStorageServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(StorageState {
            queued: VecDeque::new(),
            default_response: (200, String::new()),
            delay: None,
            requests: Vec::new(),
        }));

        let app = Router::new()
            .fallback(handle_request)
            .with_state(state.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://127.0.0.1:<port>`, suitable as the poller's base URL.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Queue one response; queued responses are served before the default.
    pub fn push_response(&self, status: u16, body: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .queued
            .push_back((status, body.into()));
    }

    /// Response served once the queue is empty.
    pub fn set_default_response(&self, status: u16, body: impl Into<String>) {
        self.state.lock().unwrap().default_response = (status, body.into());
    }

    /// Delay every response by `delay` (used to hold a poll in flight).
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }
}

async fn handle_request(
    State(state): State<Arc<Mutex<StorageState>>>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let (status, body, delay) = {
        let mut guard = state.lock().unwrap();
        guard.requests.push(RecordedRequest {
            path: uri.path().to_owned(),
            last: params.get("last").cloned(),
            authorization: headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
        });
        let (status, body) = match guard.queued.pop_front() {
            Some(next) => next,
            None => guard.default_response.clone(),
        };
        (status, body, guard.delay)
    };

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}
